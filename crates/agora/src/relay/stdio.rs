//! Line-delimited JSON gateway over stdin/stdout.
//!
//! A platform adapter process feeds events on our stdin, one JSON object per
//! line, and executes the `send` commands we print on stdout:
//!
//! ```text
//! <- {"type":"message_posted","channel_id":"c1","author":{"id":"u1","name":"ana"},"content":"hi"}
//! -> {"op":"send","channel_id":"c2","content":"**ana** (from <#c1>):\nhi"}
//! ```

use std::io::BufRead;
use std::thread;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::events::RelayEvent;
use super::gateway::{ChatGateway, SendError};
use crate::hub::ChannelId;

/// Complete lines waiting for the writer task.
const WRITE_QUEUE_DEPTH: usize = 64;

#[derive(Serialize)]
struct SendCommand<'a> {
    op: &'static str,
    channel_id: &'a ChannelId,
    content: &'a str,
}

struct WriteRequest {
    line: Vec<u8>,
    ack: oneshot::Sender<std::io::Result<()>>,
}

/// Gateway writing send commands as JSON lines.
///
/// A single writer task owns the output. `send` hands it a complete line and
/// waits for the write to finish; cancelling `send` never cuts a line short,
/// the writer always finishes the line it has started.
pub struct StdioGateway {
    self_id: String,
    requests: mpsc::Sender<WriteRequest>,
}

impl StdioGateway {
    /// Gateway writing to the process stdout. Must be called inside a runtime.
    pub fn stdout(self_id: impl Into<String>) -> Self {
        Self::spawn(self_id, tokio::io::stdout())
    }

    /// Start the writer task over `writer`. Must be called inside a runtime.
    pub fn spawn<W>(self_id: impl Into<String>, writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (requests, queue) = mpsc::channel(WRITE_QUEUE_DEPTH);
        tokio::spawn(write_lines(writer, queue));
        Self {
            self_id: self_id.into(),
            requests,
        }
    }
}

async fn write_lines<W>(mut writer: W, mut queue: mpsc::Receiver<WriteRequest>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(request) = queue.recv().await {
        let result = write_line(&mut writer, &request.line).await;
        if let Err(err) = &result {
            warn!(error = %err, "failed to write send command");
        }
        // The sender may have given up waiting; the line is written regardless.
        let _ = request.ack.send(result);
    }
    debug!("send queue closed, writer stopped");
}

async fn write_line<W: AsyncWrite + Unpin>(out: &mut W, line: &[u8]) -> std::io::Result<()> {
    out.write_all(line).await?;
    out.flush().await
}

#[async_trait]
impl ChatGateway for StdioGateway {
    fn self_id(&self) -> &str {
        &self.self_id
    }

    async fn send(&self, channel: &ChannelId, content: &str) -> Result<(), SendError> {
        let command = SendCommand {
            op: "send",
            channel_id: channel,
            content,
        };
        let mut line = serde_json::to_vec(&command).map_err(|e| SendError::Failed {
            channel: channel.clone(),
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        let (ack, written) = oneshot::channel();
        self.requests
            .send(WriteRequest { line, ack })
            .await
            .map_err(|_| SendError::Closed)?;

        match written.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => Err(SendError::Closed),
            Ok(Err(e)) => Err(SendError::Failed {
                channel: channel.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(SendError::Closed),
        }
    }
}

/// Read JSON event lines from `reader` and forward them to `events`.
///
/// Blocking; run it on its own thread (see [`spawn_stdin_reader`]). Blank and
/// malformed lines are skipped. Returns the number of events forwarded when
/// the input ends or the receiver is dropped.
pub fn read_events<R: BufRead>(
    reader: R,
    events: mpsc::Sender<RelayEvent>,
) -> std::io::Result<u64> {
    let mut forwarded = 0u64;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event = match serde_json::from_str::<RelayEvent>(trimmed) {
            Ok(event) => event,
            Err(err) => {
                warn!(line = index + 1, error = %err, "skipping malformed event");
                continue;
            }
        };
        debug!(kind = event.kind(), origin = %event.origin(), "received event");
        if events.blocking_send(event).is_err() {
            debug!("event receiver dropped");
            return Ok(forwarded);
        }
        forwarded += 1;
    }

    info!("event input closed");
    Ok(forwarded)
}

/// Read events from stdin on a dedicated OS thread.
///
/// A blocked stdin read cannot be cancelled, so it stays off the runtime;
/// the thread is left behind at shutdown and ends with the process.
pub fn spawn_stdin_reader(
    events: mpsc::Sender<RelayEvent>,
) -> std::io::Result<thread::JoinHandle<std::io::Result<u64>>> {
    thread::Builder::new()
        .name("agora-stdin".to_string())
        .spawn(move || read_events(std::io::stdin().lock(), events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    async fn read_lines(reader: DuplexStream, count: usize) -> Vec<serde_json::Value> {
        let mut lines = BufReader::new(reader).lines();
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let line = lines.next_line().await.unwrap().unwrap();
            values.push(serde_json::from_str(&line).unwrap());
        }
        values
    }

    #[tokio::test]
    async fn test_send_writes_json_line() {
        let (writer, reader) = tokio::io::duplex(1024);
        let gateway = StdioGateway::spawn("relay", writer);
        gateway
            .send(&"c2".into(), "**ana** (from <#c1>):\nhi")
            .await
            .unwrap();

        let values = read_lines(reader, 1).await;
        assert_eq!(
            values[0],
            serde_json::json!({
                "op": "send",
                "channel_id": "c2",
                "content": "**ana** (from <#c1>):\nhi",
            })
        );
    }

    #[tokio::test]
    async fn test_cancelled_send_does_not_corrupt_next_line() {
        let (writer, reader) = tokio::io::duplex(16);
        let gateway = StdioGateway::spawn("relay", writer);
        let long = "x".repeat(64);

        // Nobody drains the pipe yet, so this send stalls mid-line.
        let stalled = tokio::time::timeout(
            Duration::from_millis(50),
            gateway.send(&"c1".into(), &long),
        )
        .await;
        assert!(stalled.is_err());

        let collector = tokio::spawn(read_lines(reader, 2));
        gateway.send(&"c2".into(), "ok").await.unwrap();

        let values = collector.await.unwrap();
        assert_eq!(values[0]["channel_id"], "c1");
        assert_eq!(values[0]["content"], long.as_str());
        assert_eq!(values[1]["channel_id"], "c2");
        assert_eq!(values[1]["content"], "ok");
    }

    #[tokio::test]
    async fn test_send_after_output_closed_fails() {
        let (writer, reader) = tokio::io::duplex(16);
        drop(reader);
        let gateway = StdioGateway::spawn("relay", writer);

        let err = gateway.send(&"c1".into(), "hi").await.unwrap_err();
        assert!(
            matches!(err, SendError::Closed | SendError::Failed { .. }),
            "{err:?}"
        );
    }

    #[test]
    fn test_read_events_skips_malformed_lines() {
        let input = concat!(
            r#"{"type":"message_posted","channel_id":"c1","author":{"id":"u1","name":"ana"},"content":"hi"}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"type":"reaction_added","guild_id":"g1","channel_id":"c1","message_id":"m1","user":{"id":"u2","name":"bo"},"emoji":"👍"}"#,
            "\n",
        );
        let (tx, mut rx) = mpsc::channel(8);

        let forwarded = read_events(input.as_bytes(), tx).unwrap();

        assert_eq!(forwarded, 2);
        assert_eq!(rx.try_recv().unwrap().kind(), "message_posted");
        assert_eq!(rx.try_recv().unwrap().kind(), "reaction_added");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_read_events_stops_when_receiver_dropped() {
        let line = r#"{"type":"message_posted","channel_id":"c1","author":{"id":"u1","name":"ana"},"content":"hi"}"#;
        let input = format!("{line}\n{line}\n{line}\n");
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        let forwarded = read_events(input.as_bytes(), tx).unwrap();
        assert_eq!(forwarded, 0);
    }
}
