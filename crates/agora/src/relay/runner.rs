//! Event loop driving the dispatcher.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::dispatcher::{DispatchOutcome, RelayDispatcher};
use super::events::RelayEvent;

/// Counters collected while the relay runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub relayed: u64,
    pub unrouted: u64,
    pub ignored: u64,
    pub failed: u64,
    pub failed_sends: u64,
    pub panicked: u64,
}

impl RelayStats {
    fn record(&mut self, joined: Result<DispatchOutcome, JoinError>) {
        match joined {
            Ok(DispatchOutcome::Relayed(report)) => {
                self.relayed += 1;
                let failed = report.failed() as u64;
                if failed > 0 {
                    warn!(
                        hub_id = %report.hub_id,
                        failed,
                        delivered = report.delivered(),
                        "relay completed with failed sends"
                    );
                }
                self.failed_sends += failed;
            }
            Ok(DispatchOutcome::Unrouted) => self.unrouted += 1,
            Ok(DispatchOutcome::Ignored) => self.ignored += 1,
            Ok(DispatchOutcome::Failed(err)) => {
                self.failed += 1;
                error!(error = %err, "failed to relay event");
            }
            Err(err) if err.is_panic() => {
                self.panicked += 1;
                error!(error = %err, "relay task panicked");
            }
            Err(err) => warn!(error = %err, "relay task cancelled"),
        }
    }
}

/// Dispatch events from `events` until the channel closes or `shutdown` fires.
///
/// Each event runs in its own task. On exit, in-flight events are awaited
/// before returning.
pub async fn run_relay(
    dispatcher: Arc<RelayDispatcher>,
    mut events: mpsc::Receiver<RelayEvent>,
    shutdown: CancellationToken,
) -> RelayStats {
    let mut tasks = JoinSet::new();
    let mut stats = RelayStats::default();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("shutdown requested, no longer accepting events");
                break;
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => stats.record(joined),
            next = events.recv() => match next {
                Some(event) => {
                    let dispatcher = dispatcher.clone();
                    tasks.spawn(async move { dispatcher.dispatch(&event).await });
                }
                None => {
                    info!("event stream closed");
                    break;
                }
            },
        }
    }

    if !tasks.is_empty() {
        info!(in_flight = tasks.len(), "waiting for in-flight events");
    }
    while let Some(joined) = tasks.join_next().await {
        stats.record(joined);
    }

    info!(
        relayed = stats.relayed,
        unrouted = stats.unrouted,
        failed = stats.failed,
        "relay stopped"
    );
    stats
}
