//! Fan-out of one inbound event to the other channels of its hub.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, instrument, warn};

use super::events::RelayEvent;
use super::format;
use super::gateway::{ChatGateway, SendError};
use crate::hub::{ChannelId, GetHubOfChannelParams, Hub, HubId, HubService};
use crate::settings::TimeoutSettings;
use crate::store::{StoreError, StoreResult};

/// Time bounds and retry policy for dispatching.
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// Bound on one send to one channel.
    pub send_timeout: Duration,
    /// Bound on the whole event, lookup and fan-out included.
    pub event_deadline: Duration,
    /// Attempts for the hub lookup when the store is unavailable.
    pub lookup_attempts: u32,
    /// Delay before the first lookup retry; doubles on each attempt.
    pub initial_backoff: Duration,
}

impl DispatchConfig {
    pub fn from_settings(timeouts: &TimeoutSettings) -> Self {
        Self {
            send_timeout: timeouts.send(),
            event_deadline: timeouts.event_deadline(),
            ..Self::default()
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let timeouts = TimeoutSettings::default();
        Self {
            send_timeout: timeouts.send(),
            event_deadline: timeouts.event_deadline(),
            lookup_attempts: 3,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

/// Result of sending to one target channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub channel_id: ChannelId,
    pub result: Result<(), SendError>,
}

/// Per-target results of one fan-out, in membership order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    pub hub_id: HubId,
    pub deliveries: Vec<Delivery>,
}

impl FanoutReport {
    pub fn delivered(&self) -> usize {
        self.deliveries.iter().filter(|d| d.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.deliveries.len() - self.delivered()
    }
}

/// What happened to one inbound event.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Authored by the relay itself.
    Ignored,
    /// Origin channel belongs to no hub.
    Unrouted,
    Relayed(FanoutReport),
    /// Hub lookup failed.
    Failed(StoreError),
}

/// Routes inbound events to the other members of the origin's hub.
pub struct RelayDispatcher {
    hubs: HubService,
    gateway: Arc<dyn ChatGateway>,
    config: DispatchConfig,
}

impl RelayDispatcher {
    pub fn new(hubs: HubService, gateway: Arc<dyn ChatGateway>, config: DispatchConfig) -> Self {
        Self {
            hubs,
            gateway,
            config,
        }
    }

    /// Relay `event` to every channel of its hub except the origin.
    ///
    /// Sends run concurrently; a failed send never affects its siblings.
    /// Sends still pending at the event deadline are reported as
    /// `SendError::TimedOut`.
    #[instrument(skip(self, event), fields(kind = event.kind(), origin = %event.origin()))]
    pub async fn dispatch(&self, event: &RelayEvent) -> DispatchOutcome {
        let self_id = self.gateway.self_id();
        if !self_id.is_empty() && event.author().id == self_id {
            debug!("ignoring event authored by the relay");
            return DispatchOutcome::Ignored;
        }

        let deadline = Instant::now() + self.config.event_deadline;
        let hub = match self.lookup_hub(event.origin(), deadline).await {
            Ok(hub) => hub,
            Err(err) if err.is_not_found() => {
                debug!("origin channel is not in any hub");
                return DispatchOutcome::Unrouted;
            }
            Err(err) => return DispatchOutcome::Failed(err),
        };

        let content = format::render(event);
        let report = self.fan_out(&hub, event.origin(), &content, deadline).await;
        debug!(
            hub_id = %report.hub_id,
            delivered = report.delivered(),
            failed = report.failed(),
            "relayed event"
        );
        DispatchOutcome::Relayed(report)
    }

    async fn lookup_hub(&self, origin: &ChannelId, deadline: Instant) -> StoreResult<Hub> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let params = GetHubOfChannelParams {
                channel_id: origin.clone(),
            };
            let result = match timeout_at(deadline, self.hubs.get_hub_of_channel(params)).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::BackendUnavailable(
                    "event deadline elapsed during hub lookup".to_string(),
                )),
            };

            match result {
                Err(err) if err.is_retryable() && attempt < self.config.lookup_attempts => {
                    let Some(backoff) = self.backoff(attempt) else {
                        return Err(err);
                    };
                    if backoff >= deadline.saturating_duration_since(Instant::now()) {
                        return Err(err);
                    }
                    debug!(attempt, ?backoff, error = %err, "hub lookup failed; retrying");
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    /// Delay after failed attempt `attempt`, or `None` once it no longer fits
    /// in a `Duration`.
    fn backoff(&self, attempt: u32) -> Option<Duration> {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.config.initial_backoff.checked_mul(factor)
    }

    async fn fan_out(
        &self,
        hub: &Hub,
        origin: &ChannelId,
        content: &str,
        deadline: Instant,
    ) -> FanoutReport {
        let sends = hub
            .targets_excluding(origin)
            .map(|target| self.send_one(target, content, deadline));
        FanoutReport {
            hub_id: hub.id.clone(),
            deliveries: join_all(sends).await,
        }
    }

    async fn send_one(&self, target: &ChannelId, content: &str, deadline: Instant) -> Delivery {
        let send_deadline = (Instant::now() + self.config.send_timeout).min(deadline);
        let result = match timeout_at(send_deadline, self.gateway.send(target, content)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::TimedOut(target.clone())),
        };
        if let Err(err) = &result {
            warn!(channel_id = %target, error = %err, "relay send failed");
        }
        Delivery {
            channel_id: target.clone(),
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{AddChannelParams, AddHubParams, HubLimits};
    use crate::relay::events::{Author, PostedMessage};
    use crate::store::{HubStore, MemoryHubStore};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Sink {
        sent: Mutex<Vec<(ChannelId, String)>>,
    }

    #[async_trait]
    impl ChatGateway for Sink {
        fn self_id(&self) -> &str {
            "relay"
        }

        async fn send(&self, channel: &ChannelId, content: &str) -> Result<(), SendError> {
            self.sent
                .lock()
                .unwrap()
                .push((channel.clone(), content.to_string()));
            Ok(())
        }
    }

    /// Memory store whose reverse lookup is unavailable for the first calls.
    struct FlakyStore {
        inner: MemoryHubStore,
        failures_left: AtomicU32,
        lookups: AtomicU32,
    }

    #[async_trait]
    impl HubStore for FlakyStore {
        fn kind(&self) -> &'static str {
            "flaky"
        }
        async fn add_hub(&self, hub: Hub) -> StoreResult<()> {
            self.inner.add_hub(hub).await
        }
        async fn add_hub_capped(&self, hub: Hub, max: u64) -> StoreResult<()> {
            self.inner.add_hub_capped(hub, max).await
        }
        async fn delete_hub(&self, id: &HubId) -> StoreResult<bool> {
            self.inner.delete_hub(id).await
        }
        async fn get_hub(&self, id: &HubId) -> StoreResult<Hub> {
            self.inner.get_hub(id).await
        }
        async fn get_hubs(&self) -> StoreResult<Vec<Hub>> {
            self.inner.get_hubs().await
        }
        async fn add_channel(&self, h: &HubId, c: &ChannelId) -> StoreResult<()> {
            self.inner.add_channel(h, c).await
        }
        async fn add_channel_capped(&self, h: &HubId, c: &ChannelId, m: u64) -> StoreResult<()> {
            self.inner.add_channel_capped(h, c, m).await
        }
        async fn delete_channel(&self, h: &HubId, c: &ChannelId) -> StoreResult<bool> {
            self.inner.delete_channel(h, c).await
        }
        async fn get_hubs_count(&self) -> StoreResult<u64> {
            self.inner.get_hubs_count().await
        }
        async fn get_channels_count(&self, h: &HubId) -> StoreResult<u64> {
            self.inner.get_channels_count(h).await
        }
        async fn get_hub_of_channel(&self, c: &ChannelId) -> StoreResult<Hub> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_left.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::BackendUnavailable("connection refused".into()));
            }
            self.inner.get_hub_of_channel(c).await
        }
    }

    fn message(channel: &str, author_id: &str) -> RelayEvent {
        RelayEvent::MessagePosted(PostedMessage {
            channel_id: channel.into(),
            author: Author {
                id: author_id.to_string(),
                name: "ana".to_string(),
            },
            content: "hi".to_string(),
            attachments: vec![],
        })
    }

    fn fast_config() -> DispatchConfig {
        DispatchConfig {
            send_timeout: Duration::from_secs(1),
            event_deadline: Duration::from_secs(5),
            lookup_attempts: 3,
            initial_backoff: Duration::from_millis(5),
        }
    }

    async fn flaky_dispatcher(failures: u32) -> (Arc<FlakyStore>, Arc<Sink>, RelayDispatcher) {
        flaky_dispatcher_with(failures, fast_config()).await
    }

    async fn flaky_dispatcher_with(
        failures: u32,
        config: DispatchConfig,
    ) -> (Arc<FlakyStore>, Arc<Sink>, RelayDispatcher) {
        let store = Arc::new(FlakyStore {
            inner: MemoryHubStore::new(),
            failures_left: AtomicU32::new(failures),
            lookups: AtomicU32::new(0),
        });
        let service = HubService::new(store.clone(), HubLimits::default(), Duration::from_secs(1));
        service
            .add_hub(AddHubParams {
                hub: Hub::with_id("hub_a".into(), "owner", "a"),
            })
            .await
            .unwrap();
        for channel in ["c1", "c2"] {
            service
                .add_channel(AddChannelParams {
                    hub_id: "hub_a".into(),
                    channel_id: channel.into(),
                })
                .await
                .unwrap();
        }
        let sink = Arc::new(Sink::default());
        let dispatcher = RelayDispatcher::new(service, sink.clone(), config);
        (store, sink, dispatcher)
    }

    #[tokio::test]
    async fn test_unavailable_lookup_is_retried() {
        let (store, sink, dispatcher) = flaky_dispatcher(2).await;

        let outcome = dispatcher.dispatch(&message("c1", "u1")).await;

        assert!(matches!(outcome, DispatchOutcome::Relayed(ref r) if r.delivered() == 1));
        assert_eq!(store.lookups.load(Ordering::SeqCst), 3);
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_gives_up_after_bounded_attempts() {
        let (store, sink, dispatcher) = flaky_dispatcher(10).await;

        let outcome = dispatcher.dispatch(&message("c1", "u1")).await;

        assert!(matches!(
            outcome,
            DispatchOutcome::Failed(StoreError::BackendUnavailable(_))
        ));
        assert_eq!(store.lookups.load(Ordering::SeqCst), 3);
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_many_lookup_attempts_do_not_overflow_backoff() {
        let config = DispatchConfig {
            lookup_attempts: 100,
            initial_backoff: Duration::ZERO,
            ..fast_config()
        };
        let (store, sink, dispatcher) = flaky_dispatcher_with(1000, config).await;

        let outcome = dispatcher.dispatch(&message("c1", "u1")).await;

        assert!(matches!(
            outcome,
            DispatchOutcome::Failed(StoreError::BackendUnavailable(_))
        ));
        assert_eq!(store.lookups.load(Ordering::SeqCst), 100);
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    fn dispatcher_with_backoff(initial_backoff: Duration) -> RelayDispatcher {
        let service = HubService::new(
            Arc::new(MemoryHubStore::new()),
            HubLimits::default(),
            Duration::from_secs(1),
        );
        let config = DispatchConfig {
            initial_backoff,
            ..fast_config()
        };
        RelayDispatcher::new(service, Arc::new(Sink::default()), config)
    }

    #[test]
    fn test_backoff_saturates() {
        let dispatcher = dispatcher_with_backoff(Duration::from_secs(1));
        assert_eq!(dispatcher.backoff(1), Some(Duration::from_secs(1)));
        assert_eq!(dispatcher.backoff(4), Some(Duration::from_secs(8)));
        assert_eq!(
            dispatcher.backoff(40),
            Some(Duration::from_secs(u64::from(u32::MAX)))
        );

        let dispatcher = dispatcher_with_backoff(Duration::MAX);
        assert_eq!(dispatcher.backoff(1), Some(Duration::MAX));
        assert_eq!(dispatcher.backoff(2), None);
    }

    #[tokio::test]
    async fn test_own_messages_are_ignored() {
        let (store, sink, dispatcher) = flaky_dispatcher(0).await;

        let outcome = dispatcher.dispatch(&message("c1", "relay")).await;

        assert!(matches!(outcome, DispatchOutcome::Ignored));
        assert_eq!(store.lookups.load(Ordering::SeqCst), 0);
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_report_counts() {
        let report = FanoutReport {
            hub_id: "hub_a".into(),
            deliveries: vec![
                Delivery {
                    channel_id: "c1".into(),
                    result: Ok(()),
                },
                Delivery {
                    channel_id: "c2".into(),
                    result: Err(SendError::Closed),
                },
            ],
        };
        assert_eq!(report.delivered(), 1);
        assert_eq!(report.failed(), 1);
    }
}
