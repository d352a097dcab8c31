// crates/server/src/notify.rs
//! Push-notification dispatch for needs-input events.
//!
//! The dispatcher consumes `needs_input` from the global topic and hands
//! each registered subscription to an injected [`DeliveryPort`]; the core
//! speaks no push protocol of its own. Rate limits are belt-and-braces on
//! top of the idle detector's cooldown: one notification per session per
//! five minutes, and a global cap of port invocations per rolling hour.
//! A permanent delivery failure deletes the stale subscription record.

use crate::bus::{EventBus, RemoteEvent, GLOBAL_TOPIC};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use claude_remote_core::RemoteConfig;
use claude_remote_db::{Database, PushSubscriptionRow};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Per-session cooldown between notifications, in seconds.
const SESSION_COOLDOWN_SECS: i64 = 300;

/// Upper bound on one port call.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// What the port receives for one needs-input notification.
#[derive(Debug, Clone, Serialize)]
pub struct NeedsInputPayload {
    pub session_id: String,
    pub slug: Option<String>,
    pub last_message_preview: String,
    pub idle_seconds: u64,
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Worth retrying on a later notification; the subscription stays.
    Transient,
    /// The endpoint is gone; the subscription record is deleted.
    Permanent,
}

/// Injected delivery transport. Implementations translate the payload to
/// whatever push protocol the deployment uses.
#[async_trait]
pub trait DeliveryPort: Send + Sync {
    async fn deliver(
        &self,
        subscription: &PushSubscriptionRow,
        payload: &NeedsInputPayload,
    ) -> DeliveryOutcome;
}

/// Default port: logs the notification and claims success. Stands in until
/// a real push adapter is injected at the composition root.
pub struct LoggingDeliveryPort;

#[async_trait]
impl DeliveryPort for LoggingDeliveryPort {
    async fn deliver(
        &self,
        subscription: &PushSubscriptionRow,
        payload: &NeedsInputPayload,
    ) -> DeliveryOutcome {
        info!(
            endpoint = %subscription.endpoint,
            session_id = %payload.session_id,
            idle_seconds = payload.idle_seconds,
            "needs-input notification (logging port)"
        );
        DeliveryOutcome::Delivered
    }
}

pub struct NotificationDispatcher {
    db: Database,
    port: Arc<dyn DeliveryPort>,
    hourly_cap: usize,
    /// Timestamps of port invocations in the rolling hour.
    invocations: VecDeque<DateTime<Utc>>,
    /// session id → last notification time.
    per_session: HashMap<String, DateTime<Utc>>,
}

impl NotificationDispatcher {
    pub fn new(db: Database, port: Arc<dyn DeliveryPort>, config: &RemoteConfig) -> Self {
        Self {
            db,
            port,
            hourly_cap: config.notify_hourly_cap,
            invocations: VecDeque::new(),
            per_session: HashMap::new(),
        }
    }

    /// Consume needs-input events from the global topic until shutdown.
    /// If the subscription gets evicted by the per-topic cap, the
    /// dispatcher resubscribes rather than going deaf.
    pub async fn run(mut self, bus: EventBus, mut shutdown: watch::Receiver<bool>) {
        info!("notification dispatcher started");
        let mut events = bus.subscribe(GLOBAL_TOPIC);
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            if let Err(e) = self.handle(&event, Utc::now()).await {
                                warn!(error = %e, "notification dispatch failed");
                            }
                        }
                        None => {
                            warn!("notification dispatcher evicted from the bus; resubscribing");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            events = bus.subscribe(GLOBAL_TOPIC);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("notification dispatcher stopped");
                    return;
                }
            }
        }
    }

    /// Process one bus event at wall-clock `now`. Returns the number of
    /// port invocations made.
    pub async fn handle(
        &mut self,
        event: &RemoteEvent,
        now: DateTime<Utc>,
    ) -> Result<usize, claude_remote_db::DbError> {
        let RemoteEvent::NeedsInput {
            session_id,
            slug,
            last_message_preview,
            idle_seconds,
        } = event
        else {
            return Ok(0);
        };

        if let Some(last) = self.per_session.get(session_id) {
            if now.signed_duration_since(*last) < ChronoDuration::seconds(SESSION_COOLDOWN_SECS) {
                debug!(session_id, "suppressed by per-session cooldown");
                return Ok(0);
            }
        }

        let payload = NeedsInputPayload {
            session_id: session_id.clone(),
            slug: slug.clone(),
            last_message_preview: last_message_preview.clone(),
            idle_seconds: *idle_seconds,
        };

        let subscriptions = self.db.list_push_subscriptions().await?;
        let mut invoked = 0;

        for subscription in subscriptions {
            self.prune_invocations(now);
            if self.invocations.len() >= self.hourly_cap {
                warn!(cap = self.hourly_cap, "global notification cap reached");
                break;
            }
            self.invocations.push_back(now);
            invoked += 1;

            let outcome = tokio::time::timeout(
                DELIVERY_TIMEOUT,
                self.port.deliver(&subscription, &payload),
            )
            .await
            .unwrap_or(DeliveryOutcome::Transient);

            match outcome {
                DeliveryOutcome::Delivered => {}
                DeliveryOutcome::Transient => {
                    debug!(endpoint = %subscription.endpoint, "transient delivery failure");
                }
                DeliveryOutcome::Permanent => {
                    info!(endpoint = %subscription.endpoint, "deleting stale push subscription");
                    self.db.delete_push_subscription(&subscription.endpoint).await?;
                }
            }
        }

        if invoked > 0 {
            self.per_session.insert(session_id.clone(), now);
        }
        Ok(invoked)
    }

    fn prune_invocations(&mut self, now: DateTime<Utc>) {
        let hour_ago = now - ChronoDuration::hours(1);
        while matches!(self.invocations.front(), Some(ts) if *ts < hour_ago) {
            self.invocations.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn at(mins: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 6, 8, 0, 0).unwrap() + ChronoDuration::minutes(mins)
    }

    fn needs_input(sid: &str) -> RemoteEvent {
        RemoteEvent::NeedsInput {
            session_id: sid.into(),
            slug: None,
            last_message_preview: "waiting".into(),
            idle_seconds: 35,
        }
    }

    /// Scripted port: counts calls, pops outcomes from a queue.
    struct ScriptedPort {
        calls: AtomicUsize,
        outcomes: Mutex<VecDeque<DeliveryOutcome>>,
    }

    impl ScriptedPort {
        fn always(outcome: DeliveryOutcome) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcomes: Mutex::new(VecDeque::from(vec![outcome; 1024])),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeliveryPort for ScriptedPort {
        async fn deliver(
            &self,
            _subscription: &PushSubscriptionRow,
            _payload: &NeedsInputPayload,
        ) -> DeliveryOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(DeliveryOutcome::Delivered)
        }
    }

    async fn dispatcher_with(
        port: Arc<ScriptedPort>,
        endpoints: &[&str],
    ) -> (NotificationDispatcher, Database) {
        let db = Database::open_in_memory().await.unwrap();
        for endpoint in endpoints {
            db.save_push_subscription(endpoint, "key", "auth", "ua", at(0))
                .await
                .unwrap();
        }
        let config = RemoteConfig::for_tests(std::path::PathBuf::new(), std::path::PathBuf::new());
        let dispatcher = NotificationDispatcher::new(db.clone(), port, &config);
        (dispatcher, db)
    }

    #[tokio::test]
    async fn delivers_to_every_subscription() {
        let port = ScriptedPort::always(DeliveryOutcome::Delivered);
        let (mut dispatcher, _db) = dispatcher_with(port.clone(), &["ep1", "ep2"]).await;

        let n = dispatcher.handle(&needs_input("A"), at(0)).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(port.calls(), 2);
    }

    #[tokio::test]
    async fn non_needs_input_events_are_ignored() {
        let port = ScriptedPort::always(DeliveryOutcome::Delivered);
        let (mut dispatcher, _db) = dispatcher_with(port.clone(), &["ep1"]).await;

        let event = RemoteEvent::SessionStarted {
            session_id: "A".into(),
        };
        assert_eq!(dispatcher.handle(&event, at(0)).await.unwrap(), 0);
        assert_eq!(port.calls(), 0);
    }

    // Per-session cooldown: one notification per 5-minute window.
    #[tokio::test]
    async fn session_cooldown_limits_rate() {
        let port = ScriptedPort::always(DeliveryOutcome::Delivered);
        let (mut dispatcher, _db) = dispatcher_with(port.clone(), &["ep1"]).await;

        assert_eq!(dispatcher.handle(&needs_input("A"), at(0)).await.unwrap(), 1);
        assert_eq!(dispatcher.handle(&needs_input("A"), at(3)).await.unwrap(), 0);
        // A different session is not throttled by A's cooldown.
        assert_eq!(dispatcher.handle(&needs_input("B"), at(3)).await.unwrap(), 1);
        // After the window, A may notify again.
        assert_eq!(dispatcher.handle(&needs_input("A"), at(6)).await.unwrap(), 1);
    }

    // Global cap: at most N port invocations per rolling hour.
    #[tokio::test]
    async fn global_hourly_cap_limits_rate() {
        let port = ScriptedPort::always(DeliveryOutcome::Delivered);
        let (mut dispatcher, _db) = dispatcher_with(port.clone(), &["ep1"]).await;

        // Different sessions every 5 minutes: the first ten pass, the rest
        // land inside a full window.
        for i in 0..12 {
            let sid = format!("S{i}");
            dispatcher.handle(&needs_input(&sid), at(i * 5)).await.unwrap();
        }
        assert_eq!(port.calls(), 10, "cap is 10 per rolling hour");

        // 61 minutes after the first invocation the window has rolled.
        assert_eq!(
            dispatcher.handle(&needs_input("late"), at(61)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn permanent_failure_deletes_subscription() {
        let port = ScriptedPort::always(DeliveryOutcome::Permanent);
        let (mut dispatcher, db) = dispatcher_with(port.clone(), &["ep-stale"]).await;

        dispatcher.handle(&needs_input("A"), at(0)).await.unwrap();
        assert!(db.list_push_subscriptions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_keeps_subscription() {
        let port = ScriptedPort::always(DeliveryOutcome::Transient);
        let (mut dispatcher, db) = dispatcher_with(port.clone(), &["ep-flaky"]).await;

        dispatcher.handle(&needs_input("A"), at(0)).await.unwrap();
        assert_eq!(db.list_push_subscriptions().await.unwrap().len(), 1);
    }
}
