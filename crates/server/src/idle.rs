// crates/server/src/idle.rs
//! The "needs input" detector.
//!
//! An assistant that wrote a final message and then went quiet is,
//! operationally, waiting for the user. Every 15 seconds the detector
//! scans sessions active in the last 24 hours whose final message is
//! assistant-role; once the silence passes the idle threshold it publishes
//! `needs_input` on the global topic, at most once per cooldown window per
//! session. A user message resets that session's cooldown.

use crate::bus::{EventBus, RemoteEvent, GLOBAL_TOPIC};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use claude_remote_core::RemoteConfig;
use claude_remote_db::Database;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Scan cadence.
const SCAN_INTERVAL: Duration = Duration::from_secs(15);

/// Only sessions active within this window are scanned.
const ACTIVITY_WINDOW_HOURS: i64 = 24;

pub struct IdleDetector {
    db: Database,
    bus: EventBus,
    threshold: ChronoDuration,
    cooldown: ChronoDuration,
    /// session id → when a needs_input was last published for it.
    last_published: HashMap<String, DateTime<Utc>>,
}

impl IdleDetector {
    pub fn new(db: Database, bus: EventBus, config: &RemoteConfig) -> Self {
        Self {
            db,
            bus,
            threshold: ChronoDuration::from_std(config.idle_threshold)
                .unwrap_or_else(|_| ChronoDuration::seconds(30)),
            cooldown: ChronoDuration::from_std(config.idle_cooldown)
                .unwrap_or_else(|_| ChronoDuration::minutes(5)),
            last_published: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(SCAN_INTERVAL);
        info!("idle detector started");
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.scan(Utc::now()).await {
                        // Recoverable by construction; the next tick retries.
                        warn!(error = %e, "idle scan failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("idle detector stopped");
                    return;
                }
            }
        }
    }

    /// One scan pass at wall-clock `now`. Returns how many `needs_input`
    /// events were published.
    pub async fn scan(&mut self, now: DateTime<Utc>) -> Result<usize, claude_remote_db::DbError> {
        let cutoff = (now - ChronoDuration::hours(ACTIVITY_WINDOW_HOURS))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let candidates = self.db.idle_candidates(&cutoff).await?;

        let mut published = 0;
        for candidate in candidates {
            if candidate.last_role != "assistant" {
                // The user answered; the session earns a fresh signal next
                // time the assistant goes quiet.
                self.last_published.remove(&candidate.session_id);
                continue;
            }

            let Ok(last_ts) = DateTime::parse_from_rfc3339(&candidate.last_timestamp) else {
                debug!(
                    session_id = %candidate.session_id,
                    raw = %candidate.last_timestamp,
                    "unparseable last-message timestamp"
                );
                continue;
            };
            let idle = now.signed_duration_since(last_ts.with_timezone(&Utc));
            if idle < self.threshold {
                continue;
            }

            if let Some(last) = self.last_published.get(&candidate.session_id) {
                if now.signed_duration_since(*last) < self.cooldown {
                    continue;
                }
            }

            self.bus.publish(
                GLOBAL_TOPIC,
                RemoteEvent::NeedsInput {
                    session_id: candidate.session_id.clone(),
                    slug: candidate.slug.clone(),
                    last_message_preview: candidate.preview.clone(),
                    idle_seconds: idle.num_seconds().max(0) as u64,
                },
            );
            self.last_published.insert(candidate.session_id, now);
            published += 1;
        }
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use claude_remote_core::parser::parse_lines;

    fn at(secs_past: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 6, 6, 46, 55).unwrap() + ChronoDuration::seconds(secs_past)
    }

    async fn seeded_detector() -> (IdleDetector, Database, EventBus) {
        let db = Database::open_in_memory().await.unwrap();
        let bus = EventBus::new();
        let config = RemoteConfig::for_tests(std::path::PathBuf::new(), std::path::PathBuf::new());
        let detector = IdleDetector::new(db.clone(), bus.clone(), &config);
        (detector, db, bus)
    }

    async fn ingest(db: &Database, lines: &[&str]) {
        let lines: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
        let batch = parse_lines("A", &lines, at(0));
        db.apply_batch("/root/a.jsonl", "A", &batch, 1_000, 0, at(0))
            .await
            .unwrap();
    }

    /// Seed a session whose last message is the assistant's at 06:46:55.
    async fn seed_assistant_last(db: &Database) {
        ingest(
            db,
            &[
                r#"{"type":"user","sessionId":"A","uuid":"u1","timestamp":"2026-02-06T06:46:54Z","message":{"content":"hello"}}"#,
                r#"{"type":"assistant","sessionId":"A","uuid":"a1","slug":"demo","timestamp":"2026-02-06T06:46:55Z","message":{"content":"hi there"}}"#,
            ],
        )
        .await;
    }

    // One needs_input after the threshold, then cooldown silence,
    // then a user message clears the cooldown.
    #[tokio::test]
    async fn idle_detection_fires_once_with_cooldown() {
        let (mut detector, db, bus) = seeded_detector().await;
        seed_assistant_last(&db).await;
        let mut sub = bus.subscribe(GLOBAL_TOPIC);

        // Under the 30s threshold: silent.
        assert_eq!(detector.scan(at(20)).await.unwrap(), 0);

        // 35s of silence: exactly one event.
        assert_eq!(detector.scan(at(35)).await.unwrap(), 1);
        match sub.try_recv().expect("needs_input expected") {
            RemoteEvent::NeedsInput {
                session_id,
                slug,
                last_message_preview,
                idle_seconds,
            } => {
                assert_eq!(session_id, "A");
                assert_eq!(slug.as_deref(), Some("demo"));
                assert_eq!(last_message_preview, "hi there");
                assert_eq!(idle_seconds, 35);
            }
            other => panic!("expected needs_input, got {other:?}"),
        }

        // 30s later: cooldown holds.
        assert_eq!(detector.scan(at(65)).await.unwrap(), 0);
        assert!(sub.try_recv().is_none());

        // After the 5-minute cooldown expires, the signal repeats.
        assert_eq!(detector.scan(at(35 + 301)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn user_reply_clears_cooldown() {
        let (mut detector, db, bus) = seeded_detector().await;
        seed_assistant_last(&db).await;
        let mut sub = bus.subscribe(GLOBAL_TOPIC);

        assert_eq!(detector.scan(at(35)).await.unwrap(), 1);
        let _ = sub.try_recv();

        // The user answers at +40s; last role flips to user.
        ingest(
            &db,
            &[r#"{"type":"user","sessionId":"A","uuid":"u2","timestamp":"2026-02-06T06:47:35Z","message":{"content":"go on"}}"#],
        )
        .await;
        assert_eq!(detector.scan(at(45)).await.unwrap(), 0);

        // The assistant replies; 35s of silence later a fresh signal fires
        // even though the old cooldown window has not elapsed.
        ingest(
            &db,
            &[r#"{"type":"assistant","sessionId":"A","uuid":"a2","timestamp":"2026-02-06T06:47:40Z","message":{"content":"done"}}"#],
        )
        .await;
        assert_eq!(detector.scan(at(45 + 40)).await.unwrap(), 1);
        assert!(matches!(
            sub.try_recv(),
            Some(RemoteEvent::NeedsInput { last_message_preview, .. }) if last_message_preview == "done"
        ));
    }

    #[tokio::test]
    async fn sessions_outside_activity_window_are_ignored() {
        let (mut detector, db, _bus) = seeded_detector().await;
        seed_assistant_last(&db).await;

        // 25 hours later the session no longer qualifies.
        assert_eq!(detector.scan(at(25 * 3600)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn user_last_sessions_never_signal() {
        let (mut detector, db, _bus) = seeded_detector().await;
        ingest(
            &db,
            &[r#"{"type":"user","sessionId":"A","uuid":"u1","timestamp":"2026-02-06T06:46:54Z","message":{"content":"waiting on you, assistant"}}"#],
        )
        .await;
        assert_eq!(detector.scan(at(120)).await.unwrap(), 0);
    }
}
