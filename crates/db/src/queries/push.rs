// crates/db/src/queries/push.rs
//! Push-subscription records. The dispatcher is the only writer.

use crate::{Database, DbResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// One registered push subscription. The key material is opaque to the
/// core; the delivery port knows what to do with it.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PushSubscriptionRow {
    pub endpoint: String,
    pub p256dh_key: String,
    pub auth_key: String,
    pub user_agent: String,
    pub created_at: String,
}

impl Database {
    /// Register (or refresh) a subscription, keyed by endpoint.
    pub async fn save_push_subscription(
        &self,
        endpoint: &str,
        p256dh_key: &str,
        auth_key: &str,
        user_agent: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO push_subscriptions (endpoint, p256dh_key, auth_key, user_agent, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(endpoint) DO UPDATE SET
                p256dh_key = excluded.p256dh_key,
                auth_key   = excluded.auth_key,
                user_agent = excluded.user_agent
            "#,
        )
        .bind(endpoint)
        .bind(p256dh_key)
        .bind(auth_key)
        .bind(user_agent)
        .bind(crate::ingest::fmt_ts(now))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// All registered subscriptions.
    pub async fn list_push_subscriptions(&self) -> DbResult<Vec<PushSubscriptionRow>> {
        let rows = sqlx::query_as::<_, PushSubscriptionRow>(
            "SELECT * FROM push_subscriptions ORDER BY created_at ASC",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Delete a subscription, typically after a permanent delivery failure.
    pub async fn delete_push_subscription(&self, endpoint: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM push_subscriptions WHERE endpoint = ?")
            .bind(endpoint)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
