// crates/db/src/queries/analytics.rs
//! Token and tool rollups for the analytics endpoints.

use crate::{Database, DbResult};
use claude_remote_core::pricing::estimate_cost;
use serde::Serialize;
use std::collections::BTreeMap;

/// Bucketing axis for token rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupGroup {
    Day,
    Project,
}

/// One bucket of the token rollup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenBucket {
    pub label: String,
    pub input: i64,
    pub output: i64,
    pub cache_read: i64,
    pub cache_create: i64,
    pub cost_estimate: f64,
}

/// One tool's share of invocations over a period.
#[derive(Debug, Clone, Serialize)]
pub struct ToolShare {
    pub name: String,
    pub count: i64,
    pub percentage: f64,
}

impl Database {
    /// Token totals grouped by day or project over sessions active since
    /// `since`. Costs are summed per session with that session's model, so a
    /// bucket mixing models prices each share correctly; day buckets come
    /// back in ascending label order, project buckets by output descending.
    pub async fn token_rollup(
        &self,
        since: &str,
        group: RollupGroup,
    ) -> DbResult<Vec<TokenBucket>> {
        let label_expr = match group {
            RollupGroup::Day => "SUBSTR(last_message_at, 1, 10)",
            RollupGroup::Project => "COALESCE(project, 'unknown')",
        };
        let sql = format!(
            r#"
            SELECT {label_expr} AS label, model,
                   total_input_tokens, total_output_tokens,
                   total_cache_read, total_cache_create
            FROM sessions
            WHERE last_message_at >= ?
            "#
        );

        let rows: Vec<(String, Option<String>, i64, i64, i64, i64)> = sqlx::query_as(&sql)
            .bind(since)
            .fetch_all(self.pool())
            .await?;

        let mut buckets: BTreeMap<String, TokenBucket> = BTreeMap::new();
        for (label, model, input, output, cache_read, cache_create) in rows {
            let bucket = buckets.entry(label.clone()).or_insert_with(|| TokenBucket {
                label,
                ..Default::default()
            });
            bucket.input += input;
            bucket.output += output;
            bucket.cache_read += cache_read;
            bucket.cache_create += cache_create;
            bucket.cost_estimate += estimate_cost(
                input.max(0) as u64,
                output.max(0) as u64,
                cache_read.max(0) as u64,
                cache_create.max(0) as u64,
                model.as_deref().unwrap_or(""),
            );
        }

        let mut out: Vec<TokenBucket> = buckets
            .into_values()
            .map(|mut b| {
                b.cost_estimate = (b.cost_estimate * 100.0).round() / 100.0;
                b
            })
            .collect();
        if group == RollupGroup::Project {
            out.sort_by(|a, b| b.output.cmp(&a.output));
        }
        Ok(out)
    }

    /// Tool invocation counts since `since`, with percentages summing to
    /// 100 up to rounding.
    pub async fn tool_rollup(&self, since: &str) -> DbResult<Vec<ToolShare>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT tool_name, COUNT(*) AS cnt
            FROM tool_uses
            WHERE timestamp >= ?
            GROUP BY tool_name
            ORDER BY cnt DESC
            "#,
        )
        .bind(since)
        .fetch_all(self.pool())
        .await?;

        let total: i64 = rows.iter().map(|(_, c)| c).sum();
        let total = total.max(1);

        Ok(rows
            .into_iter()
            .map(|(name, count)| ToolShare {
                name,
                count,
                percentage: (count as f64 / total as f64 * 1000.0).round() / 10.0,
            })
            .collect())
    }
}
