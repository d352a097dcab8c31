// crates/db/src/queries/search.rs
//! Full-text search over message bodies and reasoning text.
//!
//! The FTS5 shadow table is maintained by triggers (see migrations), so a
//! MATCH here always reflects the current `messages` rows. Bare tokens are
//! AND-matched, double-quoted phrases are exact.

use crate::{Database, DbResult};
use serde::Serialize;
use sqlx::FromRow;

/// Default number of hits.
const DEFAULT_LIMIT: i64 = 20;
/// Hard cap on hits.
const MAX_LIMIT: i64 = 200;

/// One ranked search hit.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SearchHit {
    pub session_id: String,
    pub slug: Option<String>,
    pub project: Option<String>,
    pub message_uuid: String,
    pub role: String,
    pub snippet: String,
    pub timestamp: String,
}

impl Database {
    /// Ranked full-text search with optional project and time-range filters.
    ///
    /// An empty or unparseable query returns no hits rather than an error.
    pub async fn search_messages(
        &self,
        query: &str,
        project: Option<&str>,
        after: Option<&str>,
        before: Option<&str>,
        limit: Option<i64>,
    ) -> DbResult<Vec<SearchHit>> {
        let Some(match_expr) = build_match_query(query) else {
            return Ok(Vec::new());
        };
        let limit = limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

        let mut sql = String::from(
            r#"
            SELECT m.session_id, s.slug, s.project,
                   m.uuid AS message_uuid, m.role,
                   snippet(messages_fts, -1, '<mark>', '</mark>', '…', 12) AS snippet,
                   m.timestamp
            FROM messages_fts
            JOIN messages m ON messages_fts.rowid = m.rowid
            JOIN sessions s ON m.session_id = s.session_id
            WHERE messages_fts MATCH ?
            "#,
        );
        if project.is_some() {
            sql.push_str(" AND s.project = ?");
        }
        if after.is_some() {
            sql.push_str(" AND m.timestamp >= ?");
        }
        if before.is_some() {
            sql.push_str(" AND m.timestamp <= ?");
        }
        sql.push_str(" ORDER BY rank LIMIT ?");

        let mut q = sqlx::query_as::<_, SearchHit>(&sql).bind(match_expr);
        if let Some(project) = project {
            q = q.bind(project);
        }
        if let Some(after) = after {
            q = q.bind(after);
        }
        if let Some(before) = before {
            q = q.bind(before);
        }
        let rows = q.bind(limit).fetch_all(self.pool()).await;

        // A syntactically hostile query should read as "no results", not 500.
        match rows {
            Ok(rows) => Ok(rows),
            Err(e) => {
                tracing::warn!(query, error = %e, "FTS query failed");
                Ok(Vec::new())
            }
        }
    }
}

/// Translate a user query into an FTS5 MATCH expression.
///
/// Double-quoted spans become exact phrases; everything else splits on
/// whitespace into AND-matched terms. Each term is re-quoted so FTS5
/// operators in user input stay inert.
pub fn build_match_query(query: &str) -> Option<String> {
    let mut terms: Vec<String> = Vec::new();
    let mut rest = query.trim();

    while let Some(start) = rest.find('"') {
        // Tokens before the opening quote.
        for token in rest[..start].split_whitespace() {
            terms.push(quote_term(token));
        }
        let after = &rest[start + 1..];
        match after.find('"') {
            Some(end) => {
                let phrase = after[..end].trim();
                if !phrase.is_empty() {
                    terms.push(quote_term(phrase));
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unbalanced quote: treat the remainder as bare tokens.
                for token in after.split_whitespace() {
                    terms.push(quote_term(token));
                }
                rest = "";
            }
        }
    }
    for token in rest.split_whitespace() {
        terms.push(quote_term(token));
    }

    terms.retain(|t| t != "\"\"");
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

fn quote_term(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_tokens_are_and_matched() {
        assert_eq!(
            build_match_query("parser error").as_deref(),
            Some("\"parser\" \"error\"")
        );
    }

    #[test]
    fn quoted_phrase_is_kept_whole() {
        assert_eq!(
            build_match_query(r#"fix "race condition" bus"#).as_deref(),
            Some("\"fix\" \"race condition\" \"bus\"")
        );
    }

    #[test]
    fn unbalanced_quote_degrades_to_tokens() {
        assert_eq!(
            build_match_query(r#"hello "world"#).as_deref(),
            Some("\"hello\" \"world\"")
        );
    }

    #[test]
    fn empty_query_is_none() {
        assert!(build_match_query("").is_none());
        assert!(build_match_query("   ").is_none());
        assert!(build_match_query("\"\"").is_none());
    }

    #[test]
    fn operators_in_input_are_inert() {
        assert_eq!(
            build_match_query("NEAR OR AND").as_deref(),
            Some("\"NEAR\" \"OR\" \"AND\"")
        );
    }
}
