// crates/db/src/queries/mod.rs
//! Read-only projections over the index, consumed by the HTTP layer and the
//! background loops. Everything here tolerates concurrent writes; readers
//! see transaction-consistent snapshots under WAL.

pub mod analytics;
pub mod dashboard;
pub mod push;
pub mod search;
pub mod sessions;
