// crates/server/src/state.rs
//! Application state shared by all route handlers.
//!
//! Every collaborator is constructor-injected; the composition root in
//! `main.rs` wires them exactly once.

use crate::bus::EventBus;
use crate::mux::MuxController;
use crate::procs::ProcessRegistry;
use claude_remote_core::RemoteConfig;
use claude_remote_db::Database;
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub config: RemoteConfig,
    pub db: Database,
    pub bus: EventBus,
    pub registry: Arc<ProcessRegistry>,
    pub mux: Arc<MuxController>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: RemoteConfig,
        db: Database,
        bus: EventBus,
        registry: Arc<ProcessRegistry>,
        mux: Arc<MuxController>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            db,
            bus,
            registry,
            mux,
            start_time: Instant::now(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
