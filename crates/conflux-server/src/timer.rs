//! The periodic maintenance source: one tick per second drives
//! accounting rollover, upload-cap enforcement and ban sweeping.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::server::ServerState;

/// Spawns the maintenance tick. Stops when the server shuts down.
pub fn spawn(state: Arc<ServerState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                () = state.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let mut core = state.core.lock().await;
            core.tick(Instant::now());
            core.trace_status();
        }
    })
}
