//! Rotation and expiry timers
//!
//! One timer per active platform forces a rotation every interval,
//! whether or not the current session is near expiry. A separate sweep
//! timer retires expired store rows and purges stale cache entries.
//! Each timer body runs inside its own task, so firings of the same
//! timer never overlap.

use crate::manager::SessionManager;
use std::sync::{Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Owns the background timer tasks for a session manager.
#[derive(Default)]
pub struct RotationScheduler {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RotationScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the per-platform rotation timer. Holds only a weak
    /// reference to the manager; the task exits once the manager is
    /// gone.
    pub fn start_rotation(
        &self,
        manager: Weak<SessionManager>,
        platform: String,
        interval: Duration,
    ) {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately; rotation waits a full period
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };

                match manager.rotate_session(&platform).await {
                    Ok(session) => {
                        debug!(platform = %platform, session_id = %session.id, "Scheduled rotation")
                    }
                    Err(e) => {
                        warn!(platform = %platform, error = %e, "Scheduled rotation failed")
                    }
                }
            }
        });

        self.track(handle);
    }

    /// Spawn the expiry sweep timer.
    pub fn start_sweep(&self, manager: Weak<SessionManager>, interval: Duration) {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };

                if let Err(e) = manager.run_expiry_sweep().await {
                    warn!(error = %e, "Expiry sweep failed");
                }
            }
        });

        self.track(handle);
    }

    /// Abort every timer task.
    pub fn shutdown(&self) {
        let handles = match self.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect::<Vec<_>>(),
            Err(_) => return,
        };
        for handle in handles {
            handle.abort();
        }
    }

    pub fn timer_count(&self) -> usize {
        self.handles.lock().map(|h| h.len()).unwrap_or(0)
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut handles) = self.handles.lock() {
            handles.push(handle);
        }
    }
}
