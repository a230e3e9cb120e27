//! Connectivity tracking.
//!
//! The queue only asks "are we online right now?"; the scheduler also wants
//! to be woken on transitions, which the watch channel provides.

use tokio::sync::watch;
use tracing::info;

pub trait NetworkStatus: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Online/offline flag with change notification.
pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    /// Record the current connectivity. Returns true if it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            info!("Network is now {}", if online { "online" } else { "offline" });
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl NetworkStatus for NetworkMonitor {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }
}
