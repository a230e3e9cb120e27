//! Background tasks that keep the queue moving without a caller.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use crate::cache::CacheStore;
use crate::config::QueueConfig;
use crate::queue::ActionQueue;

/// Drain the queue on every offline → online transition seen after
/// `online` was subscribed.
pub fn spawn_network_listener(queue: Arc<ActionQueue>, mut online: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while online.changed().await.is_ok() {
            if *online.borrow_and_update() {
                info!("Back online, syncing queued actions");
                queue.process_queue().await;
            } else {
                info!("Offline, actions will be queued locally");
            }
        }
        debug!("Network monitor dropped, listener exiting");
    })
}

/// Periodic cleanup plus the retry poller.
///
/// Both tickers fire once immediately, so start-up gets a cleanup pass
/// and a drain of anything already due.
pub fn spawn_maintenance(queue: Arc<ActionQueue>, store: Arc<CacheStore>, config: &QueueConfig) -> JoinHandle<()> {
    let cleanup_every = config.cleanup_interval();
    let retry_every = config.retry_poll();

    tokio::spawn(async move {
        let mut cleanup = time::interval(cleanup_every);
        let mut retry_poll = time::interval(retry_every);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        retry_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cleanup.tick() => {
                    let items = queue.cleanup_old_items();
                    let entries = store.clean_expired_cache();
                    if items + entries > 0 {
                        debug!("Maintenance removed {} queue items and {} cache entries", items, entries);
                    }
                }
                _ = retry_poll.tick() => {
                    if queue.has_due_items() {
                        queue.process_queue().await;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOptions;
    use crate::clock::ManualClock;
    use crate::network::NetworkMonitor;
    use crate::queue::{Action, ActionOptions, QueueEvent, SyncHandler};
    use crate::storage::MemoryBackend;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Action>>,
    }

    #[async_trait]
    impl SyncHandler for Recorder {
        async fn sync(&self, action: &Action) -> Result<()> {
            self.calls.lock().unwrap().push(action.clone());
            Ok(())
        }
    }

    fn setup(
        online: bool,
    ) -> (
        Arc<ActionQueue>,
        tokio::sync::mpsc::UnboundedReceiver<QueueEvent>,
        Arc<Recorder>,
        Arc<NetworkMonitor>,
        Arc<CacheStore>,
    ) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(CacheStore::new(
            Box::new(MemoryBackend::new()),
            CacheOptions::default(),
            clock.clone(),
        ));
        let handler = Arc::new(Recorder::default());
        let network = Arc::new(NetworkMonitor::new(online));
        let config = QueueConfig {
            item_delay_ms: 0,
            ..QueueConfig::default()
        };
        let (queue, events) = ActionQueue::new(store.clone(), handler.clone(), network.clone(), clock, config);
        (Arc::new(queue), events, handler, network, store)
    }

    async fn wait_for_drain(events: &mut tokio::sync::mpsc::UnboundedReceiver<QueueEvent>) {
        let wait = async {
            while let Some(event) = events.recv().await {
                if matches!(event, QueueEvent::DrainFinished(_)) {
                    return;
                }
            }
        };
        time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("drain did not finish");
    }

    #[tokio::test]
    async fn test_reconnect_drains_offline_actions() {
        let (queue, mut events, handler, network, _store) = setup(false);
        let listener = spawn_network_listener(queue.clone(), network.subscribe());

        queue.add_action(Action::ToggleFavorite { entry_id: 42 }, ActionOptions::default());
        assert_eq!(queue.items().len(), 1);

        network.set_online(true);
        wait_for_drain(&mut events).await;

        assert!(queue.items().is_empty());
        assert_eq!(
            *handler.calls.lock().unwrap(),
            vec![Action::ToggleFavorite { entry_id: 42 }]
        );
        listener.abort();
    }

    #[tokio::test]
    async fn test_maintenance_drains_due_items() {
        let (queue, mut events, handler, _network, store) = setup(true);
        queue.add_action(
            Action::DeleteEntry { entry_id: 1 },
            ActionOptions {
                sync_now: false,
                ..ActionOptions::default()
            },
        );

        let config = QueueConfig {
            retry_poll_secs: 1,
            ..QueueConfig::default()
        };
        let task = spawn_maintenance(queue.clone(), store, &config);
        wait_for_drain(&mut events).await;

        assert!(queue.items().is_empty());
        assert_eq!(handler.calls.lock().unwrap().len(), 1);
        task.abort();
    }
}
