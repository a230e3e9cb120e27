//! Offline action queue.
//!
//! Mutations made while offline (or that fail to sync) are persisted as
//! [`QueueItem`]s and replayed against the server later. Items drain in
//! priority order, failures back off exponentially, and an item that
//! exhausts its retries is parked as failed until the user retries it.
//!
//! The whole queue is persisted as one document after every mutation, so
//! the on-disk copy always reflects the in-memory one.

pub mod action;
pub mod item;

pub use action::{Action, ActionError, ACTION_NAMES};
pub use item::{generate_id, ItemStatus, Priority, QueueItem};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, QUEUE_KEY};
use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::network::NetworkStatus;

/// Replays one action against the server.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn sync(&self, action: &Action) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued { id: String, action: String },
    Synced { id: String, action: String },
    RetryScheduled { id: String, action: String, retries: u32, next_retry: i64 },
    Failed { id: String, action: String, error: String },
    Discarded { id: String, action: String, reason: String },
    DrainFinished(DrainSummary),
    Cleared { removed: usize },
    Cleanup { removed: usize },
}

#[derive(Debug, Clone)]
pub struct ActionOptions {
    pub priority: Priority,
    pub metadata: Option<Value>,
    /// Start a sync pass right away when online.
    pub sync_now: bool,
}

impl Default for ActionOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            metadata: None,
            sync_now: true,
        }
    }
}

/// Tally of one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    pub discarded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another pass is running; this one did nothing.
    AlreadyRunning,
    Offline,
    /// Nothing was due.
    Idle,
    Finished(DrainSummary),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSummary {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub processing: bool,
}

/// Clears the single-flight flag when a pass ends, however it ends.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ActionQueue {
    store: Arc<CacheStore>,
    handler: Arc<dyn SyncHandler>,
    network: Arc<dyn NetworkStatus>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    items: Mutex<Vec<QueueItem>>,
    processing: AtomicBool,
    event_tx: mpsc::UnboundedSender<QueueEvent>,
}

/// Load the persisted queue one item at a time. Records that no longer
/// parse are dropped on their own and the survivors written back.
fn restore_items(store: &CacheStore) -> Vec<QueueItem> {
    let Some(raw) = store.document::<Vec<Value>>(QUEUE_KEY) else {
        return Vec::new();
    };
    let total = raw.len();
    let items: Vec<QueueItem> = raw
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value(value) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("Dropping unreadable queue record {}: {}", index, e);
                None
            }
        })
        .collect();
    if items.len() < total && !store.put_document(QUEUE_KEY, &items) {
        warn!("Failed to rewrite action queue after dropping unreadable records");
    }
    items
}

impl ActionQueue {
    /// Create the queue, restoring any items persisted by a previous run.
    pub fn new(
        store: Arc<CacheStore>,
        handler: Arc<dyn SyncHandler>,
        network: Arc<dyn NetworkStatus>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> (Self, mpsc::UnboundedReceiver<QueueEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let items = restore_items(&store);
        if !items.is_empty() {
            info!("Restored {} queued actions", items.len());
        }

        let queue = Self {
            store,
            handler,
            network,
            clock,
            config,
            items: Mutex::new(items),
            processing: AtomicBool::new(false),
            event_tx,
        };
        (queue, event_rx)
    }

    fn lock_items(&self) -> MutexGuard<'_, Vec<QueueItem>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, items: &[QueueItem]) {
        if !self.store.put_document(QUEUE_KEY, items) {
            warn!("Failed to persist action queue; {} items held in memory only", items.len());
        }
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Queue `action` and return its id. Starts a sync pass in the
    /// background if online and `options.sync_now` is set.
    pub fn add_action(self: &Arc<Self>, action: Action, options: ActionOptions) -> String {
        let now = self.clock.now_ms();
        let item = {
            let mut items = self.lock_items();
            let mut id = generate_id(now);
            while items.iter().any(|i| i.id == id) {
                id = generate_id(now);
            }
            let item = QueueItem::new(id, &action, options.priority, options.metadata, now);
            items.push(item.clone());
            self.persist(&items);
            item
        };

        info!("Queued {} ({}, {} priority)", item.action, item.id, item.priority);
        self.emit(QueueEvent::Enqueued {
            id: item.id.clone(),
            action: item.action.clone(),
        });

        if options.sync_now && self.network.is_online() {
            self.spawn_drain();
        }
        item.id
    }

    /// Run a sync pass on the current tokio runtime without waiting for it.
    pub fn spawn_drain(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime; queued actions will sync on the next pass");
            return;
        };
        let queue = Arc::clone(self);
        handle.spawn(async move {
            queue.process_queue().await;
        });
    }

    pub fn remove_action(&self, id: &str) -> bool {
        let mut items = self.lock_items();
        let before = items.len();
        items.retain(|i| i.id != id);
        if items.len() == before {
            return false;
        }
        self.persist(&items);
        true
    }

    pub fn get_action(&self, id: &str) -> Option<QueueItem> {
        self.lock_items().iter().find(|i| i.id == id).cloned()
    }

    /// Apply `f` to one item and persist. The id cannot be changed.
    pub fn update_action<F: FnOnce(&mut QueueItem)>(&self, id: &str, f: F) -> bool {
        let mut items = self.lock_items();
        let Some(item) = items.iter_mut().find(|i| i.id == id) else {
            return false;
        };
        f(item);
        item.id = id.to_string();
        self.persist(&items);
        true
    }

    /// Snapshot of every item in drain order.
    pub fn items(&self) -> Vec<QueueItem> {
        let mut items = self.lock_items().clone();
        items.sort_by(QueueItem::drain_order);
        items
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn get_summary(&self) -> QueueSummary {
        let items = self.lock_items();
        let count = |status: ItemStatus| items.iter().filter(|i| i.status == status).count();
        QueueSummary {
            total: items.len(),
            pending: count(ItemStatus::Pending),
            completed: count(ItemStatus::Completed),
            failed: count(ItemStatus::Failed),
            processing: self.is_processing(),
        }
    }

    /// Whether any pending item is ready to be sent now.
    pub fn has_due_items(&self) -> bool {
        let now = self.clock.now_ms();
        self.lock_items().iter().any(|i| i.is_due(now))
    }

    pub fn clear_completed(&self) -> usize {
        self.clear_where(|i| i.status == ItemStatus::Completed)
    }

    pub fn clear_failed(&self) -> usize {
        self.clear_where(|i| i.status == ItemStatus::Failed)
    }

    pub fn clear_all(&self) -> usize {
        self.clear_where(|_| true)
    }

    fn clear_where<P: Fn(&QueueItem) -> bool>(&self, pred: P) -> usize {
        let removed = {
            let mut items = self.lock_items();
            let before = items.len();
            items.retain(|i| !pred(i));
            let removed = before - items.len();
            if removed > 0 {
                self.persist(&items);
            }
            removed
        };
        if removed > 0 {
            info!("Cleared {} queued actions", removed);
            self.emit(QueueEvent::Cleared { removed });
        }
        removed
    }

    /// Move every failed item back to pending with a fresh retry budget.
    pub fn reset_failed(&self) -> usize {
        let mut items = self.lock_items();
        let mut reset = 0;
        for item in items.iter_mut().filter(|i| i.status == ItemStatus::Failed) {
            item.reset();
            reset += 1;
        }
        if reset > 0 {
            self.persist(&items);
            info!("Reset {} failed actions for retry", reset);
        }
        reset
    }

    /// [`reset_failed`](Self::reset_failed), then sync in the background
    /// if online.
    pub fn retry_failed(self: &Arc<Self>) -> usize {
        let reset = self.reset_failed();
        if reset > 0 && self.network.is_online() {
            self.spawn_drain();
        }
        reset
    }

    /// Drop finished items older than the retention window. Pending items
    /// are kept however old they are.
    pub fn cleanup_old_items(&self) -> usize {
        let retention_ms = i64::try_from(self.config.retention().as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now_ms().saturating_sub(retention_ms);
        let removed = {
            let mut items = self.lock_items();
            let before = items.len();
            items.retain(|i| i.status == ItemStatus::Pending || i.timestamp >= cutoff);
            let removed = before - items.len();
            if removed > 0 {
                self.persist(&items);
            }
            removed
        };
        if removed > 0 {
            info!("Cleaned up {} old queued actions", removed);
            self.emit(QueueEvent::Cleanup { removed });
        }
        removed
    }

    /// Send every due item to the server, highest priority first.
    ///
    /// Only one pass runs at a time; concurrent calls return
    /// [`DrainOutcome::AlreadyRunning`]. The pass stops early if the
    /// network drops.
    pub async fn process_queue(&self) -> DrainOutcome {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync pass already running");
            return DrainOutcome::AlreadyRunning;
        }
        let _guard = ProcessingGuard(&self.processing);

        if !self.network.is_online() {
            debug!("Offline, skipping sync pass");
            return DrainOutcome::Offline;
        }

        let batch: Vec<String> = {
            let now = self.clock.now_ms();
            let items = self.lock_items();
            let mut due: Vec<&QueueItem> = items.iter().filter(|i| i.is_due(now)).collect();
            due.sort_by(|a, b| QueueItem::drain_order(a, b));
            due.into_iter().map(|i| i.id.clone()).collect()
        };
        if batch.is_empty() {
            return DrainOutcome::Idle;
        }

        info!("Syncing {} queued actions", batch.len());
        let mut summary = DrainSummary::default();
        for (n, id) in batch.iter().enumerate() {
            if n > 0 && !self.config.item_delay().is_zero() {
                tokio::time::sleep(self.config.item_delay()).await;
            }
            if !self.network.is_online() {
                info!("Connection lost, pausing sync with {} actions left", batch.len() - n);
                break;
            }
            // May have been removed or retried by someone else meanwhile
            let Some(item) = self.get_action(id) else {
                continue;
            };
            if item.status != ItemStatus::Pending {
                continue;
            }
            self.sync_item(item, &mut summary).await;
        }

        info!(
            "Sync pass finished: {} synced, {} retrying, {} failed, {} discarded",
            summary.succeeded, summary.retried, summary.failed, summary.discarded
        );
        self.emit(QueueEvent::DrainFinished(summary));
        DrainOutcome::Finished(summary)
    }

    async fn sync_item(&self, item: QueueItem, summary: &mut DrainSummary) {
        let action = match item.decode() {
            Ok(action) => action,
            Err(e) => {
                warn!("Discarding queued action {}: {}", item.id, e);
                self.remove_action(&item.id);
                summary.discarded += 1;
                self.emit(QueueEvent::Discarded {
                    id: item.id,
                    action: item.action,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let now = self.clock.now_ms();
        self.update_action(&item.id, |i| i.last_attempt = Some(now));

        match self.handler.sync(&action).await {
            Ok(()) => {
                self.complete(&item.id);
                summary.succeeded += 1;
                debug!("Synced {} ({})", item.action, item.id);
                self.emit(QueueEvent::Synced {
                    id: item.id,
                    action: item.action,
                });
            }
            Err(e) => {
                if let Some(event) = self.record_failure(&item.id, &e) {
                    match event {
                        QueueEvent::RetryScheduled { .. } => summary.retried += 1,
                        _ => summary.failed += 1,
                    }
                    self.emit(event);
                }
            }
        }
    }

    /// Completed items leave the queue immediately.
    fn complete(&self, id: &str) {
        let mut items = self.lock_items();
        if let Some(item) = items.iter_mut().find(|i| i.id == id) {
            item.status = ItemStatus::Completed;
        }
        items.retain(|i| i.status != ItemStatus::Completed);
        self.persist(&items);
    }

    /// Schedule a retry, or mark failed once the budget is spent.
    fn record_failure(&self, id: &str, error: &anyhow::Error) -> Option<QueueEvent> {
        let now = self.clock.now_ms();
        let message = format!("{error:#}");
        let mut items = self.lock_items();
        let item = items.iter_mut().find(|i| i.id == id)?;

        let event = if item.retries < self.config.max_retries {
            item.retries += 1;
            let next_retry = now + self.config.retry_delay(item.retries).as_millis() as i64;
            item.next_retry = Some(next_retry);
            item.error = Some(message);
            warn!(
                "Sync of {} ({}) failed, retry {}/{} in {}ms: {}",
                item.action,
                item.id,
                item.retries,
                self.config.max_retries,
                next_retry - now,
                error
            );
            QueueEvent::RetryScheduled {
                id: item.id.clone(),
                action: item.action.clone(),
                retries: item.retries,
                next_retry,
            }
        } else {
            item.status = ItemStatus::Failed;
            item.next_retry = None;
            item.failed_at = Some(now);
            item.error = Some(message.clone());
            warn!("Giving up on {} ({}) after {} retries: {}", item.action, item.id, item.retries, error);
            QueueEvent::Failed {
                id: item.id.clone(),
                action: item.action.clone(),
                error: message,
            }
        };
        self.persist(&items);
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOptions;
    use crate::clock::ManualClock;
    use crate::network::NetworkMonitor;
    use crate::storage::MemoryBackend;
    use anyhow::bail;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    const START: i64 = 1_700_000_000_000;

    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<Action>>,
        failing: AtomicBool,
        gate: Option<Semaphore>,
    }

    impl RecordingHandler {
        fn failing() -> Self {
            Self {
                failing: AtomicBool::new(true),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<Action> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyncHandler for RecordingHandler {
        async fn sync(&self, action: &Action) -> Result<()> {
            self.calls.lock().unwrap().push(action.clone());
            if let Some(gate) = &self.gate {
                gate.acquire().await?.forget();
            }
            if self.failing.load(Ordering::SeqCst) {
                bail!("HTTP 500 Internal Server Error");
            }
            Ok(())
        }
    }

    struct Harness {
        queue: Arc<ActionQueue>,
        events: mpsc::UnboundedReceiver<QueueEvent>,
        handler: Arc<RecordingHandler>,
        network: Arc<NetworkMonitor>,
        clock: Arc<ManualClock>,
        store: Arc<CacheStore>,
    }

    fn config() -> QueueConfig {
        QueueConfig {
            item_delay_ms: 0,
            ..QueueConfig::default()
        }
    }

    fn harness_with(handler: RecordingHandler, store: Option<Arc<CacheStore>>) -> Harness {
        let clock = Arc::new(ManualClock::new(START));
        let store = store.unwrap_or_else(|| {
            Arc::new(CacheStore::new(
                Box::new(MemoryBackend::new()),
                CacheOptions::default(),
                clock.clone(),
            ))
        });
        let handler = Arc::new(handler);
        let network = Arc::new(NetworkMonitor::new(false));
        let (queue, events) = ActionQueue::new(
            store.clone(),
            handler.clone(),
            network.clone(),
            clock.clone(),
            config(),
        );
        Harness {
            queue: Arc::new(queue),
            events,
            handler,
            network,
            clock,
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingHandler::default(), None)
    }

    fn deferred(priority: Priority) -> ActionOptions {
        ActionOptions {
            priority,
            sync_now: false,
            ..ActionOptions::default()
        }
    }

    fn favorite(entry_id: u64) -> Action {
        Action::ToggleFavorite { entry_id }
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<QueueEvent>) -> Vec<QueueEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_enqueue_while_offline_then_sync() {
        let mut h = harness();
        let id = h.queue.add_action(favorite(42), ActionOptions::default());

        let item = h.queue.get_action(&id).unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.retries, 0);
        assert_eq!(item.timestamp, START);
        assert_eq!(h.queue.process_queue().await, DrainOutcome::Offline);
        assert!(h.handler.calls().is_empty());

        h.network.set_online(true);
        let outcome = h.queue.process_queue().await;

        assert_eq!(
            outcome,
            DrainOutcome::Finished(DrainSummary {
                succeeded: 1,
                ..DrainSummary::default()
            })
        );
        assert_eq!(h.handler.calls(), vec![favorite(42)]);
        assert!(h.queue.items().is_empty());

        let events = drain_events(&mut h.events);
        assert!(matches!(events[0], QueueEvent::Enqueued { .. }));
        assert!(matches!(&events[1], QueueEvent::Synced { action, .. } if action == "toggle_favorite"));
        assert!(matches!(events[2], QueueEvent::DrainFinished(_)));
    }

    #[tokio::test]
    async fn test_drains_in_priority_then_age_order() {
        let h = harness();
        h.queue.add_action(favorite(1), deferred(Priority::Low));
        h.clock.advance(Duration::from_millis(1));
        h.queue.add_action(favorite(2), deferred(Priority::High));
        h.clock.advance(Duration::from_millis(1));
        h.queue.add_action(favorite(3), deferred(Priority::Normal));
        h.clock.advance(Duration::from_millis(1));
        h.queue.add_action(favorite(4), deferred(Priority::Normal));

        h.network.set_online(true);
        h.queue.process_queue().await;

        let order: Vec<_> = h.handler.calls().iter().filter_map(Action::entry_id).collect();
        assert_eq!(order, vec![2, 3, 4, 1]);
    }

    #[tokio::test]
    async fn test_backoff_then_failed() {
        let mut h = harness_with(RecordingHandler::failing(), None);
        h.network.set_online(true);
        let id = h.queue.add_action(favorite(7), deferred(Priority::Normal));

        for (attempt, delay_secs) in [(1u32, 2u64), (2, 4), (3, 8)] {
            let outcome = h.queue.process_queue().await;
            assert!(matches!(outcome, DrainOutcome::Finished(s) if s.retried == 1));

            let item = h.queue.get_action(&id).unwrap();
            assert_eq!(item.status, ItemStatus::Pending);
            assert_eq!(item.retries, attempt);
            let now = h.clock.now_ms();
            assert_eq!(item.next_retry, Some(now + delay_secs as i64 * 1000));
            assert_eq!(item.last_attempt, Some(now));
            assert!(item.error.as_deref().unwrap().contains("HTTP 500"));

            // Not due until the backoff elapses
            assert_eq!(h.queue.process_queue().await, DrainOutcome::Idle);
            assert!(!h.queue.has_due_items());
            h.clock.advance(Duration::from_secs(delay_secs));
            assert!(h.queue.has_due_items());
        }

        let outcome = h.queue.process_queue().await;
        assert!(matches!(outcome, DrainOutcome::Finished(s) if s.failed == 1));
        let item = h.queue.get_action(&id).unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.failed_at, Some(h.clock.now_ms()));
        assert!(item.next_retry.is_none());
        assert_eq!(h.handler.calls().len(), 4);
        assert!(!h.queue.has_due_items());

        let failed = drain_events(&mut h.events)
            .into_iter()
            .filter(|e| matches!(e, QueueEvent::Failed { .. }))
            .count();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn test_retry_failed_resets_and_syncs() {
        let mut h = harness_with(RecordingHandler::failing(), None);
        let id = h.queue.add_action(favorite(7), deferred(Priority::Normal));
        h.queue.update_action(&id, |i| {
            i.status = ItemStatus::Failed;
            i.retries = 3;
            i.failed_at = Some(START);
            i.error = Some("HTTP 500".to_string());
        });
        h.handler.failing.store(false, Ordering::SeqCst);
        h.network.set_online(true);
        drain_events(&mut h.events);

        assert_eq!(h.queue.retry_failed(), 1);
        loop {
            match h.events.recv().await.unwrap() {
                QueueEvent::DrainFinished(summary) => {
                    assert_eq!(summary.succeeded, 1);
                    break;
                }
                _ => continue,
            }
        }
        assert!(h.queue.get_action(&id).is_none());
    }

    #[tokio::test]
    async fn test_reset_failed_without_sync() {
        let h = harness();
        let id = h.queue.add_action(favorite(1), deferred(Priority::Normal));
        h.queue.update_action(&id, |i| {
            i.status = ItemStatus::Failed;
            i.retries = 3;
        });

        assert_eq!(h.queue.reset_failed(), 1);
        let item = h.queue.get_action(&id).unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.retries, 0);
        assert_eq!(h.queue.reset_failed(), 0);
    }

    #[tokio::test]
    async fn test_unknown_action_is_discarded() {
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(CacheStore::new(
            Box::new(MemoryBackend::new()),
            CacheOptions::default(),
            clock,
        ));
        store.put_document(
            QUEUE_KEY,
            &json!([
                {"id": "1_a", "action": "launch_rocket", "payload": {}, "timestamp": START},
                {"id": "1_b", "action": "update_rating", "payload": {"entry_id": 1}, "timestamp": START},
                {"id": "1_c", "action": "delete_entry", "payload": {"entry_id": 5}, "timestamp": START}
            ]),
        );

        let mut h = harness_with(RecordingHandler::default(), Some(store));
        assert_eq!(h.queue.items().len(), 3);
        h.network.set_online(true);

        let outcome = h.queue.process_queue().await;
        assert_eq!(
            outcome,
            DrainOutcome::Finished(DrainSummary {
                succeeded: 1,
                discarded: 2,
                ..DrainSummary::default()
            })
        );
        assert_eq!(h.handler.calls(), vec![Action::DeleteEntry { entry_id: 5 }]);
        assert!(h.queue.items().is_empty());

        let discarded: Vec<_> = drain_events(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                QueueEvent::Discarded { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(discarded, vec!["1_a".to_string(), "1_b".to_string()]);
    }

    #[tokio::test]
    async fn test_unreadable_record_does_not_drop_queue() {
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(CacheStore::new(
            Box::new(MemoryBackend::new()),
            CacheOptions::default(),
            clock,
        ));
        store.put_document(
            QUEUE_KEY,
            &json!([
                {"id": "1_a", "action": "delete_entry", "payload": {"entry_id": 7}, "timestamp": START},
                {"id": "1_b", "action": "add_tag", "payload": {"entry_id": 7, "tag_id": 2},
                 "timestamp": START, "priority": "urgent"},
                {"action": "toggle_favorite", "payload": {"entry_id": 1}}
            ]),
        );

        let h = harness_with(RecordingHandler::default(), Some(store.clone()));
        let ids: Vec<_> = h.queue.items().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["1_a".to_string()]);

        let persisted: Vec<Value> = store.document(QUEUE_KEY).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0]["id"], "1_a");

        h.network.set_online(true);
        h.queue.process_queue().await;
        assert_eq!(h.handler.calls(), vec![Action::DeleteEntry { entry_id: 7 }]);
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let h = harness();
        let id = h.queue.add_action(
            Action::AddTag { entry_id: 3, tag_id: 8 },
            ActionOptions {
                priority: Priority::High,
                metadata: Some(json!({"origin": "detail_page"})),
                sync_now: false,
            },
        );

        let restored = harness_with(RecordingHandler::default(), Some(h.store.clone()));
        let item = restored.queue.get_action(&id).unwrap();
        assert_eq!(item.action, "add_tag");
        assert_eq!(item.priority, Priority::High);
        assert_eq!(item.metadata, Some(json!({"origin": "detail_page"})));
    }

    #[tokio::test]
    async fn test_single_flight() {
        let handler = RecordingHandler {
            gate: Some(Semaphore::new(0)),
            ..RecordingHandler::default()
        };
        let h = harness_with(handler, None);
        h.network.set_online(true);
        h.queue.add_action(favorite(1), deferred(Priority::Normal));

        let queue = h.queue.clone();
        let first = tokio::spawn(async move { queue.process_queue().await });
        while h.handler.calls().is_empty() {
            tokio::task::yield_now().await;
        }

        assert!(h.queue.is_processing());
        assert!(h.queue.get_summary().processing);
        assert_eq!(h.queue.process_queue().await, DrainOutcome::AlreadyRunning);

        h.handler.gate.as_ref().unwrap().add_permits(1);
        let outcome = first.await.unwrap();
        assert!(matches!(outcome, DrainOutcome::Finished(s) if s.succeeded == 1));
        assert!(!h.queue.is_processing());
        assert_eq!(h.handler.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_stops_when_connection_drops() {
        let handler = RecordingHandler {
            gate: Some(Semaphore::new(0)),
            ..RecordingHandler::default()
        };
        let h = harness_with(handler, None);
        h.network.set_online(true);
        h.queue.add_action(favorite(1), deferred(Priority::Normal));
        h.queue.add_action(favorite(2), deferred(Priority::Normal));

        let queue = h.queue.clone();
        let pass = tokio::spawn(async move { queue.process_queue().await });
        while h.handler.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        h.network.set_online(false);
        h.handler.gate.as_ref().unwrap().add_permits(1);

        let outcome = pass.await.unwrap();
        assert!(matches!(outcome, DrainOutcome::Finished(s) if s.succeeded == 1));
        assert_eq!(h.queue.items().len(), 1);
        assert_eq!(h.queue.items()[0].status, ItemStatus::Pending);
    }

    #[tokio::test]
    async fn test_add_action_syncs_immediately_when_online() {
        let mut h = harness();
        h.network.set_online(true);
        let id = h.queue.add_action(favorite(9), ActionOptions::default());

        loop {
            if let QueueEvent::DrainFinished(_) = h.events.recv().await.unwrap() {
                break;
            }
        }
        assert!(h.queue.get_action(&id).is_none());
        assert_eq!(h.handler.calls(), vec![favorite(9)]);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_pending_items() {
        let h = harness();
        let old_failed = h.queue.add_action(favorite(1), deferred(Priority::Normal));
        let old_pending = h.queue.add_action(favorite(2), deferred(Priority::Normal));
        h.queue.update_action(&old_failed, |i| i.status = ItemStatus::Failed);

        h.clock.advance(Duration::from_secs(6 * 24 * 3600));
        let recent_failed = h.queue.add_action(favorite(3), deferred(Priority::Normal));
        h.queue.update_action(&recent_failed, |i| i.status = ItemStatus::Failed);
        assert_eq!(h.queue.cleanup_old_items(), 0);

        h.clock.advance(Duration::from_secs(2 * 24 * 3600));
        assert_eq!(h.queue.cleanup_old_items(), 1);
        assert!(h.queue.get_action(&old_failed).is_none());
        assert!(h.queue.get_action(&old_pending).is_some());
        assert!(h.queue.get_action(&recent_failed).is_some());
    }

    #[tokio::test]
    async fn test_summary_and_clear() {
        let mut h = harness();
        let a = h.queue.add_action(favorite(1), deferred(Priority::Normal));
        let b = h.queue.add_action(favorite(2), deferred(Priority::Normal));
        h.queue.add_action(favorite(3), deferred(Priority::Normal));
        h.queue.update_action(&a, |i| i.status = ItemStatus::Failed);
        h.queue.update_action(&b, |i| i.status = ItemStatus::Completed);

        assert_eq!(
            h.queue.get_summary(),
            QueueSummary {
                total: 3,
                pending: 1,
                completed: 1,
                failed: 1,
                processing: false,
            }
        );

        assert_eq!(h.queue.clear_completed(), 1);
        assert_eq!(h.queue.clear_failed(), 1);
        assert_eq!(h.queue.clear_failed(), 0);
        assert_eq!(h.queue.get_summary().pending, 1);
        assert_eq!(h.queue.clear_all(), 1);
        assert_eq!(h.queue.get_summary().total, 0);

        let cleared: usize = drain_events(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                QueueEvent::Cleared { removed } => Some(removed),
                _ => None,
            })
            .sum();
        assert_eq!(cleared, 3);
    }

    #[tokio::test]
    async fn test_update_and_remove() {
        let h = harness();
        let id = h.queue.add_action(favorite(1), deferred(Priority::Normal));

        assert!(h.queue.update_action(&id, |i| {
            i.priority = Priority::High;
            i.id = "hijacked".to_string();
        }));
        assert_eq!(h.queue.get_action(&id).unwrap().priority, Priority::High);
        assert!(!h.queue.update_action("missing", |_| {}));

        assert!(h.queue.remove_action(&id));
        assert!(!h.queue.remove_action(&id));
        let persisted: Vec<QueueItem> = h.store.document(QUEUE_KEY).unwrap();
        assert!(persisted.is_empty());
    }

    #[tokio::test]
    async fn test_idle_when_nothing_due() {
        let mut h = harness();
        h.network.set_online(true);
        assert_eq!(h.queue.process_queue().await, DrainOutcome::Idle);
        assert!(drain_events(&mut h.events).is_empty());
    }

    #[tokio::test]
    async fn test_works_without_storage() {
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(CacheStore::new(
            Box::new(MemoryBackend::unavailable()),
            CacheOptions::default(),
            clock,
        ));
        let h = harness_with(RecordingHandler::default(), Some(store));
        h.network.set_online(true);
        h.queue.add_action(favorite(1), deferred(Priority::Normal));

        assert!(matches!(h.queue.process_queue().await, DrainOutcome::Finished(s) if s.succeeded == 1));
    }
}
