//! Execution queue serializing contention for the device layer. Triggers
//! that arrive while a flow is running are parked here and served in
//! priority order, FIFO within a priority band.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub flow_id: String,
    pub flow_name: String,
    pub added_at: DateTime<Utc>,
    /// Program id that owns this entry, or a marker such as `manual`.
    pub paused_by: String,
    pub status: QueueItemStatus,
    /// Lower number dequeues first; 0 is the highest priority.
    pub priority: u8,
    pub execution_attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct MonitoringQueue {
    items: Vec<QueueItem>,
}

impl MonitoringQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: Vec<QueueItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    pub fn pending_len(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == QueueItemStatus::Pending)
            .count()
    }

    /// Add a pending entry. At most one pending entry may exist per flow;
    /// a duplicate is rejected so the caller can log and move on.
    pub fn enqueue(
        &mut self,
        flow_id: &str,
        flow_name: &str,
        paused_by: &str,
        priority: u8,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let duplicate = self
            .items
            .iter()
            .any(|i| i.flow_id == flow_id && i.status == QueueItemStatus::Pending);
        if duplicate {
            return Err(EngineError::Queue(format!(
                "flow '{flow_id}' is already pending"
            )));
        }
        self.items.push(QueueItem {
            flow_id: flow_id.to_string(),
            flow_name: flow_name.to_string(),
            added_at: now,
            paused_by: paused_by.to_string(),
            status: QueueItemStatus::Pending,
            priority,
            execution_attempts: 0,
            last_error: None,
        });
        Ok(())
    }

    /// Claim the next pending item: lowest priority number first, then
    /// earliest `added_at`. The item transitions to `executing` and its
    /// attempt counter increments.
    pub fn take_next(&mut self) -> Option<QueueItem> {
        let next = self
            .items
            .iter_mut()
            .filter(|i| i.status == QueueItemStatus::Pending)
            .min_by_key(|i| (i.priority, i.added_at))?;
        next.status = QueueItemStatus::Executing;
        next.execution_attempts += 1;
        Some(next.clone())
    }

    pub fn mark_completed(&mut self, flow_id: &str) {
        if let Some(item) = self.executing_mut(flow_id) {
            item.status = QueueItemStatus::Completed;
            item.last_error = None;
        }
    }

    pub fn mark_failed(&mut self, flow_id: &str, error: &str) {
        if let Some(item) = self.executing_mut(flow_id) {
            item.status = QueueItemStatus::Failed;
            item.last_error = Some(error.to_string());
        }
    }

    /// Cancel a pending entry. Executing entries are not cancellable here;
    /// stopping the interpreter is the scheduler's job.
    pub fn cancel(&mut self, flow_id: &str) -> bool {
        match self
            .items
            .iter_mut()
            .find(|i| i.flow_id == flow_id && i.status == QueueItemStatus::Pending)
        {
            Some(item) => {
                item.status = QueueItemStatus::Cancelled;
                true
            }
            None => false,
        }
    }

    /// Drop entries whose owning program no longer exists.
    pub fn cleanup(&mut self, owner_exists: impl Fn(&str) -> bool) -> usize {
        let before = self.items.len();
        self.items.retain(|i| owner_exists(&i.paused_by));
        before - self.items.len()
    }

    fn executing_mut(&mut self, flow_id: &str) -> Option<&mut QueueItem> {
        self.items
            .iter_mut()
            .find(|i| i.flow_id == flow_id && i.status == QueueItemStatus::Executing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn duplicate_pending_enqueue_is_rejected() {
        let mut queue = MonitoringQueue::new();
        queue.enqueue("f1", "pH check", "prog-1", 0, now()).unwrap();
        assert!(matches!(
            queue.enqueue("f1", "pH check", "prog-1", 0, now()),
            Err(EngineError::Queue(_))
        ));
        assert_eq!(queue.pending_len(), 1);
    }

    #[test]
    fn same_flow_can_requeue_after_completion() {
        let mut queue = MonitoringQueue::new();
        queue.enqueue("f1", "pH check", "prog-1", 0, now()).unwrap();
        let taken = queue.take_next().unwrap();
        queue.mark_completed(&taken.flow_id);

        assert!(queue.enqueue("f1", "pH check", "prog-1", 0, now()).is_ok());
        assert_eq!(queue.pending_len(), 1);
    }

    #[test]
    fn dequeue_orders_by_priority_then_fifo() {
        let mut queue = MonitoringQueue::new();
        let t0 = now();
        queue.enqueue("low-a", "a", "p", 5, t0).unwrap();
        queue
            .enqueue("low-b", "b", "p", 5, t0 + Duration::seconds(1))
            .unwrap();
        queue
            .enqueue("urgent", "u", "p", 0, t0 + Duration::seconds(2))
            .unwrap();

        assert_eq!(queue.take_next().unwrap().flow_id, "urgent");
        assert_eq!(queue.take_next().unwrap().flow_id, "low-a");
        assert_eq!(queue.take_next().unwrap().flow_id, "low-b");
        assert!(queue.take_next().is_none());
    }

    #[test]
    fn attempts_increment_on_each_claim() {
        let mut queue = MonitoringQueue::new();
        queue.enqueue("f1", "a", "p", 0, now()).unwrap();
        let first = queue.take_next().unwrap();
        assert_eq!(first.execution_attempts, 1);
        queue.mark_failed("f1", "device offline");

        queue.enqueue("f1", "a", "p", 0, now()).unwrap();
        let second = queue.take_next().unwrap();
        assert_eq!(second.execution_attempts, 1);

        let failed: Vec<_> = queue
            .items()
            .iter()
            .filter(|i| i.status == QueueItemStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("device offline"));
    }

    #[test]
    fn cancel_only_touches_pending_items() {
        let mut queue = MonitoringQueue::new();
        queue.enqueue("f1", "a", "p", 0, now()).unwrap();
        assert!(queue.cancel("f1"));
        assert!(!queue.cancel("f1"));
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn cleanup_drops_orphaned_entries() {
        let mut queue = MonitoringQueue::new();
        queue.enqueue("f1", "a", "prog-live", 0, now()).unwrap();
        queue.enqueue("f2", "b", "prog-gone", 0, now()).unwrap();

        let removed = queue.cleanup(|owner| owner == "prog-live");
        assert_eq!(removed, 1);
        assert_eq!(queue.items().len(), 1);
        assert_eq!(queue.items()[0].flow_id, "f1");
    }
}
