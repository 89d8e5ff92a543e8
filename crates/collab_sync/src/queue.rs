//! Outgoing operation queue.
//!
//! This module buffers locally-authored operations and manages their
//! delivery lifecycle:
//!
//! - Batching pending operations (size threshold or idle window)
//! - Tracking sent operations until the channel acknowledges them
//! - Retransmitting on acknowledgment timeout, with a bounded retry count
//! - Surfacing operations that exhausted their retries instead of dropping them
//!
//! Only one batch is in flight at a time, so operations from this session
//! reach the channel in the order they were enqueued.

use crate::config::QueueConfig;
use crate::error::SyncError;
use crate::ids::{ClientId, OpId};
use crate::operation::Operation;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::time::Instant;

/// State of an operation in the delivery pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpState {
    /// Queued locally, not yet sent
    Pending,
    /// Sent, awaiting acknowledgment
    AwaitingAck,
    /// Retries exhausted; kept locally, not sent
    Failed,
}

#[derive(Clone, Debug)]
struct QueuedOperation {
    operation: Operation,
    /// Enqueue order, stable across retransmissions
    order: u64,
    retries: u32,
    sent_at: Option<Instant>,
    state: OpState,
}

/// Operations sent together in one transport message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationBatch {
    pub client_id: ClientId,
    pub batch_seq: u64,
    pub operations: Vec<Operation>,
}

/// Lifecycle events produced by a timeout sweep.
#[derive(Clone, Debug, PartialEq)]
pub enum QueueEvent {
    /// Operations went back to pending for another attempt.
    Retransmit { op_ids: Vec<OpId>, retry: u32 },
    /// An operation exhausted its retries.
    Failed { operation: Operation, error: SyncError },
}

/// Counts per pipeline state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub awaiting_ack: usize,
    pub failed: usize,
    pub batches_sent: u64,
}

/// Outgoing operation queue for one session.
pub struct OperationQueue {
    client_id: ClientId,
    config: QueueConfig,
    pending: VecDeque<QueuedOperation>,
    /// Sent but not yet acknowledged
    awaiting: HashMap<OpId, QueuedOperation>,
    failed: Vec<QueuedOperation>,
    next_order: u64,
    batch_seq: u64,
    last_enqueue_at: Option<Instant>,
}

impl OperationQueue {
    /// Create a new queue
    pub fn new(client_id: ClientId, config: QueueConfig) -> Self {
        Self {
            client_id,
            config,
            pending: VecDeque::new(),
            awaiting: HashMap::new(),
            failed: Vec::new(),
            next_order: 0,
            batch_seq: 0,
            last_enqueue_at: None,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append a local operation to the pending list.
    pub fn enqueue(&mut self, operation: Operation, now: Instant) {
        let order = self.next_order;
        self.next_order += 1;
        self.pending.push_back(QueuedOperation {
            operation,
            order,
            retries: 0,
            sent_at: None,
            state: OpState::Pending,
        });
        self.last_enqueue_at = Some(now);
    }

    /// Whether a batch should be sent now.
    ///
    /// True once the batch-size threshold is reached, the idle window since
    /// the last enqueue has passed, or a retransmission is waiting.
    pub fn should_flush(&self, now: Instant) -> bool {
        if self.pending.is_empty() || !self.awaiting.is_empty() || !self.failed.is_empty() {
            return false;
        }
        if self.pending.len() >= self.config.max_batch_size {
            return true;
        }
        if self.pending.iter().any(|q| q.retries > 0) {
            return true;
        }
        match self.last_enqueue_at {
            Some(at) => now.duration_since(at) >= self.config.flush_interval(),
            None => true,
        }
    }

    /// Drain up to the batch size into one batch and mark it in flight.
    ///
    /// Returns `None` while another batch awaits acknowledgment or failed
    /// operations block the session.
    pub fn flush(&mut self, now: Instant) -> Option<OperationBatch> {
        if self.pending.is_empty() || !self.awaiting.is_empty() || !self.failed.is_empty() {
            return None;
        }

        let mut operations = Vec::new();
        while operations.len() < self.config.max_batch_size {
            let Some(mut queued) = self.pending.pop_front() else {
                break;
            };
            queued.sent_at = Some(now);
            queued.state = OpState::AwaitingAck;
            operations.push(queued.operation.clone());
            self.awaiting.insert(queued.operation.id.clone(), queued);
        }

        let batch = OperationBatch {
            client_id: self.client_id.clone(),
            batch_seq: self.batch_seq,
            operations,
        };
        self.batch_seq += 1;
        Some(batch)
    }

    /// Remove an acknowledged operation from the in-flight set.
    ///
    /// Unknown ids (duplicate or late acks) are ignored.
    pub fn acknowledge(&mut self, op_id: &OpId, server_version: u64) -> Option<Operation> {
        let queued = self.awaiting.remove(op_id)?;
        tracing::debug!("Operation {} acknowledged at version {}", op_id, server_version);
        Some(queued.operation)
    }

    /// Retransmit or fail operations whose acknowledgment is overdue.
    pub fn sweep_timeouts(&mut self, now: Instant) -> Vec<QueueEvent> {
        let timeout = self.config.ack_timeout();
        let mut expired: Vec<QueuedOperation> = Vec::new();
        let expired_ids: Vec<OpId> = self
            .awaiting
            .values()
            .filter(|q| q.sent_at.is_some_and(|at| now.duration_since(at) >= timeout))
            .map(|q| q.operation.id.clone())
            .collect();
        for id in expired_ids {
            if let Some(queued) = self.awaiting.remove(&id) {
                expired.push(queued);
            }
        }
        if expired.is_empty() {
            return Vec::new();
        }
        expired.sort_by_key(|q| q.order);

        let mut events = Vec::new();
        let mut retried = Vec::new();
        for mut queued in expired {
            if queued.retries >= self.config.max_retries {
                let attempts = queued.retries + 1;
                tracing::warn!(
                    "Operation {} failed after {} attempts",
                    queued.operation.id,
                    attempts
                );
                events.push(QueueEvent::Failed {
                    operation: queued.operation.clone(),
                    error: SyncError::OperationRetryExhausted {
                        op_id: queued.operation.id.clone(),
                        attempts,
                    },
                });
                queued.state = OpState::Failed;
                queued.sent_at = None;
                self.failed.push(queued);
            } else {
                queued.retries += 1;
                queued.sent_at = None;
                queued.state = OpState::Pending;
                retried.push(queued);
            }
        }

        if !retried.is_empty() {
            let retry = retried.iter().map(|q| q.retries).max().unwrap_or(1);
            let op_ids = retried.iter().map(|q| q.operation.id.clone()).collect();
            tracing::debug!("Retransmitting {} operations (retry {})", retried.len(), retry);
            self.push_front_ordered(retried);
            events.insert(0, QueueEvent::Retransmit { op_ids, retry });
        }
        events
    }

    /// Move every in-flight operation back to pending without counting a
    /// retry. Used when the transport drops.
    pub fn requeue_in_flight(&mut self) -> usize {
        let in_flight: Vec<QueuedOperation> = self.awaiting.drain().map(|(_, q)| q).collect();
        let count = in_flight.len();
        self.push_front_ordered(in_flight);
        count
    }

    /// Move operations the channel refused back to pending.
    pub fn reject(&mut self, op_ids: &[OpId]) -> usize {
        let rejected: Vec<QueuedOperation> = op_ids
            .iter()
            .filter_map(|id| self.awaiting.remove(id))
            .collect();
        let count = rejected.len();
        self.push_front_ordered(rejected);
        count
    }

    /// Give failed operations a fresh set of retries.
    pub fn retry_failed(&mut self) -> usize {
        let failed: Vec<QueuedOperation> = std::mem::take(&mut self.failed)
            .into_iter()
            .map(|mut q| {
                q.retries = 0;
                q.state = OpState::Pending;
                q
            })
            .collect();
        let count = failed.len();
        self.push_front_ordered(failed);
        count
    }

    fn push_front_ordered(&mut self, mut items: Vec<QueuedOperation>) {
        items.sort_by_key(|q| q.order);
        for mut queued in items.into_iter().rev() {
            queued.state = OpState::Pending;
            queued.sent_at = None;
            self.pending.push_front(queued);
        }
    }

    fn entries(&self) -> impl Iterator<Item = &QueuedOperation> {
        self.pending
            .iter()
            .chain(self.awaiting.values())
            .chain(self.failed.iter())
    }

    fn entry_mut(&mut self, op_id: &OpId) -> Option<&mut QueuedOperation> {
        if self.awaiting.contains_key(op_id) {
            return self.awaiting.get_mut(op_id);
        }
        self.pending
            .iter_mut()
            .chain(self.failed.iter_mut())
            .find(|q| &q.operation.id == op_id)
    }

    /// Every operation not yet acknowledged, in enqueue order.
    pub fn unacknowledged(&self) -> Vec<Operation> {
        let mut entries: Vec<&QueuedOperation> = self.entries().collect();
        entries.sort_by_key(|q| q.order);
        entries.into_iter().map(|q| q.operation.clone()).collect()
    }

    /// Pipeline state of an operation.
    pub fn state_of(&self, op_id: &OpId) -> Option<OpState> {
        self.entries()
            .find(|q| &q.operation.id == op_id)
            .map(|q| q.state)
    }

    /// Swap in a rebased version of a queued operation.
    pub fn replace(&mut self, operation: Operation) -> bool {
        match self.entry_mut(&operation.id) {
            Some(queued) => {
                queued.operation = operation;
                true
            }
            None => false,
        }
    }

    /// Remove an operation from whichever set holds it.
    pub fn withdraw(&mut self, op_id: &OpId) -> Option<Operation> {
        if let Some(queued) = self.awaiting.remove(op_id) {
            return Some(queued.operation);
        }
        if let Some(index) = self.pending.iter().position(|q| &q.operation.id == op_id) {
            return self.pending.remove(index).map(|q| q.operation);
        }
        let index = self.failed.iter().position(|q| &q.operation.id == op_id)?;
        Some(self.failed.remove(index).operation)
    }

    /// Declare every queued operation against `version`.
    pub fn restamp(&mut self, version: u64) {
        for queued in self.pending.iter_mut().chain(self.failed.iter_mut()) {
            queued.operation = queued.operation.with_base_version(version);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn awaiting_count(&self) -> usize {
        self.awaiting.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Whether nothing is left to deliver.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.awaiting.is_empty() && self.failed.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending.len(),
            awaiting_ack: self.awaiting.len(),
            failed: self.failed.len(),
            batches_sent: self.batch_seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;
    use std::time::Duration;

    fn make_queue(batch: usize, retries: u32) -> OperationQueue {
        let config = QueueConfig::default()
            .with_batch_size(batch)
            .with_ack_timeout(Duration::from_secs(10))
            .with_max_retries(retries);
        OperationQueue::new(ClientId::from("client-x"), config)
    }

    fn make_op(seq: u64) -> Operation {
        Operation::insert(
            OpId::new(ClientId::from("client-x"), seq),
            UserId::from("x"),
            0,
            "a",
            0,
        )
    }

    #[test]
    fn test_enqueue_and_flush() {
        let mut queue = make_queue(10, 3);
        let now = Instant::now();
        queue.enqueue(make_op(1), now);
        queue.enqueue(make_op(2), now);

        let batch = queue.flush(now).unwrap();
        assert_eq!(batch.operations.len(), 2);
        assert_eq!(batch.batch_seq, 0);
        assert_eq!(batch.operations[0].id.seq, 1);
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.awaiting_count(), 2);
        assert_eq!(queue.state_of(&make_op(1).id), Some(OpState::AwaitingAck));
    }

    #[test]
    fn test_flush_respects_batch_size_and_single_flight() {
        let mut queue = make_queue(2, 3);
        let now = Instant::now();
        for seq in 1..=5 {
            queue.enqueue(make_op(seq), now);
        }

        let batch = queue.flush(now).unwrap();
        assert_eq!(batch.operations.len(), 2);
        assert!(queue.flush(now).is_none());

        queue.acknowledge(&make_op(1).id, 1);
        queue.acknowledge(&make_op(2).id, 2);
        let batch = queue.flush(now).unwrap();
        assert_eq!(
            batch.operations.iter().map(|op| op.id.seq).collect::<Vec<_>>(),
            vec![3, 4]
        );
    }

    #[test]
    fn test_should_flush_triggers() {
        let mut queue = make_queue(3, 3);
        let now = Instant::now();
        assert!(!queue.should_flush(now));

        queue.enqueue(make_op(1), now);
        assert!(!queue.should_flush(now));
        assert!(queue.should_flush(now + Duration::from_millis(100)));

        queue.enqueue(make_op(2), now);
        queue.enqueue(make_op(3), now);
        assert!(queue.should_flush(now));
    }

    #[test]
    fn test_acknowledge_unknown_is_noop() {
        let mut queue = make_queue(10, 3);
        assert!(queue.acknowledge(&make_op(9).id, 4).is_none());

        let now = Instant::now();
        queue.enqueue(make_op(1), now);
        queue.flush(now);
        assert!(queue.acknowledge(&make_op(1).id, 1).is_some());
        assert!(queue.acknowledge(&make_op(1).id, 1).is_none());
        assert!(queue.is_idle());
    }

    #[test]
    fn test_timeout_retransmits() {
        let mut queue = make_queue(10, 3);
        let start = Instant::now();
        queue.enqueue(make_op(1), start);
        queue.enqueue(make_op(2), start);
        queue.flush(start);

        assert!(queue.sweep_timeouts(start + Duration::from_secs(5)).is_empty());

        let events = queue.sweep_timeouts(start + Duration::from_secs(10));
        assert_eq!(
            events,
            vec![QueueEvent::Retransmit {
                op_ids: vec![make_op(1).id, make_op(2).id],
                retry: 1,
            }]
        );
        assert_eq!(queue.pending_count(), 2);
        assert!(queue.should_flush(start + Duration::from_secs(10)));

        let batch = queue.flush(start + Duration::from_secs(10)).unwrap();
        assert_eq!(batch.operations[0].id.seq, 1);
    }

    #[test]
    fn test_retry_exhaustion_keeps_operation() {
        let mut queue = make_queue(10, 3);
        let mut now = Instant::now();
        queue.enqueue(make_op(1), now);

        let mut failures = Vec::new();
        for _ in 0..4 {
            queue.flush(now).unwrap();
            now += Duration::from_secs(10);
            for event in queue.sweep_timeouts(now) {
                if let QueueEvent::Failed { error, .. } = event {
                    failures.push(error);
                }
            }
        }

        assert_eq!(
            failures,
            vec![SyncError::OperationRetryExhausted {
                op_id: make_op(1).id,
                attempts: 4,
            }]
        );
        assert_eq!(queue.failed_count(), 1);
        let kept: Vec<OpId> = queue.unacknowledged().into_iter().map(|op| op.id).collect();
        assert_eq!(kept, vec![make_op(1).id]);
        assert!(queue.flush(now).is_none());

        assert_eq!(queue.retry_failed(), 1);
        assert!(queue.flush(now).is_some());
    }

    #[test]
    fn test_requeue_in_flight_preserves_order() {
        let mut queue = make_queue(2, 3);
        let now = Instant::now();
        for seq in 1..=3 {
            queue.enqueue(make_op(seq), now);
        }
        queue.flush(now);
        assert_eq!(queue.requeue_in_flight(), 2);

        let ids: Vec<u64> = queue.unacknowledged().iter().map(|op| op.id.seq).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let batch = queue.flush(now).unwrap();
        assert_eq!(batch.operations[0].id.seq, 1);
        assert_eq!(batch.operations[1].id.seq, 2);
    }

    #[test]
    fn test_reject_returns_to_pending() {
        let mut queue = make_queue(10, 3);
        let now = Instant::now();
        queue.enqueue(make_op(1), now);
        queue.flush(now);
        assert_eq!(queue.reject(&[make_op(1).id, make_op(7).id]), 1);
        assert_eq!(queue.state_of(&make_op(1).id), Some(OpState::Pending));
    }

    #[test]
    fn test_replace_and_withdraw() {
        let mut queue = make_queue(10, 3);
        let now = Instant::now();
        queue.enqueue(make_op(1), now);
        queue.enqueue(make_op(2), now);
        queue.flush(now);
        queue.enqueue(make_op(3), now);

        let moved = make_op(2).rebased(4, 0, "zz".to_string()).unwrap();
        assert!(queue.replace(moved.clone()));
        assert_eq!(queue.unacknowledged()[1], moved);

        assert!(queue.withdraw(&make_op(1).id).is_some());
        assert!(queue.withdraw(&make_op(3).id).is_some());
        assert!(queue.withdraw(&make_op(3).id).is_none());
        assert_eq!(queue.unacknowledged(), vec![moved]);
    }

    #[test]
    fn test_restamp_pending() {
        let mut queue = make_queue(10, 3);
        queue.enqueue(make_op(1), Instant::now());
        queue.restamp(7);
        assert_eq!(queue.unacknowledged()[0].base_version, 7);
    }
}
