//! Work items, their completions, and receipts callers wait on.

use std::collections::HashSet;
use std::sync::Arc;

use push_core::{DispatchError, Notification};
use push_transport::{Message, Recipient};
use tokio::sync::{RwLock, oneshot};

/// Result delivered to a work item's completion.
pub type Outcome = Result<DeliveryReport, DispatchError>;

/// Per-recipient tally of a send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub transmitted: usize,
    pub failed: usize,
    /// Tokens reported as no longer registered.
    pub devices_gone: Vec<String>,
    /// Recipients skipped because their batch was cancelled.
    pub cancelled: usize,
}

impl DeliveryReport {
    /// Report for `n` recipients skipped by cancellation.
    pub fn cancelled(n: usize) -> Self {
        Self {
            cancelled: n,
            ..Default::default()
        }
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: DeliveryReport) {
        self.transmitted += other.transmitted;
        self.failed += other.failed;
        self.devices_gone.extend(other.devices_gone);
        self.cancelled += other.cancelled;
    }
}

/// Fires a work item's outcome exactly once.
///
/// Dropping an unfired completion reports [`DispatchError::Dropped`], so a
/// waiter is never left hanging.
#[derive(Debug)]
pub struct Completion {
    tx: Option<oneshot::Sender<Outcome>>,
}

impl Completion {
    /// Create a completion and the receiver its outcome arrives on.
    pub fn new() -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Deliver the outcome.
    pub fn complete(mut self, outcome: Outcome) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(DispatchError::Dropped));
        }
    }
}

/// One unit of work for a provider's queue.
#[derive(Debug)]
pub struct WorkItem {
    pub id: uuid::Uuid,
    pub message: Message,
    pub recipient: Recipient,
    /// The notification as the caller sent it.
    pub notification: Arc<Notification>,
    pub completion: Completion,
}

/// Joins the completions of every work item produced by one call.
#[derive(Debug, Default)]
#[must_use = "a receipt does nothing unless waited on"]
pub struct Receipt {
    pending: Vec<oneshot::Receiver<Outcome>>,
}

impl Receipt {
    /// Receipt that resolves immediately with `outcome`.
    pub fn ready(outcome: Outcome) -> Self {
        let (completion, rx) = Completion::new();
        completion.complete(outcome);
        Self { pending: vec![rx] }
    }

    /// Track one more completion.
    pub fn push(&mut self, rx: oneshot::Receiver<Outcome>) {
        self.pending.push(rx);
    }

    /// Fold another receipt into this one.
    pub fn extend(&mut self, other: Receipt) {
        self.pending.extend(other.pending);
    }

    /// Number of work items tracked.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no work was produced.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Wait for every work item. Returns the merged report, or the first
    /// error once all items have finished.
    pub async fn wait(self) -> Outcome {
        let mut report = DeliveryReport::default();
        let mut first_error = None;

        for rx in self.pending {
            match rx.await {
                Ok(Ok(r)) => report.merge(r),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(DispatchError::Dropped);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

/// Send batches that were withdrawn before their items were dispatched.
#[derive(Debug, Default)]
pub struct Cancellations {
    batches: RwLock<HashSet<String>>,
}

impl Cancellations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a batch cancelled.
    pub async fn cancel(&self, batch_id: impl Into<String>) {
        self.batches.write().await.insert(batch_id.into());
    }

    /// Forget a batch, e.g. once it can no longer have queued items.
    pub async fn forget(&self, batch_id: &str) {
        self.batches.write().await.remove(batch_id);
    }

    /// Whether the notification's batch was cancelled.
    pub async fn is_cancelled(&self, notification: &Notification) -> bool {
        match &notification.batch_id {
            Some(id) => self.batches.read().await.contains(id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropped_completion_reports_error() {
        let (completion, rx) = Completion::new();
        drop(completion);
        assert!(matches!(rx.await, Ok(Err(DispatchError::Dropped))));
    }

    #[tokio::test]
    async fn test_receipt_merges_reports() {
        let mut receipt = Receipt::default();
        for n in 1..=3 {
            let (completion, rx) = Completion::new();
            receipt.push(rx);
            completion.complete(Ok(DeliveryReport {
                transmitted: n,
                ..Default::default()
            }));
        }
        let report = receipt.wait().await.unwrap();
        assert_eq!(report.transmitted, 6);
    }

    #[tokio::test]
    async fn test_receipt_waits_for_all_and_keeps_first_error() {
        let mut receipt = Receipt::ready(Err(DispatchError::ShuttingDown));
        let (late, rx) = Completion::new();
        receipt.push(rx);

        let waiter = tokio::spawn(receipt.wait());
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        late.complete(Err(DispatchError::Validation("later".into())));
        assert!(matches!(
            waiter.await.unwrap(),
            Err(DispatchError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_cancellations() {
        let cancellations = Cancellations::new();
        let mut n = Notification::alert("hi");
        assert!(!cancellations.is_cancelled(&n).await);

        n.batch_id = Some("b1".into());
        assert!(!cancellations.is_cancelled(&n).await);

        cancellations.cancel("b1").await;
        assert!(cancellations.is_cancelled(&n).await);

        cancellations.forget("b1").await;
        assert!(!cancellations.is_cancelled(&n).await);
    }
}
