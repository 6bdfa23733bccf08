//! Bounded, non-blocking progress channel from workflows to the activity board.

use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tracing::trace;

use crate::core::activity::ProgressEvent;

/// Default channel capacity. When full, new progress notes are dropped.
pub const PROGRESS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Sender<ProgressEvent>,
}

impl ProgressSink {
    pub fn channel(capacity: usize) -> (Self, Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Send without waiting. A full or closed channel drops the event.
    pub fn send(&self, event: ProgressEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!("progress channel full, dropping event"),
            Err(TrySendError::Closed(_)) => trace!("progress channel closed"),
        }
    }

    /// Wait for capacity instead of dropping. Used for `Started` and `Finished`,
    /// which the board cannot reconstruct. Only a closed channel loses the event.
    pub async fn deliver(&self, event: ProgressEvent) {
        if self.tx.send(event).await.is_err() {
            trace!("progress channel closed");
        }
    }
}
