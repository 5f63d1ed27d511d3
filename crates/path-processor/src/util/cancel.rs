use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation shared between a path processor worker and
/// its environment.
///
/// Cancelling sets a flag every clone observes and pushes one unit into
/// a capacity-one wake-up channel, so a worker blocked in `select!` is
/// woken exactly once. Cancelling an already-cancelled token is a no-op.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    wakeup_tx: Sender<()>,
    wakeup_rx: Receiver<()>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (wakeup_tx, wakeup_rx) = bounded(1);
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            wakeup_tx,
            wakeup_rx,
        }
    }

    /// Cancel the token, waking any worker selecting on
    /// [`wakeup`](Self::wakeup).
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            let _ = self.wakeup_tx.try_send(());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Receiver end of the wake-up channel, for use inside `select!`.
    pub fn wakeup(&self) -> &Receiver<()> {
        &self.wakeup_rx
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
