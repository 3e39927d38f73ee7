//! Cooperative interruption of the display runner.
//!
//! The client thread interrupts the runner after writing a control request,
//! and once more when it exits. The runner observes the flag between socket
//! events and waits on the notification while idle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A shared interrupt flag with an async wake-up.
///
/// Clones share state: interrupting any clone wakes the task waiting in
/// [`notified`](Self::notified) on another.
///
/// # Example
///
/// ```
/// use sockwire_harness::interrupt::InterruptToken;
///
/// let token = InterruptToken::new();
/// let client_side = token.clone();
///
/// client_side.interrupt();
/// assert!(token.take());
/// assert!(!token.is_interrupted());
/// ```
#[derive(Debug, Clone, Default)]
pub struct InterruptToken {
    interrupted: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake the waiting runner.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was raised.
    pub fn take(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    /// Wait for the next [`interrupt`](Self::interrupt).
    ///
    /// An interrupt raised while nobody waited completes the next call at
    /// once, so check [`take`](Self::take) after waking.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Interrupts its token when dropped, panics included.
pub(crate) struct InterruptOnDrop(pub(crate) InterruptToken);

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        self.0.interrupt();
    }
}
