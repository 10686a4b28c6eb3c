//! Cross-thread Job → CommTask signal (distilled spec §4.8).
//!
//! Grounded directly on the teacher's `Listener::waker`/
//! `closed_connections` pattern (`src/listener.rs`): a `mio::Waker`
//! paired with a channel lets any thread push a message into a loop's
//! inbox and guarantee the loop's `poll` call returns promptly to drain
//! it. Here that pairing is generalized into a reusable primitive used
//! both for the command queue (`EventLoop::register`) and for the
//! Job-completion signal.

use std::sync::Arc;

use crossbeam_channel::{SendError, Sender};
use mio::Waker;

/// A cross-thread "push a message, then guarantee the receiving loop
/// wakes up" primitive.
///
/// Cloning is cheap (an `Arc`'d waker and a cloned channel sender), so
/// every `Job` can hold its own handle back to its owning loop.
#[derive(Debug, Clone)]
pub struct Signal<T> {
    sender: Sender<T>,
    waker: Arc<Waker>,
}

impl<T> Signal<T> {
    /// Pairs a channel sender with the waker of the loop draining it.
    pub fn new(sender: Sender<T>, waker: Arc<Waker>) -> Self {
        Signal { sender, waker }
    }

    /// Sends `message` and wakes the owning loop.
    ///
    /// Distilled §4.8 requires the signal be safe even if the CommTask
    /// is concurrently being destroyed: callers achieve that by holding
    /// `Job::cleanup_in_progress` across this call (see
    /// [`crate::job::Job::begin_cleanup`]), not by anything in this
    /// primitive itself — this type only guarantees delivery-then-wake.
    pub fn send(&self, message: T) -> Result<(), SendError<T>> {
        self.sender.send(message)?;
        // A wake is best-effort: if the loop has already shut down the
        // waker registration may be gone, but the message is still in
        // the channel for the next drain (or is simply dropped with the
        // receiver, which is fine — the loop is gone too).
        let _ = self.waker.wake();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Poll, Token};

    #[test]
    fn send_wakes_a_blocked_poll() {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let (tx, rx) = crossbeam_channel::unbounded();
        let signal = Signal::new(tx, waker);

        signal.send(42u32).unwrap();
        assert_eq!(Ok(42), rx.try_recv());
    }
}
