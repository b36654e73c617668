//! Chunk: the passive record tracking whether a segment has been produced,
//! and who is waiting on it.

use tokio::sync::oneshot;

/// Sent to a waiter when its chunk resolves, one way or the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSignal {
    /// The chunk finished under the same epoch the waiter registered under.
    Done,
    /// The encoder that was going to produce this chunk was replaced.
    Conflict,
}

pub(crate) struct Waiter {
    pub id: u64,
    pub tx: oneshot::Sender<WakeSignal>,
}

/// A single segment's production state. Only `Stream` mutates this, always
/// under its own lock (§4.1).
pub(crate) struct Chunk {
    pub done: bool,
    waiters: Vec<Waiter>,
}

impl Chunk {
    pub fn new() -> Self {
        Self {
            done: false,
            waiters: Vec::new(),
        }
    }

    pub fn add_waiter(&mut self, id: u64) -> oneshot::Receiver<WakeSignal> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(Waiter { id, tx });
        rx
    }

    /// A waiter removes itself after waking or timing out, so the list does
    /// not grow across retries.
    pub fn remove_waiter(&mut self, id: u64) {
        self.waiters.retain(|w| w.id != id);
    }

    /// Mark the chunk done and drain its waiters with `Done`. Idempotent:
    /// calling this twice is a no-op the second time.
    pub fn mark_done(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.tx.send(WakeSignal::Done);
        }
    }

    /// Drain waiters with `Conflict`, used when the encoder epoch changes
    /// out from under them.
    pub fn wake_conflict(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.tx.send(WakeSignal::Conflict);
        }
    }
}
