//! Blocking hand-off queue between a recognizer's producer side and the
//! transcript threads pulling from it.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use super::base::RecognizerError;

/// One queued outcome: a completed utterance or a failure deferred to the
/// next read.
#[derive(Debug)]
enum QueueItem {
    Text(String),
    Failed(String),
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    /// Bumped by `abort`; a blocked `pop` that observes the bump returns
    /// `Interrupted` instead of continuing to wait.
    abort_generation: u64,
    stopped: bool,
    /// Set when the producer side is gone for good (e.g. connection loss).
    poisoned: Option<String>,
}

/// Producer/consumer queue with blocking pops.
///
/// Producers never block. `pop` blocks the calling thread until an item is
/// available or the queue is aborted, stopped, or poisoned.
#[derive(Debug, Default)]
pub(crate) struct TranscriptQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl TranscriptQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue a completed utterance.
    pub(crate) fn push_text(&self, text: String) {
        let mut state = self.state.lock();
        state.items.push_back(QueueItem::Text(text));
        drop(state);
        self.available.notify_one();
    }

    /// Queue a failure to be surfaced by the next `pop` as a transient error.
    pub(crate) fn push_failure(&self, message: String) {
        let mut state = self.state.lock();
        state.items.push_back(QueueItem::Failed(message));
        drop(state);
        self.available.notify_one();
    }

    /// Block until the next outcome.
    ///
    /// Queued items drain in order even after `stop`. An `abort` issued while
    /// blocked wakes the caller with `Interrupted`; an abort issued before
    /// the call does not affect it.
    pub(crate) fn pop(&self) -> Result<String, RecognizerError> {
        let mut state = self.state.lock();
        let entry_generation = state.abort_generation;
        loop {
            if let Some(item) = state.items.pop_front() {
                return match item {
                    QueueItem::Text(text) => Ok(text),
                    QueueItem::Failed(message) => Err(RecognizerError::Transient(message)),
                };
            }
            if state.abort_generation != entry_generation {
                return Err(RecognizerError::Interrupted);
            }
            if state.stopped {
                return Err(RecognizerError::Stopped);
            }
            if let Some(reason) = &state.poisoned {
                return Err(RecognizerError::Transport(reason.clone()));
            }
            self.available.wait(&mut state);
        }
    }

    /// Discard everything queued and wake blocked consumers with
    /// `Interrupted`.
    pub(crate) fn abort(&self) {
        let mut state = self.state.lock();
        state.items.clear();
        state.abort_generation += 1;
        drop(state);
        self.available.notify_all();
    }

    /// Park the queue; blocked and future pops return `Stopped` once the
    /// remaining items drain. Idempotent.
    pub(crate) fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        drop(state);
        self.available.notify_all();
    }

    /// Mark the producer side as permanently gone; pops return a transport
    /// error carrying `reason`.
    pub(crate) fn poison(&self, reason: String) {
        let mut state = self.state.lock();
        if state.poisoned.is_none() {
            state.poisoned = Some(reason);
        }
        drop(state);
        self.available.notify_all();
    }
}
