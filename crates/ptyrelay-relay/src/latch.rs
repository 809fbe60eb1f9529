//! Single-use completion signal shared by the relay workers

use crate::link::LinkOutcome;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// The link that finished first and how it ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub label: String,
    pub outcome: LinkOutcome,
}

/// Set once by whichever worker finishes first, never reset.
///
/// Later signals are absorbed, so workers need no coordination among
/// themselves.
#[derive(Debug, Default)]
pub struct CompletionLatch {
    first: Mutex<Option<Completion>>,
    done: Condvar,
}

impl CompletionLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished link. Returns `true` if this call set the latch.
    pub fn signal(&self, completion: Completion) -> bool {
        let mut first = self.lock();
        if first.is_some() {
            return false;
        }
        *first = Some(completion);
        drop(first);

        self.done.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    /// The completion that set the latch, if any
    pub fn first(&self) -> Option<Completion> {
        self.lock().clone()
    }

    /// Block until some link has finished
    pub fn wait(&self) -> Completion {
        let mut first = self.lock();
        loop {
            if let Some(completion) = first.as_ref() {
                return completion.clone();
            }
            first = self
                .done
                .wait(first)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Completion> {
        let deadline = Instant::now() + timeout;
        let mut first = self.lock();
        loop {
            if let Some(completion) = first.as_ref() {
                return Some(completion.clone());
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            first = self
                .done
                .wait_timeout(first, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    // Workers never panic while holding the lock, but a poisoned latch must
    // still release the controller.
    fn lock(&self) -> MutexGuard<'_, Option<Completion>> {
        self.first.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
