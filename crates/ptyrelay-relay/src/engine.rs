//! Worker lifecycle for a set of relay links

use crate::latch::{Completion, CompletionLatch};
use crate::link::{LinkReport, RelayLink};
use crate::RelayError;
use nix::unistd::pipe;
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Links waiting to be started
#[derive(Debug, Default)]
pub struct RelayEngine {
    links: Vec<RelayLink>,
}

impl RelayEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a direction
    pub fn link(mut self, link: RelayLink) -> Self {
        self.links.push(link);
        self
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Spawn one worker thread per link, all sharing a fresh latch.
    pub fn start(self) -> Result<RunningRelay, RelayError> {
        if self.links.is_empty() {
            return Err(RelayError::NoLinks);
        }

        let (cancel_read, cancel_write) = pipe().map_err(RelayError::CancelPipe)?;
        let mut running = RunningRelay {
            latch: Arc::new(CompletionLatch::new()),
            cancel: Some(cancel_write),
            workers: Vec::with_capacity(self.links.len()),
        };

        // On error `running` drops here, cancelling and joining what started.
        for link in self.links {
            let label = link.label().to_string();
            let cancel = cancel_read
                .try_clone()
                .map_err(|source| RelayError::Duplicate {
                    fd: cancel_read.as_raw_fd(),
                    source,
                })?;
            let latch = Arc::clone(&running.latch);

            let handle = thread::Builder::new()
                .name(format!("relay-{label}"))
                .spawn(move || link.run(cancel.as_fd(), &latch))
                .map_err(|source| RelayError::Spawn { label, source })?;
            running.workers.push(handle);
        }

        debug!(links = running.workers.len(), "relay started");
        Ok(running)
    }
}

/// Relay workers in flight.
///
/// Dropping this value cancels and joins every worker, so no worker outlives
/// the session that started it.
#[derive(Debug)]
pub struct RunningRelay {
    latch: Arc<CompletionLatch>,
    cancel: Option<OwnedFd>,
    workers: Vec<JoinHandle<LinkReport>>,
}

impl RunningRelay {
    pub fn latch(&self) -> &CompletionLatch {
        &self.latch
    }

    /// Block until the first link finishes, whatever the reason
    pub fn await_any_completion(&self) -> Completion {
        self.latch.wait()
    }

    /// Ask every remaining worker to stop. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            debug!("cancelling relay workers");
            // Closing the write end raises POLLHUP in every worker.
            drop(cancel);
        }
    }

    /// Cancel the remaining workers and wait for all of them to exit
    pub fn shutdown(mut self) -> RelayReport {
        self.cancel();
        self.join_all()
    }

    fn join_all(&mut self) -> RelayReport {
        let links = self
            .workers
            .drain(..)
            .filter_map(|handle| match handle.join() {
                Ok(report) => Some(report),
                Err(_) => {
                    error!("relay worker panicked");
                    None
                }
            })
            .collect();

        RelayReport {
            first: self.latch.first(),
            links,
        }
    }
}

impl Drop for RunningRelay {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.cancel();
            self.join_all();
        }
    }
}

/// What every link did, collected at shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    /// The link that released the session
    pub first: Option<Completion>,
    pub links: Vec<LinkReport>,
}

impl RelayReport {
    pub fn link(&self, label: &str) -> Option<&LinkReport> {
        self.links.iter().find(|link| link.label == label)
    }

    pub fn total_bytes(&self) -> u64 {
        self.links.iter().map(|link| link.bytes).sum()
    }
}
