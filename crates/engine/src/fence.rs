//! Commit fence shared between a bounded caller and the engine call it
//! dispatched.
//!
//! The caller and the engine race on a single state word: the engine claims
//! it before its first write, the caller claims it when it stops waiting.
//! Whoever claims first decides the outcome, so a call reported as timed out
//! never writes, and a call that started writing is never reported as a
//! retryable timeout.

use experiment_core::{ExperimentError, ExperimentResult};
use std::sync::atomic::{AtomicU8, Ordering};

const PENDING: u8 = 0;
const COMMITTING: u8 = 1;
const ABANDONED: u8 = 2;

#[derive(Debug, Default)]
pub struct CommitFence {
    state: AtomicU8,
}

impl CommitFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called before every write. Fails once the caller has abandoned the
    /// call; later writes of an already committing call pass.
    pub fn begin_commit(&self) -> ExperimentResult<()> {
        match self
            .state
            .compare_exchange(PENDING, COMMITTING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) | Err(COMMITTING) => Ok(()),
            Err(_) => Err(ExperimentError::Timeout(
                "caller stopped waiting before commit".to_string(),
            )),
        }
    }

    /// Called by the waiting side on timeout. Returns `true` when no write
    /// has started and none will; `false` when a commit is under way.
    pub fn abandon(&self) -> bool {
        match self
            .state
            .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) | Err(ABANDONED) => true,
            Err(_) => false,
        }
    }
}
