//! Job registry: unique ids for in-flight work and their completions.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rustc_hash::FxHashMap;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Unique identifier for a job, monotonic per registry.
pub type JobId = u64;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Resolved,
    Rejected,
}

/// How a job finished.
#[derive(Debug)]
pub enum Settled<T> {
    /// The work succeeded.
    Resolved(T),
    /// The work ran and failed; the payload describes the failure.
    Rejected(T),
    /// The work could not be carried out at all.
    Failed(Error),
}

impl<T> Settled<T> {
    /// Transform the payload, keeping the outcome.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Settled<U> {
        match self {
            Settled::Resolved(value) => Settled::Resolved(f(value)),
            Settled::Rejected(value) => Settled::Rejected(f(value)),
            Settled::Failed(err) => Settled::Failed(err),
        }
    }

    fn state(&self) -> JobState {
        match self {
            Settled::Resolved(_) => JobState::Resolved,
            Settled::Rejected(_) | Settled::Failed(_) => JobState::Rejected,
        }
    }
}

struct JobEntry<T> {
    state: JobState,
    completion: Option<oneshot::Sender<Settled<T>>>,
}

struct RegistryState<T> {
    next_id: JobId,
    jobs: FxHashMap<JobId, JobEntry<T>>,
}

/// Tracks pending jobs and completes each exactly once.
///
/// Cloning yields another handle to the same registry.
pub struct JobRegistry<T> {
    state: Arc<Mutex<RegistryState<T>>>,
}

impl<T> Clone for JobRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Default for JobRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JobRegistry<T> {
    /// Create an empty registry. The first id issued is 1.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState {
                next_id: 1,
                jobs: FxHashMap::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh id with a pending completion.
    pub fn new_job(&self) -> Job<T> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.jobs.insert(
            id,
            JobEntry {
                state: JobState::Pending,
                completion: Some(tx),
            },
        );

        Job {
            id,
            receiver: rx,
            registry: Arc::downgrade(&self.state),
        }
    }

    /// Complete a job successfully.
    pub fn resolve(&self, id: JobId, value: T) -> Result<()> {
        self.complete(id, Settled::Resolved(value))
    }

    /// Complete a job with a failure payload.
    pub fn reject(&self, id: JobId, value: T) -> Result<()> {
        self.complete(id, Settled::Rejected(value))
    }

    /// Complete a job that could not be carried out.
    pub fn fail(&self, id: JobId, err: Error) -> Result<()> {
        self.complete(id, Settled::Failed(err))
    }

    fn complete(&self, id: JobId, outcome: Settled<T>) -> Result<()> {
        let mut state = self.lock();
        let entry = state.jobs.get_mut(&id).ok_or(Error::UnknownJob(id))?;
        let completion = entry
            .completion
            .take()
            .ok_or(Error::JobAlreadyCompleted(id))?;
        entry.state = outcome.state();
        drop(state);

        // The caller may already have stopped waiting.
        let _ = completion.send(outcome);
        Ok(())
    }

    /// Current state of a job.
    pub fn get(&self, id: JobId) -> Result<JobState> {
        self.lock()
            .jobs
            .get(&id)
            .map(|entry| entry.state)
            .ok_or(Error::UnknownJob(id))
    }

    /// Whether a job is known and still waiting for its completion.
    pub fn is_pending(&self, id: JobId) -> bool {
        matches!(self.get(id), Ok(JobState::Pending))
    }

    /// Number of jobs still tracked.
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    /// Whether no jobs are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail every pending job, e.g. when the worker goes away.
    pub fn fail_all(&self, err: impl Fn() -> Error) -> usize {
        let pending: Vec<_> = {
            let mut state = self.lock();
            state
                .jobs
                .values_mut()
                .filter_map(|entry| {
                    let completion = entry.completion.take()?;
                    entry.state = JobState::Rejected;
                    Some(completion)
                })
                .collect()
        };

        let count = pending.len();
        for completion in pending {
            let _ = completion.send(Settled::Failed(err()));
        }
        count
    }
}

/// Handle to one job's eventual outcome.
///
/// Dropping the handle forgets the job.
pub struct Job<T> {
    id: JobId,
    receiver: oneshot::Receiver<Settled<T>>,
    registry: Weak<Mutex<RegistryState<T>>>,
}

impl<T> Job<T> {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Wait for the job to settle.
    pub async fn outcome(mut self) -> Settled<T> {
        match (&mut self.receiver).await {
            Ok(outcome) => outcome,
            Err(_) => Settled::Failed(Error::WorkerClosed),
        }
    }
}

impl<T> std::fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("id", &self.id).finish()
    }
}

impl<T> Drop for Job<T> {
    fn drop(&mut self) {
        if let Some(state) = self.registry.upgrade() {
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .jobs
                .remove(&self.id);
        }
    }
}
