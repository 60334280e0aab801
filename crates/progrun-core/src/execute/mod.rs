//! Job bookkeeping, queuing, namespaces and sessions.

mod jobs;
mod namespace;
mod queue;
mod session;

pub use jobs::{Job, JobId, JobRegistry, JobState, Settled};
pub use namespace::{Namespace, NamespaceId, NamespaceManager};
pub use queue::ExecutionQueue;
pub use session::{Session, SessionRef, run_code_blocks};
