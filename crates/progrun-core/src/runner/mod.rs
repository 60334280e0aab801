//! Language runners.
//!
//! Each backend implements [`LanguageRunner`] on top of a shared
//! [`RunnerCore`]: job registry, execution queue, namespace cache, context
//! store and a worker connection started on first use.

mod connection;
mod pyodide;
mod registry;
mod shared;
mod webr;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::execute::{Job, JobId, JobState, Session, SessionRef};
use crate::output::{LoadedFile, RunOutput};

pub use connection::WorkerConnection;
pub use pyodide::PyodideRunner;
pub use registry::LanguageRunners;
pub use shared::RunnerCore;
pub use webr::{WebRRunner, normalize_line_endings, rewrite_parse_error};

/// What to set up before running code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadOptions {
    /// Packages to install or import.
    pub packages: Vec<String>,
    /// Question resources to make visible to code in `context_id`.
    pub files: Vec<String>,
    /// Context the files belong to; the default context when absent.
    pub context_id: Option<String>,
}

impl From<Vec<String>> for PreloadOptions {
    /// A bare list is a list of packages.
    fn from(packages: Vec<String>) -> Self {
        Self {
            packages,
            ..Self::default()
        }
    }
}

/// Capabilities every backend offers.
#[async_trait]
pub trait LanguageRunner: Send + Sync {
    /// Backend name, e.g. `pyodide`.
    fn name(&self) -> &'static str;

    /// Start the backend if needed, then install packages and register
    /// context files. Repeating a preload does no extra work.
    async fn preload(&self, options: PreloadOptions) -> Result<()>;

    /// Queue `code` to run in `session` and return its job at once.
    fn run_code(&self, code: &str, session: &SessionRef) -> Job<RunOutput>;

    /// Ask a job to stop.
    fn interrupt(&self, job_id: JobId) -> Result<()>;

    /// State of a job issued by this runner.
    fn job_state(&self, job_id: JobId) -> Result<JobState>;

    /// Start a session with a fresh namespace.
    fn new_session(self: Arc<Self>, context_id: Option<String>) -> Session;

    /// Release what the worker holds for a session.
    fn release_session(&self, session: &SessionRef) -> BoxFuture<'static, Result<()>>;

    /// Read files back from the worker's filesystem.
    async fn read_files(&self, names: &[String]) -> Result<Vec<LoadedFile>>;

    /// Write a file into the worker's filesystem.
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;
}
