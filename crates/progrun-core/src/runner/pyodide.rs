//! The Python backend.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::config::RunnerConfig;
use crate::error::{Error, Result};
use crate::execute::{Job, JobId, JobState, Session, SessionRef, Settled};
use crate::ipc::{ProcessLauncher, WorkerCommand, WorkerLauncher};
use crate::output::{LoadedFile, RunOutput};
use crate::resources::{DirectoryFetcher, ResourceFetcher};

use super::shared::RunnerCore;
use super::{LanguageRunner, PreloadOptions};

/// Runs Python code in a worker, one namespace per session.
pub struct PyodideRunner {
    core: Arc<RunnerCore>,
    interrupt_enabled: bool,
}

impl PyodideRunner {
    pub const NAME: &'static str = "pyodide";

    /// Create a runner over any worker transport.
    ///
    /// With `interrupt_enabled` the worker is told to turn interrupt signals
    /// into `KeyboardInterrupt` as soon as it starts.
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        fetcher: Arc<dyn ResourceFetcher>,
        mount_path: &str,
        interrupt_enabled: bool,
    ) -> Self {
        let init_commands = if interrupt_enabled {
            vec![WorkerCommand::EnableInterrupt]
        } else {
            Vec::new()
        };

        Self {
            core: Arc::new(RunnerCore::new(
                Self::NAME,
                launcher,
                fetcher,
                mount_path,
                init_commands,
            )),
            interrupt_enabled,
        }
    }

    /// A runner hosting a local Python interpreter.
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(
            Arc::new(ProcessLauncher::python(config)),
            Arc::new(DirectoryFetcher::new(&config.resources_dir)),
            &config.mount_path,
            config.interrupt,
        )
    }

    pub fn core(&self) -> &Arc<RunnerCore> {
        &self.core
    }
}

#[async_trait]
impl LanguageRunner for PyodideRunner {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn preload(&self, options: PreloadOptions) -> Result<()> {
        self.core.preload(options).await
    }

    fn run_code(&self, code: &str, session: &SessionRef) -> Job<RunOutput> {
        let core = Arc::clone(&self.core);
        let session = session.clone();
        let code = code.to_string();

        self.core.submit(async move {
            let conn = core.prepare(&session).await?;
            if core.take_interrupt() {
                return Ok(Settled::Rejected(RunOutput::interrupted()));
            }
            let reply = conn
                .send(WorkerCommand::RunPython {
                    namespace_id: session.namespace_id,
                    context_id: session.context_id.clone(),
                    code,
                })?
                .outcome()
                .await;
            Ok::<_, Error>(reply.map(RunOutput::from_reply))
        })
    }

    fn interrupt(&self, job_id: JobId) -> Result<()> {
        self.core.job_state(job_id)?;
        if !self.interrupt_enabled {
            return Err(Error::InterruptNotSupported(Self::NAME.to_string()));
        }

        let signal = match self.core.existing_connection() {
            Some(conn) => match conn.interrupt_signal() {
                Some(signal) => Some(Arc::clone(signal)),
                None => return Err(Error::InterruptNotSupported(Self::NAME.to_string())),
            },
            None => None,
        };
        self.core.interrupt_job(job_id, signal.as_ref())
    }

    fn job_state(&self, job_id: JobId) -> Result<JobState> {
        self.core.job_state(job_id)
    }

    fn new_session(self: Arc<Self>, context_id: Option<String>) -> Session {
        let namespace_id = self.core.namespaces.allocate();
        Session::new(self, namespace_id, context_id)
    }

    fn release_session(&self, session: &SessionRef) -> BoxFuture<'static, Result<()>> {
        self.core.release(session, Vec::new())
    }

    async fn read_files(&self, names: &[String]) -> Result<Vec<LoadedFile>> {
        self.core.read_files(names).await
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.core.write_file(path, data).await
    }
}
