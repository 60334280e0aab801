//! The R backend.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use regex::Regex;

use crate::config::RunnerConfig;
use crate::error::{Error, Result};
use crate::execute::{Job, JobId, JobState, Session, SessionRef, Settled};
use crate::ipc::{FileEntry, ProcessLauncher, WorkerCommand, WorkerLauncher};
use crate::output::{LoadedFile, RunOutput};
use crate::resources::{DirectoryFetcher, ResourceFetcher};

use super::connection::WorkerConnection;
use super::shared::RunnerCore;
use super::{LanguageRunner, PreloadOptions};

/// Name the previous block's value is bound to before the next block runs.
const LAST_VALUE: &str = ".Last.value";

static PARSE_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^<text>:(\d+):(\d+): (.*)").expect("valid parse error pattern")
});

static PLOT_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Rplot.*\.svg$").expect("valid plot file pattern"));

/// Use `\n` for every line ending.
pub fn normalize_line_endings(code: &str) -> String {
    code.replace("\r\n", "\n").replace('\r', "\n")
}

/// Turn R's `<text>:LINE:COL: message` parse errors into something readable.
pub fn rewrite_parse_error(message: &str) -> String {
    PARSE_ERROR
        .replace(message, "Error on line $1 character $2:\n$3")
        .into_owned()
}

/// Runs R code in a worker, one environment per session.
///
/// The value of each block is kept by the worker and bound as `.Last.value`
/// for the session's next block. Plots are captured as SVG.
pub struct WebRRunner {
    core: Arc<RunnerCore>,
}

impl WebRRunner {
    pub const NAME: &'static str = "webr";

    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        fetcher: Arc<dyn ResourceFetcher>,
        mount_path: &str,
    ) -> Self {
        Self {
            core: Arc::new(RunnerCore::new(
                Self::NAME,
                launcher,
                fetcher,
                mount_path,
                Vec::new(),
            )),
        }
    }

    /// A runner hosting a local R interpreter.
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(
            Arc::new(ProcessLauncher::r(config)),
            Arc::new(DirectoryFetcher::new(&config.resources_dir)),
            &config.mount_path,
        )
    }

    pub fn core(&self) -> &Arc<RunnerCore> {
        &self.core
    }
}

async fn run_block(
    core: Arc<RunnerCore>,
    session: SessionRef,
    code: String,
) -> Result<Settled<RunOutput>> {
    let conn = core.prepare(&session).await?;

    if let Some(handle) = session.last_value() {
        conn.request(WorkerCommand::BindValue {
            namespace_id: session.namespace_id,
            name: LAST_VALUE.to_string(),
            handle,
        })
        .await?;
    }

    let reply = match conn
        .send(WorkerCommand::RunR {
            namespace_id: session.namespace_id,
            context_id: session.context_id.clone(),
            code,
        })?
        .outcome()
        .await
    {
        Settled::Resolved(reply) | Settled::Rejected(reply) => reply,
        Settled::Failed(e) => return Ok(Settled::Failed(e)),
    };

    // A failed block's value is NULL: the worker keeps a handle to it.
    let failed = reply.is_error() && !reply.is_conversion_error();
    if reply.value_handle.is_some() || failed {
        session.set_last_value(reply.value_handle);
    }

    let mut output = RunOutput::from_reply(reply);
    output.error = output.error.as_deref().map(rewrite_parse_error);
    output.stderr = rewrite_parse_error(&output.stderr);
    output.images = match capture_graphics(&conn).await {
        Ok(images) => images,
        Err(e) => {
            tracing::warn!("Failed to collect R graphics: {}", e);
            Vec::new()
        }
    };

    Ok(if failed {
        Settled::Rejected(output)
    } else {
        Settled::Resolved(output)
    })
}

/// Collect and remove the SVG plots the last run wrote to the worker home.
async fn capture_graphics(conn: &WorkerConnection) -> Result<Vec<String>> {
    let listing = conn
        .request(WorkerCommand::ListFiles {
            path: ".".to_string(),
        })
        .await?;
    let entries: Vec<FileEntry> =
        serde_json::from_value(listing.result.unwrap_or_default()).unwrap_or_default();

    let mut images = Vec::new();
    for entry in entries {
        if entry.is_dir || !PLOT_FILE.is_match(&entry.name) {
            continue;
        }

        let data = conn
            .request(WorkerCommand::ReadFile {
                path: entry.name.clone(),
            })
            .await?
            .file_data()?;
        let text = String::from_utf8_lossy(&data).into_owned();
        if text.is_empty() {
            continue;
        }

        images.push(text);
        conn.request(WorkerCommand::RemoveFile { path: entry.name })
            .await?;
    }

    Ok(images)
}

#[async_trait]
impl LanguageRunner for WebRRunner {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn preload(&self, options: PreloadOptions) -> Result<()> {
        self.core.preload(options).await
    }

    fn run_code(&self, code: &str, session: &SessionRef) -> Job<RunOutput> {
        let work = run_block(
            Arc::clone(&self.core),
            session.clone(),
            normalize_line_endings(code),
        );
        self.core.submit(work)
    }

    fn interrupt(&self, job_id: JobId) -> Result<()> {
        self.core.job_state(job_id)?;
        Err(Error::InterruptNotSupported(Self::NAME.to_string()))
    }

    fn job_state(&self, job_id: JobId) -> Result<JobState> {
        self.core.job_state(job_id)
    }

    fn new_session(self: Arc<Self>, context_id: Option<String>) -> Session {
        let namespace_id = self.core.namespaces.allocate();
        Session::new(self, namespace_id, context_id)
    }

    fn release_session(&self, session: &SessionRef) -> BoxFuture<'static, Result<()>> {
        let purge = WorkerCommand::Purge {
            namespace_id: session.namespace_id,
        };
        self.core.release(session, vec![purge])
    }

    async fn read_files(&self, names: &[String]) -> Result<Vec<LoadedFile>> {
        self.core.read_files(names).await
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.core.write_file(path, data).await
    }
}
