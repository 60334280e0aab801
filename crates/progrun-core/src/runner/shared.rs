//! Parts shared by every backend runner.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::FutureExt;
use futures::future::BoxFuture;
use rustc_hash::FxHashSet;
use tokio::sync::OnceCell;

use crate::error::{Error, Result};
use crate::execute::{
    ExecutionQueue, Job, JobId, JobRegistry, JobState, NamespaceManager, SessionRef, Settled,
};
use crate::ipc::{InterruptSignal, WorkerCommand, WorkerLauncher};
use crate::output::{LoadedFile, RunOutput, mime_type_for};
use crate::resources::{ContextStore, DEFAULT_CONTEXT, ResourceFetcher};

use super::PreloadOptions;
use super::connection::WorkerConnection;

/// Job registry, queue, namespace cache, contexts and a lazily started worker.
///
/// Backends hold one behind an `Arc` so queued work can keep it alive.
pub struct RunnerCore {
    name: &'static str,
    launcher: Arc<dyn WorkerLauncher>,
    fetcher: Arc<dyn ResourceFetcher>,
    connection: OnceCell<Arc<WorkerConnection>>,
    /// Commands sent once, right after the handshake.
    init_commands: Vec<WorkerCommand>,
    pub(crate) jobs: JobRegistry<RunOutput>,
    queue: ExecutionQueue,
    pub(crate) namespaces: NamespaceManager,
    pub(crate) contexts: ContextStore,
    preloaded: Mutex<FxHashSet<String>>,
    running: Mutex<Option<JobId>>,
    cancelled: Mutex<FxHashSet<JobId>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RunnerCore {
    pub fn new(
        name: &'static str,
        launcher: Arc<dyn WorkerLauncher>,
        fetcher: Arc<dyn ResourceFetcher>,
        mount_path: &str,
        init_commands: Vec<WorkerCommand>,
    ) -> Self {
        Self {
            name,
            launcher,
            fetcher,
            connection: OnceCell::new(),
            init_commands,
            jobs: JobRegistry::new(),
            queue: ExecutionQueue::new(),
            namespaces: NamespaceManager::new(),
            contexts: ContextStore::new(mount_path),
            preloaded: Mutex::new(FxHashSet::default()),
            running: Mutex::new(None),
            cancelled: Mutex::new(FxHashSet::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn contexts(&self) -> &ContextStore {
        &self.contexts
    }

    pub fn namespaces(&self) -> &NamespaceManager {
        &self.namespaces
    }

    /// The worker connection, launching the worker on first use.
    ///
    /// Concurrent callers share one launch. A failed launch is retried by
    /// the next caller.
    pub async fn connection(&self) -> Result<Arc<WorkerConnection>> {
        let conn = self
            .connection
            .get_or_try_init(|| async {
                tracing::debug!("Starting {} worker", self.name);
                let conn = WorkerConnection::open(&*self.launcher, self.name).await?;
                for command in &self.init_commands {
                    conn.request(command.clone()).await?;
                }
                Ok::<_, Error>(Arc::new(conn))
            })
            .await?;
        Ok(Arc::clone(conn))
    }

    /// The worker connection if it has already been started.
    pub fn existing_connection(&self) -> Option<&Arc<WorkerConnection>> {
        self.connection.get()
    }

    /// Connect, mount the session's context and make sure its namespace exists.
    ///
    /// Only call this from queued work.
    pub async fn prepare(&self, session: &SessionRef) -> Result<Arc<WorkerConnection>> {
        let conn = self.connection().await?;
        self.contexts
            .activate(session.context_id.as_deref(), &conn)
            .await?;
        self.namespaces
            .namespace_for(session.namespace_id, &conn)
            .await?;
        Ok(conn)
    }

    /// Allocate a job for `work`, queue it and return the job immediately.
    pub fn submit<Fut>(self: &Arc<Self>, work: Fut) -> Job<RunOutput>
    where
        Fut: Future<Output = Result<Settled<RunOutput>>> + Send + 'static,
    {
        let job = self.jobs.new_job();
        let id = job.id();

        let core = Arc::clone(self);
        let queued = self.queue.enqueue(async move {
            if locked(&core.cancelled).remove(&id) {
                tracing::debug!("{} job {} interrupted before it started", core.name, id);
                return Ok(Settled::Rejected(RunOutput::interrupted()));
            }

            *locked(&core.running) = Some(id);
            let outcome = work.await;
            *locked(&core.running) = None;
            locked(&core.cancelled).remove(&id);
            outcome
        });

        let jobs = self.jobs.clone();
        let name = self.name;
        tokio::spawn(async move {
            let settled = match queued.await {
                Ok(Ok(Settled::Resolved(output))) => jobs.resolve(id, output),
                Ok(Ok(Settled::Rejected(output))) => jobs.reject(id, output),
                Ok(Ok(Settled::Failed(e))) | Ok(Err(e)) | Err(e) => jobs.fail(id, e),
            };
            if let Err(e) = settled {
                tracing::debug!("{} job {} settled after it was forgotten: {}", name, id, e);
            }
        });

        job
    }

    /// State of a job issued by this runner.
    pub fn job_state(&self, id: JobId) -> Result<JobState> {
        self.jobs.get(id)
    }

    /// Interrupt a job: signal the worker if the job is running, or make it
    /// finish as interrupted without running if it is still queued or its
    /// worker is still starting.
    pub fn interrupt_job(&self, id: JobId, signal: Option<&Arc<dyn InterruptSignal>>) -> Result<()> {
        if self.jobs.get(id)? != JobState::Pending {
            return Ok(());
        }

        if *locked(&self.running) == Some(id) {
            tracing::debug!("Interrupting running {} job {}", self.name, id);
            return match signal {
                Some(signal) => signal.interrupt(),
                None => {
                    // Still waiting for the worker: stop before the code is sent.
                    locked(&self.cancelled).insert(id);
                    Ok(())
                }
            };
        }

        locked(&self.cancelled).insert(id);
        Ok(())
    }

    /// Whether the running job was interrupted before its code reached the
    /// worker. Clears the request.
    pub fn take_interrupt(&self) -> bool {
        let Some(id) = *locked(&self.running) else {
            return false;
        };
        locked(&self.cancelled).remove(&id)
    }

    /// Install packages not installed before, then register context files.
    pub async fn preload(&self, options: PreloadOptions) -> Result<()> {
        let conn = self.connection().await?;

        let fresh: Vec<String> = {
            let mut preloaded = locked(&self.preloaded);
            options
                .packages
                .iter()
                .filter(|package| preloaded.insert((*package).clone()))
                .cloned()
                .collect()
        };

        if !fresh.is_empty() {
            tracing::debug!("Preloading {} packages: {:?}", self.name, fresh);
            let packages = fresh.clone();
            let outcome = self
                .queue
                .enqueue(async move { conn.request(WorkerCommand::Preload { packages }).await })
                .await
                .and_then(|reply| reply);

            if let Err(e) = outcome {
                let mut preloaded = locked(&self.preloaded);
                for package in &fresh {
                    preloaded.remove(package);
                }
                return Err(e);
            }
        }

        if !options.files.is_empty() {
            let context_id = options.context_id.as_deref().unwrap_or(DEFAULT_CONTEXT);
            self.contexts
                .register_files(&*self.fetcher, context_id, &options.files)
                .await?;
        }

        Ok(())
    }

    /// Read files from the worker's filesystem, in order with queued code.
    pub async fn read_files(self: &Arc<Self>, names: &[String]) -> Result<Vec<LoadedFile>> {
        let core = Arc::clone(self);
        let names = names.to_vec();

        self.queue
            .enqueue(async move {
                let conn = core.connection().await?;
                let mut files = Vec::with_capacity(names.len());
                for name in names {
                    let data = conn
                        .request(WorkerCommand::ReadFile { path: name.clone() })
                        .await
                        .and_then(|reply| reply.file_data());
                    files.push(match data {
                        Ok(bytes) => loaded_file(name, bytes),
                        Err(e) => LoadedFile::missing(&name, e.to_string()),
                    });
                }
                Ok::<_, Error>(files)
            })
            .await?
    }

    /// Write a file into the worker's filesystem, in order with queued code.
    pub async fn write_file(self: &Arc<Self>, path: &str, data: &[u8]) -> Result<()> {
        let core = Arc::clone(self);
        let command = WorkerCommand::WriteFile {
            path: path.to_string(),
            data: BASE64.encode(data),
        };

        self.queue
            .enqueue(async move {
                core.connection().await?.request(command).await?;
                Ok::<_, Error>(())
            })
            .await?
    }

    /// Queue the release of a session's namespace, after `cleanup` commands.
    ///
    /// Nothing is sent if the worker never started or the namespace was
    /// never created.
    pub fn release(
        self: &Arc<Self>,
        session: &SessionRef,
        cleanup: Vec<WorkerCommand>,
    ) -> BoxFuture<'static, Result<()>> {
        let core = Arc::clone(self);
        let namespace_id = session.namespace_id;

        let queued = self.queue.enqueue(async move {
            let Some(conn) = core.existing_connection().cloned() else {
                return Ok(());
            };
            if !core.namespaces.exists(namespace_id) {
                return Ok(());
            }
            for command in cleanup {
                conn.request(command).await?;
            }
            core.namespaces.release(namespace_id, &conn).await
        });

        async move { queued.await? }.boxed()
    }
}

fn loaded_file(name: String, bytes: Vec<u8>) -> LoadedFile {
    let (mime_type, binary) = mime_type_for(&name);
    let (text, data) = if binary {
        (None, Some(BASE64.encode(&bytes)))
    } else {
        (Some(String::from_utf8_lossy(&bytes).into_owned()), None)
    };

    LoadedFile {
        name,
        exists: true,
        text,
        data,
        mime_type: Some(mime_type.to_string()),
        error: None,
    }
}
