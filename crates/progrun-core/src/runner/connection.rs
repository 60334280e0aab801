//! Request/reply bookkeeping over a worker link.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::execute::{Job, JobRegistry, Settled};
use crate::ipc::{InterruptSignal, WorkerCommand, WorkerLauncher, WorkerMessage, WorkerReply};

/// An initialized worker.
///
/// Every command is tracked as a job in the connection's own registry and
/// completed when the reply carrying its id comes back.
pub struct WorkerConnection {
    name: String,
    commands: mpsc::UnboundedSender<WorkerMessage>,
    requests: JobRegistry<WorkerReply>,
    interrupt: Option<Arc<dyn InterruptSignal>>,
    info: Option<Value>,
    /// Set once the reply stream has ended.
    closed: Arc<AtomicBool>,
}

impl WorkerConnection {
    /// Launch a worker and wait for its `init` handshake.
    pub async fn open(launcher: &dyn WorkerLauncher, name: &str) -> Result<Self> {
        let link = launcher.launch().await?;
        let requests = JobRegistry::new();
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(dispatch_replies(
            name.to_string(),
            link.replies,
            requests.clone(),
            Arc::clone(&closed),
        ));

        let mut conn = Self {
            name: name.to_string(),
            commands: link.commands,
            requests,
            interrupt: link.interrupt,
            info: None,
            closed,
        };

        let ready = conn.request(WorkerCommand::Init).await?;
        tracing::debug!("{} worker ready: {:?}", name, ready.result);
        conn.info = ready.result;

        Ok(conn)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// What the worker reported about itself during the handshake.
    pub fn info(&self) -> Option<&Value> {
        self.info.as_ref()
    }

    pub fn interrupt_signal(&self) -> Option<&Arc<dyn InterruptSignal>> {
        self.interrupt.as_ref()
    }

    /// Whether the worker has gone away. Every later command fails.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a command; the returned job settles when its reply arrives.
    ///
    /// Replies with an `error` reject the job, except conversion errors,
    /// which resolve: the code ran and its output is still wanted.
    pub fn send(&self, command: WorkerCommand) -> Result<Job<WorkerReply>> {
        if self.is_closed() {
            return Err(Error::WorkerClosed);
        }

        let job = self.requests.new_job();
        tracing::debug!("{} job {}: {}", self.name, job.id(), command_name(&command));

        self.commands
            .send(WorkerMessage {
                job_id: job.id(),
                command,
            })
            .map_err(|_| Error::WorkerClosed)?;

        // The reply stream may have ended after the first check but before
        // the job was registered, so `fail_all` never saw it.
        if self.is_closed() {
            let _ = self.requests.fail(job.id(), Error::WorkerClosed);
        }
        Ok(job)
    }

    /// Send a command and wait for a successful reply.
    pub async fn request(&self, command: WorkerCommand) -> Result<WorkerReply> {
        match self.send(command)?.outcome().await {
            Settled::Resolved(reply) => Ok(reply),
            Settled::Rejected(reply) => Err(Error::Worker(reply.error.unwrap_or_default())),
            Settled::Failed(e) => Err(e),
        }
    }
}

fn command_name(command: &WorkerCommand) -> &'static str {
    match command {
        WorkerCommand::Init => "init",
        WorkerCommand::Preload { .. } => "preload",
        WorkerCommand::EnableInterrupt => "enableInterrupt",
        WorkerCommand::RunPython { .. } => "runPython",
        WorkerCommand::RunR { .. } => "runR",
        WorkerCommand::CreateNamespace { .. } => "createNamespace",
        WorkerCommand::DropNamespace { .. } => "dropNamespace",
        WorkerCommand::BindValue { .. } => "bindValue",
        WorkerCommand::Purge { .. } => "purge",
        WorkerCommand::Mount { .. } => "mount",
        WorkerCommand::Unmount { .. } => "unmount",
        WorkerCommand::WriteFile { .. } => "writeFile",
        WorkerCommand::ReadFile { .. } => "readFile",
        WorkerCommand::ListFiles { .. } => "listFiles",
        WorkerCommand::RemoveFile { .. } => "removeFile",
        WorkerCommand::Shutdown => "shutdown",
    }
}

async fn dispatch_replies(
    name: String,
    mut replies: mpsc::UnboundedReceiver<WorkerReply>,
    requests: JobRegistry<WorkerReply>,
    closed: Arc<AtomicBool>,
) {
    while let Some(reply) = replies.recv().await {
        let id = reply.job_id;
        let settled = if reply.is_error() && !reply.is_conversion_error() {
            requests.reject(id, reply)
        } else {
            requests.resolve(id, reply)
        };

        if let Err(e) = settled {
            tracing::error!("{} worker sent an unexpected reply: {}", name, e);
        }
    }

    closed.store(true, Ordering::SeqCst);
    let failed = requests.fail_all(|| Error::WorkerClosed);
    if failed > 0 {
        tracing::warn!("{} worker closed with {} requests outstanding", name, failed);
    } else {
        tracing::debug!("{} worker closed", name);
    }
}
