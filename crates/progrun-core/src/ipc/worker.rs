//! Worker process management for progrun backends.
//!
//! A [`WorkerLauncher`] produces a [`WorkerLink`]: a command sender, a reply
//! receiver and, when the transport supports it, an [`InterruptSignal`].
//! [`ProcessLauncher`] runs an interpreter child process hosting one of the
//! embedded worker scripts.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use crate::config::RunnerConfig;
use crate::error::{Error, Result};

use super::protocol::{WorkerCommand, WorkerMessage, WorkerReply, read_message, write_message};

/// Worker script hosting Python code.
const PYTHON_WORKER: &str = include_str!("scripts/python_worker.py");

/// Worker script hosting R code.
const R_WORKER: &str = include_str!("scripts/r_worker.R");

/// Live channel pair to a worker.
pub struct WorkerLink {
    /// Commands to the worker, delivered in send order.
    pub commands: mpsc::UnboundedSender<WorkerMessage>,
    /// Replies from the worker, in whatever order it produces them.
    pub replies: mpsc::UnboundedReceiver<WorkerReply>,
    /// Present when running code can be interrupted.
    pub interrupt: Option<Arc<dyn InterruptSignal>>,
}

/// Interrupts whatever the worker is currently running.
pub trait InterruptSignal: Send + Sync {
    fn interrupt(&self) -> Result<()>;
}

/// Starts workers.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker and connect to it.
    async fn launch(&self) -> Result<WorkerLink>;
}

/// Launches interpreter child processes speaking the line protocol.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    /// Interpreter program, resolved on PATH at launch.
    program: PathBuf,
    /// Arguments placed before the script path.
    args: Vec<String>,
    /// Worker script source.
    script: &'static str,
    /// File name the script is written to inside the worker home.
    script_name: &'static str,
    /// Whether to expose an interrupt signal.
    interruptible: bool,
}

impl ProcessLauncher {
    /// Launcher for the Python backend.
    pub fn python(config: &RunnerConfig) -> Self {
        Self {
            program: config.python.clone(),
            args: vec!["-u".to_string()],
            script: PYTHON_WORKER,
            script_name: ".progrun_worker.py",
            interruptible: config.interrupt,
        }
    }

    /// Launcher for the R backend.
    ///
    /// R workers are never interruptible: a signal would end the session.
    pub fn r(config: &RunnerConfig) -> Self {
        Self {
            program: config.rscript.clone(),
            args: vec!["--vanilla".to_string()],
            script: R_WORKER,
            script_name: ".progrun_worker.R",
            interruptible: false,
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<WorkerLink> {
        let program = RunnerConfig::resolve_program(&self.program)?;

        // Private home: working directory, mount root and plot output location.
        let home = tempfile::Builder::new().prefix("progrun-worker-").tempdir()?;
        let script_path = home.path().join(self.script_name);
        tokio::fs::write(&script_path, self.script).await?;

        let mut child = Command::new(&program)
            .args(&self.args)
            .arg(&script_path)
            .current_dir(home.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Ipc(format!(
                    "Failed to spawn worker process '{}': {}",
                    program.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdout".to_string()))?;
        let stderr = child.stderr.take();

        let pid = child.id();
        tracing::debug!(
            "Spawned worker {} (pid {:?}) in {}",
            program.display(),
            pid,
            home.path().display()
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        // The writer owns the child and its home: when the runner drops its
        // sender the worker is shut down, killed and its files removed.
        tokio::spawn(write_commands(child, stdin, command_rx, home));
        tokio::spawn(read_replies(stdout, reply_tx));

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "progrun::worker", "{}", line);
                }
            });
        }

        let interrupt = match pid {
            Some(pid) if self.interruptible && cfg!(unix) => {
                Some(Arc::new(ProcessInterrupt { pid }) as Arc<dyn InterruptSignal>)
            }
            _ => None,
        };

        Ok(WorkerLink {
            commands: command_tx,
            replies: reply_rx,
            interrupt,
        })
    }
}

async fn write_commands(
    mut child: Child,
    stdin: ChildStdin,
    mut commands: mpsc::UnboundedReceiver<WorkerMessage>,
    home: tempfile::TempDir,
) {
    let mut writer = BufWriter::new(stdin);

    loop {
        tokio::select! {
            message = commands.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = write_message(&mut writer, &message).await {
                    tracing::warn!("Worker stopped accepting commands: {}", e);
                    break;
                }
            }
            status = child.wait() => {
                match status {
                    Ok(status) => tracing::warn!("Worker exited unexpectedly: {}", status),
                    Err(e) => tracing::warn!("Failed to wait for worker: {}", e),
                }
                // Later sends fail instead of queueing behind a dead process.
                drop(commands);
                drop(writer);
                drop(home);
                return;
            }
        }
    }

    let shutdown = WorkerMessage {
        job_id: 0,
        command: WorkerCommand::Shutdown,
    };
    let _ = write_message(&mut writer, &shutdown).await;
    drop(writer);

    if let Err(e) = child.kill().await {
        tracing::debug!("Worker already exited: {}", e);
    }
    drop(home);
}

async fn read_replies(stdout: ChildStdout, replies: mpsc::UnboundedSender<WorkerReply>) {
    let mut reader = BufReader::new(stdout);

    loop {
        match read_message::<_, WorkerReply>(&mut reader).await {
            Ok(Some(reply)) => {
                if replies.send(reply).is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!("Worker closed its reply stream");
                break;
            }
            Err(Error::Serialization(message)) => {
                tracing::error!("Discarding malformed worker reply: {}", message);
            }
            Err(e) => {
                tracing::warn!("Failed to read from worker: {}", e);
                break;
            }
        }
    }
}

/// Sends `SIGINT` to a worker process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessInterrupt {
    pid: u32,
}

impl InterruptSignal for ProcessInterrupt {
    fn interrupt(&self) -> Result<()> {
        #[cfg(unix)]
        {
            // SAFETY: kill(2) has no memory-safety preconditions.
            let status = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGINT) };
            if status != 0 {
                return Err(Error::Ipc(format!(
                    "Failed to interrupt worker {}: {}",
                    self.pid,
                    std::io::Error::last_os_error()
                )));
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            Err(Error::InterruptNotSupported(format!("process {}", self.pid)))
        }
    }
}
