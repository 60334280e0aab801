//! In-process fake worker for driving runners in tests.
//!
//! Speaks the worker protocol and runs a tiny line language:
//!
//! - `name = expr` binds; a bare `expr` is the value of the block
//! - expressions are integers and names joined by `+` and `*`
//! - `print expr`, `warn text` (to stderr), `fail text` (raises)
//! - `opaque` makes the block's value unconvertible
//! - `sleep ms`, `loop` (runs until interrupted)
//! - `files` lists the mounted file names
//! - `plot name` writes `Rplot<name>.svg` into the worker home
//! - `exit` ends the worker's replies while its command channel stays open,
//!   like a process that died under its runner
//!
//! Statements are separated by newlines or `;`.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use progrun_core::ipc::{
    CONVERSION_ERROR, FileEntry, InterruptSignal, WorkerCommand, WorkerLauncher, WorkerLink,
    WorkerMessage, WorkerReply,
};
use progrun_core::{
    Error, LanguageRunner, PyodideRunner, ResourceFetcher, Result, RunResult, WebRRunner,
};
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc, watch};

/// Mount point used by test runners.
pub const MOUNT: &str = "resources";

struct Shared {
    interruptible: bool,
    latency_ms: u64,
    log: Mutex<Vec<WorkerCommand>>,
    launches: AtomicUsize,
    installs: AtomicUsize,
    interrupt: Notify,
    killed: watch::Sender<bool>,
}

/// Launches fake workers and records what they were asked to do.
#[derive(Clone)]
pub struct FakeLauncher {
    shared: Arc<Shared>,
}

impl FakeLauncher {
    fn build(interruptible: bool, latency_ms: u64) -> Self {
        let (killed, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                interruptible,
                latency_ms,
                log: Mutex::new(Vec::new()),
                launches: AtomicUsize::new(0),
                installs: AtomicUsize::new(0),
                interrupt: Notify::new(),
                killed,
            }),
        }
    }

    pub fn new() -> Self {
        Self::build(false, 0)
    }

    /// Workers expose an interrupt signal.
    pub fn interruptible() -> Self {
        Self::build(true, 0)
    }

    /// Replies are held back by up to `max_ms`, so they overtake each other.
    pub fn with_latency(max_ms: u64) -> Self {
        Self::build(false, max_ms)
    }

    /// Every command received so far, in order.
    pub fn commands(&self) -> Vec<WorkerCommand> {
        self.shared.log.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&WorkerCommand) -> bool) -> usize {
        self.commands().iter().filter(|c| pred(c)).count()
    }

    /// Code blocks received, of either language.
    pub fn runs(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                WorkerCommand::RunPython { code, .. } | WorkerCommand::RunR { code, .. } => {
                    Some(code)
                }
                _ => None,
            })
            .collect()
    }

    pub fn launches(&self) -> usize {
        self.shared.launches.load(Ordering::SeqCst)
    }

    pub fn installs(&self) -> usize {
        self.shared.installs.load(Ordering::SeqCst)
    }

    /// Make the worker exit without replying to anything outstanding.
    pub fn kill(&self) {
        self.shared.killed.send_replace(true);
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self) -> Result<WorkerLink> {
        self.shared.launches.fetch_add(1, Ordering::SeqCst);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(Arc::clone(&self.shared), command_rx, reply_tx));

        let interrupt = if self.shared.interruptible {
            Some(Arc::new(FakeInterrupt(Arc::clone(&self.shared))) as Arc<dyn InterruptSignal>)
        } else {
            None
        };

        Ok(WorkerLink {
            commands: command_tx,
            replies: reply_rx,
            interrupt,
        })
    }
}

struct FakeInterrupt(Arc<Shared>);

impl InterruptSignal for FakeInterrupt {
    fn interrupt(&self) -> Result<()> {
        self.0.interrupt.notify_one();
        Ok(())
    }
}

async fn until_killed(killed: &mut watch::Receiver<bool>) {
    while !*killed.borrow_and_update() {
        if killed.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn serve(
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<WorkerMessage>,
    replies: mpsc::UnboundedSender<WorkerReply>,
) {
    let mut killed = shared.killed.subscribe();
    let mut worker = FakeWorker::default();

    loop {
        let message = tokio::select! {
            message = commands.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = until_killed(&mut killed) => break,
        };

        shared.log.lock().unwrap().push(message.command.clone());
        let shutdown = matches!(message.command, WorkerCommand::Shutdown);

        let Some(mut reply) = worker.handle(&shared, &mut killed, message.command).await else {
            if worker.exited {
                drop(replies);
                while let Some(message) = commands.recv().await {
                    shared.log.lock().unwrap().push(message.command);
                }
            }
            break;
        };
        reply.job_id = message.job_id;

        let delay = if shared.latency_ms == 0 {
            0
        } else {
            (message.job_id * 7919) % shared.latency_ms
        };
        let replies = replies.clone();
        tokio::spawn(async move {
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let _ = replies.send(reply);
        });

        if shutdown {
            break;
        }
    }
}

fn ok() -> WorkerReply {
    WorkerReply::default()
}

fn ok_with(result: Value) -> WorkerReply {
    WorkerReply {
        result: Some(result),
        ..Default::default()
    }
}

fn err(message: impl Into<String>) -> WorkerReply {
    WorkerReply {
        error: Some(message.into()),
        error_name: Some("Error".to_string()),
        ..Default::default()
    }
}

fn raised(message: String, stdout: String, mut stderr: String) -> WorkerReply {
    stderr.push_str(&message);
    stderr.push('\n');
    WorkerReply {
        error: Some(message),
        error_name: Some("Error".to_string()),
        stdout,
        stderr,
        ..Default::default()
    }
}

#[derive(Default)]
struct FakeWorker {
    namespaces: HashMap<u64, HashMap<String, Value>>,
    mounted: Option<(String, BTreeMap<String, Vec<u8>>)>,
    files: BTreeMap<String, Vec<u8>>,
    values: HashMap<u64, (u64, Value)>,
    next_handle: u64,
    installed: HashSet<String>,
    interrupts_enabled: bool,
    exited: bool,
}

impl FakeWorker {
    async fn handle(
        &mut self,
        shared: &Shared,
        killed: &mut watch::Receiver<bool>,
        command: WorkerCommand,
    ) -> Option<WorkerReply> {
        let reply = match command {
            WorkerCommand::Init => ok_with(json!({"language": "fake"})),
            WorkerCommand::Preload { packages } => {
                for package in packages {
                    if package == "missing" {
                        return Some(err("No module named 'missing'"));
                    }
                    if self.installed.insert(package) {
                        shared.installs.fetch_add(1, Ordering::SeqCst);
                    }
                }
                ok()
            }
            WorkerCommand::EnableInterrupt => {
                self.interrupts_enabled = true;
                ok()
            }
            WorkerCommand::RunPython {
                namespace_id, code, ..
            } => return self.run(shared, killed, namespace_id, &code, false).await,
            WorkerCommand::RunR {
                namespace_id, code, ..
            } => return self.run(shared, killed, namespace_id, &code, true).await,
            WorkerCommand::CreateNamespace { namespace_id } => {
                if self.namespaces.contains_key(&namespace_id) {
                    err(format!("namespace {namespace_id} already exists"))
                } else {
                    self.namespaces.insert(namespace_id, HashMap::new());
                    ok()
                }
            }
            WorkerCommand::DropNamespace { namespace_id } => {
                self.namespaces.remove(&namespace_id);
                ok()
            }
            WorkerCommand::BindValue {
                namespace_id,
                name,
                handle,
            } => match (
                self.values.get(&handle),
                self.namespaces.get_mut(&namespace_id),
            ) {
                (Some((_, value)), Some(scope)) => {
                    scope.insert(name, value.clone());
                    ok()
                }
                _ => err(format!("can't bind handle {handle}")),
            },
            WorkerCommand::Purge { namespace_id } => {
                self.values.retain(|_, (owner, _)| *owner != namespace_id);
                ok()
            }
            WorkerCommand::Mount { path, files } => {
                if self.mounted.is_some() {
                    err(format!("{path} is already mounted"))
                } else {
                    let files = files
                        .into_iter()
                        .map(|f| (f.name, BASE64.decode(f.data).unwrap()))
                        .collect();
                    self.mounted = Some((path, files));
                    ok()
                }
            }
            WorkerCommand::Unmount { .. } => {
                self.mounted = None;
                ok()
            }
            WorkerCommand::WriteFile { path, data } => {
                self.files.insert(path, BASE64.decode(data).unwrap());
                ok()
            }
            WorkerCommand::ReadFile { path } => match self.read(&path) {
                Some(data) => ok_with(json!({"data": BASE64.encode(data)})),
                None => err(format!("No such file: {path}")),
            },
            WorkerCommand::ListFiles { .. } => {
                let mut entries: Vec<FileEntry> = self
                    .files
                    .keys()
                    .map(|name| FileEntry {
                        name: name.clone(),
                        is_dir: false,
                    })
                    .collect();
                if let Some((path, _)) = &self.mounted {
                    entries.push(FileEntry {
                        name: path.clone(),
                        is_dir: true,
                    });
                }
                ok_with(serde_json::to_value(entries).unwrap())
            }
            WorkerCommand::RemoveFile { path } => match self.files.remove(&path) {
                Some(_) => ok(),
                None => err(format!("No such file: {path}")),
            },
            WorkerCommand::Shutdown => ok(),
        };
        Some(reply)
    }

    fn read(&self, path: &str) -> Option<&Vec<u8>> {
        if let Some(data) = self.files.get(path) {
            return Some(data);
        }
        let (mount, files) = self.mounted.as_ref()?;
        let name = path.strip_prefix(mount.as_str())?.strip_prefix('/')?;
        files.get(name)
    }

    fn eval(&self, namespace_id: u64, expr: &str) -> std::result::Result<Value, String> {
        let scope = &self.namespaces[&namespace_id];
        if let Some(value) = scope.get(expr.trim()) {
            return Ok(value.clone());
        }

        let mut total: i64 = 0;
        for term in expr.split('+') {
            let mut product: i64 = 1;
            for factor in term.split('*') {
                let factor = factor.trim();
                let n = if factor.is_empty() {
                    return Err("SyntaxError: invalid syntax".to_string());
                } else if let Ok(n) = factor.parse::<i64>() {
                    n
                } else {
                    match scope.get(factor) {
                        Some(value) => value
                            .as_i64()
                            .ok_or_else(|| format!("TypeError: {factor} is not a number"))?,
                        None => return Err(format!("NameError: name '{factor}' is not defined")),
                    }
                };
                product *= n;
            }
            total += product;
        }
        Ok(json!(total))
    }

    /// Run a block. A failed block's value is `NULL` when values are kept.
    async fn run(
        &mut self,
        shared: &Shared,
        killed: &mut watch::Receiver<bool>,
        namespace_id: u64,
        code: &str,
        keep_values: bool,
    ) -> Option<WorkerReply> {
        let mut reply = self
            .run_statements(shared, killed, namespace_id, code, keep_values)
            .await?;
        if keep_values && reply.value_handle.is_none() && self.namespaces.contains_key(&namespace_id) {
            self.next_handle += 1;
            self.values
                .insert(self.next_handle, (namespace_id, Value::Null));
            reply.value_handle = Some(self.next_handle);
        }
        Some(reply)
    }

    async fn run_statements(
        &mut self,
        shared: &Shared,
        killed: &mut watch::Receiver<bool>,
        namespace_id: u64,
        code: &str,
        keep_values: bool,
    ) -> Option<WorkerReply> {
        if !self.namespaces.contains_key(&namespace_id) {
            return Some(err(format!("no namespace {namespace_id}")));
        }

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut value: Option<Value> = None;
        let mut opaque = false;

        let statements = code
            .split(['\n', ';'])
            .map(str::trim)
            .filter(|s| !s.is_empty());
        for statement in statements {
            value = None;
            opaque = false;
            let (word, rest) = statement.split_once(' ').unwrap_or((statement, ""));
            match word {
                "print" => match self.eval(namespace_id, rest) {
                    Ok(v) => {
                        stdout.push_str(&v.to_string());
                        stdout.push('\n');
                    }
                    Err(e) => return Some(raised(e, stdout, stderr)),
                },
                "warn" => {
                    stderr.push_str(rest);
                    stderr.push('\n');
                }
                "fail" => return Some(raised(rest.to_string(), stdout, stderr)),
                "opaque" => opaque = true,
                "exit" => {
                    self.exited = true;
                    return None;
                }
                "sleep" => {
                    let ms = rest.trim().parse().unwrap_or(0);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                        _ = until_killed(killed) => return None,
                    }
                }
                "files" => {
                    let names: Vec<&String> = self
                        .mounted
                        .iter()
                        .flat_map(|(_, files)| files.keys())
                        .collect();
                    value = Some(json!(names));
                }
                "plot" => {
                    self.files.insert(
                        format!("Rplot{rest}.svg"),
                        format!("<svg><title>{rest}</title></svg>").into_bytes(),
                    );
                }
                "loop" => loop {
                    tokio::select! {
                        _ = shared.interrupt.notified() => {
                            if self.interrupts_enabled {
                                return Some(raised("KeyboardInterrupt".to_string(), stdout, stderr));
                            }
                        }
                        _ = until_killed(killed) => return None,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {
                            return Some(raised("loop was never interrupted".to_string(), stdout, stderr));
                        }
                    }
                },
                _ => match statement.split_once('=') {
                    Some((name, expr)) => match self.eval(namespace_id, expr) {
                        Ok(v) => {
                            if let Some(scope) = self.namespaces.get_mut(&namespace_id) {
                                scope.insert(name.trim().to_string(), v);
                            }
                        }
                        Err(e) => return Some(raised(e, stdout, stderr)),
                    },
                    None => match self.eval(namespace_id, statement) {
                        Ok(v) => value = Some(v),
                        Err(e) => return Some(raised(e, stdout, stderr)),
                    },
                },
            }
        }

        let mut reply = WorkerReply {
            stdout,
            stderr,
            ..Default::default()
        };
        if keep_values {
            self.next_handle += 1;
            self.values.insert(
                self.next_handle,
                (namespace_id, value.clone().unwrap_or(Value::Null)),
            );
            reply.value_handle = Some(self.next_handle);
        }
        if opaque {
            reply.error = Some("Can't convert from type opaque".to_string());
            reply.error_name = Some(CONVERSION_ERROR.to_string());
        } else {
            reply.result = value;
        }
        Some(reply)
    }
}

/// Serves resources from memory, counting fetches.
#[derive(Default)]
pub struct MapFetcher {
    files: HashMap<String, Vec<u8>>,
    fetches: AtomicUsize,
    delay_ms: u64,
}

impl MapFetcher {
    pub fn new(files: &[(&str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(name, data)| (name.to_string(), data.as_bytes().to_vec()))
                .collect(),
            fetches: AtomicUsize::new(0),
            delay_ms: 0,
        }
    }

    /// Every fetch takes `ms` milliseconds.
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceFetcher for MapFetcher {
    async fn fetch(&self, name: &str) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ResourceFetch {
                name: name.to_string(),
                message: "404 Not Found".to_string(),
            })
    }
}

pub fn python_runner(launcher: &FakeLauncher, fetcher: Arc<MapFetcher>) -> Arc<PyodideRunner> {
    Arc::new(PyodideRunner::new(
        Arc::new(launcher.clone()),
        fetcher,
        MOUNT,
        true,
    ))
}

pub fn r_runner(launcher: &FakeLauncher, fetcher: Arc<MapFetcher>) -> Arc<WebRRunner> {
    Arc::new(WebRRunner::new(Arc::new(launcher.clone()), fetcher, MOUNT))
}

pub fn as_dyn<R: LanguageRunner + 'static>(runner: &Arc<R>) -> Arc<dyn LanguageRunner> {
    Arc::clone(runner) as Arc<dyn LanguageRunner>
}

pub fn blocks(codes: &[&str]) -> Vec<String> {
    codes.iter().map(|c| c.to_string()).collect()
}

/// Results as `(success, result)` pairs, for compact assertions.
pub fn outcomes(results: &[RunResult]) -> Vec<(bool, Option<Value>)> {
    results
        .iter()
        .map(|r| (r.success, r.result.clone()))
        .collect()
}
