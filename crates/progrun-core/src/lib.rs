//! Core of progrun: running Python and R snippets for quiz questions.
//!
//! This crate provides:
//! - A job registry tracking in-flight work by id
//! - A per-runner execution queue that serializes interpreter access
//! - Namespaces isolating the variables of independent sessions
//! - Question contexts whose resource files are mounted before code runs
//! - `pyodide` (Python) and `webr` (R) runners over worker processes

pub mod config;
pub mod error;
pub mod execute;
pub mod ipc;
pub mod language;
pub mod output;
pub mod resources;
pub mod runner;

pub use config::RunnerConfig;
pub use error::{Error, Result};
pub use execute::{
    ExecutionQueue, Job, JobId, JobRegistry, JobState, NamespaceId, NamespaceManager, Session,
    SessionRef, Settled, run_code_blocks,
};
pub use ipc::{ProcessLauncher, WorkerLauncher, WorkerLink};
pub use language::{EditorLanguage, LANGUAGE_SYNONYMS, language_synonym};
pub use output::{LoadedFile, RunOutput, RunResult, remove_ansi_escapes};
pub use resources::{ContextStore, DEFAULT_CONTEXT, DirectoryFetcher, ResourceFetcher};
pub use runner::{
    LanguageRunner, LanguageRunners, PreloadOptions, PyodideRunner, RunnerCore, WebRRunner,
    WorkerConnection,
};
