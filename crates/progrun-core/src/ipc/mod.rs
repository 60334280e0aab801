//! Inter-process communication for progrun worker processes.
//!
//! This module provides the wire protocol and the launchers that connect a
//! runner to the isolated worker hosting its interpreter.

pub mod protocol;
mod worker;

pub use protocol::{
    CONVERSION_ERROR, FileEntry, MountedFile, ValueHandle, WorkerCommand, WorkerMessage,
    WorkerReply, read_message, write_message,
};
pub use worker::{InterruptSignal, ProcessInterrupt, ProcessLauncher, WorkerLauncher, WorkerLink};
