//! IPC protocol messages for progrun worker processes.
//!
//! Uses newline-delimited JSON over stdin/stdout: one command per line from
//! the runner, one reply per line from the worker. Replies carry the job id
//! of the command they answer and may arrive in any order.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::execute::{JobId, NamespaceId};

/// Largest message accepted in either direction (100MB).
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// `error_name` a worker uses when code ran but its value can't cross the boundary.
pub const CONVERSION_ERROR: &str = "ConversionError";

/// Opaque reference to a value kept alive inside the worker.
pub type ValueHandle = u64;

/// Command sent from the runner to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum WorkerCommand {
    /// Readiness handshake. The reply describes the interpreter.
    Init,

    /// Make packages importable.
    Preload {
        /// Package names to install or import.
        packages: Vec<String>,
    },

    /// Turn interrupt signals into catchable interruptions of running code.
    EnableInterrupt,

    /// Run Python code in a namespace.
    RunPython {
        namespace_id: NamespaceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_id: Option<String>,
        code: String,
    },

    /// Run R code in a namespace with autoprint.
    #[serde(rename = "runR")]
    RunR {
        namespace_id: NamespaceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_id: Option<String>,
        code: String,
    },

    /// Allocate a fresh, empty variable scope.
    CreateNamespace { namespace_id: NamespaceId },

    /// Discard a variable scope.
    DropNamespace { namespace_id: NamespaceId },

    /// Bind a kept value to a name in a namespace.
    BindValue {
        namespace_id: NamespaceId,
        name: String,
        handle: ValueHandle,
    },

    /// Release every value kept on behalf of a namespace.
    Purge { namespace_id: NamespaceId },

    /// Make files visible under a directory.
    Mount { path: String, files: Vec<MountedFile> },

    /// Remove whatever is mounted at a directory.
    Unmount { path: String },

    /// Write a file into the worker's filesystem.
    WriteFile {
        path: String,
        /// Base64 encoded contents.
        data: String,
    },

    /// Read a file from the worker's filesystem. Replies with `{"data": base64}`.
    ReadFile { path: String },

    /// List a directory. Replies with `[{"name", "is_dir"}]`.
    ListFiles { path: String },

    /// Delete a file from the worker's filesystem.
    RemoveFile { path: String },

    /// Exit after replying.
    Shutdown,
}

/// A command together with the job id its reply must carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    pub job_id: JobId,
    #[serde(flatten)]
    pub command: WorkerCommand,
}

/// One file in a mount request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountedFile {
    pub name: String,
    /// Base64 encoded contents.
    pub data: String,
}

impl MountedFile {
    /// Encode raw file contents for the wire.
    pub fn encode(name: &str, data: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            data: BASE64.encode(data),
        }
    }
}

/// Reply sent from a worker to the runner.
///
/// Presence of `error` signals failure; absence signals success, possibly
/// without a `result`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerReply {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Handle to the run's value, for workers that keep values alive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_handle: Option<ValueHandle>,
}

impl WorkerReply {
    /// Whether the worker reported a failure.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Whether the code ran but its value could not be converted.
    pub fn is_conversion_error(&self) -> bool {
        self.error_name.as_deref() == Some(CONVERSION_ERROR)
    }

    /// Decode a `{"data": base64}` result.
    pub fn file_data(&self) -> Result<Vec<u8>> {
        let encoded = self
            .result
            .as_ref()
            .and_then(|r| r.get("data"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Protocol(format!("job {} reply has no file data", self.job_id))
            })?;
        BASE64
            .decode(encoded)
            .map_err(|e| Error::Protocol(format!("invalid file data in job {}: {}", self.job_id, e)))
    }
}

/// Directory entry returned by `listFiles`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(default)]
    pub is_dir: bool,
}

/// Write one message as a line of JSON and flush.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;

    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(Error::Ipc(format!(
            "IPC message too large: {} bytes",
            bytes.len()
        )));
    }
    bytes.push(b'\n');

    writer
        .write_all(&bytes)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read the next message, skipping blank lines.
///
/// Returns `Ok(None)` at end of stream. A line that is not valid JSON for `T`
/// is a [`Error::Serialization`]; the stream stays usable afterwards.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    loop {
        let mut line = String::new();
        let read = (&mut *reader)
            .take(MAX_MESSAGE_SIZE as u64 + 1)
            .read_line(&mut line)
            .await
            .map_err(|e| Error::Ipc(format!("Failed to read IPC message: {}", e)))?;

        if read == 0 {
            return Ok(None);
        }
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(Error::Ipc(format!(
                "IPC message too large: more than {} bytes",
                MAX_MESSAGE_SIZE
            )));
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        return serde_json::from_str(trimmed)
            .map(Some)
            .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)));
    }
}
