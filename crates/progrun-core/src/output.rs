//! Results of running code.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ipc::WorkerReply;

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("valid ANSI escape pattern")
});

/// Remove terminal colour and cursor control sequences.
pub fn remove_ansi_escapes(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Everything a backend reports about one run, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutput {
    pub result: Option<Value>,
    pub stdout: String,
    pub stderr: String,
    /// Inline SVG documents produced by the run.
    pub images: Vec<String>,
    pub error: Option<String>,
    /// Set when the code ran but its value couldn't be converted.
    pub conversion_error: Option<String>,
}

impl RunOutput {
    pub fn from_reply(reply: WorkerReply) -> Self {
        if reply.is_conversion_error() {
            return Self {
                result: Some(Value::Null),
                stdout: reply.stdout,
                stderr: reply.stderr,
                images: Vec::new(),
                error: None,
                conversion_error: reply.error,
            };
        }

        Self {
            result: reply.result,
            stdout: reply.stdout,
            stderr: reply.stderr,
            images: Vec::new(),
            error: reply.error,
            conversion_error: None,
        }
    }

    /// Output of a job interrupted before it started.
    pub fn interrupted() -> Self {
        Self {
            stderr: "KeyboardInterrupt\n".to_string(),
            error: Some("KeyboardInterrupt".to_string()),
            ..Default::default()
        }
    }
}

/// Normalized outcome of one code block, as handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Absent when the code produced no value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub success: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion_error: Option<String>,
}

impl RunResult {
    /// The canned result for a block with nothing to run.
    pub fn blank() -> Self {
        Self {
            result: None,
            success: true,
            stdout: String::new(),
            stderr: String::new(),
            images: Vec::new(),
            error: None,
            conversion_error: None,
        }
    }

    /// Normalize a settled run. Any output on stderr marks the run failed.
    pub fn settled(resolved: bool, output: RunOutput) -> Self {
        let stderr = remove_ansi_escapes(&output.stderr);
        let success = resolved && stderr.trim().is_empty();

        Self {
            result: output.result,
            success,
            stdout: output.stdout,
            stderr,
            images: output.images,
            error: output.error,
            conversion_error: output.conversion_error,
        }
    }

    /// A run that could not be carried out at all.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Self::blank()
        }
    }
}

/// A file read back from a worker's filesystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedFile {
    pub name: String,
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64 encoded contents of binary files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LoadedFile {
    pub fn missing(name: &str, error: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            exists: false,
            text: None,
            data: None,
            mime_type: None,
            error: Some(error.into()),
        }
    }
}

/// MIME type for a file name, and whether its contents are binary.
pub fn mime_type_for(name: &str) -> (&'static str, bool) {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "svg" => ("image/svg+xml", false),
        "pdf" => ("application/pdf", true),
        _ => ("text/plain", false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remove_ansi_escapes() {
        let coloured = "\x1b[31mError\x1b[0m: bad \x1b[1;32mthing\x1b[m";
        assert_eq!(remove_ansi_escapes(coloured), "Error: bad thing");
        assert_eq!(remove_ansi_escapes("plain"), "plain");
    }

    #[test]
    fn test_blank_serializes_without_result() {
        let value = serde_json::to_value(RunResult::blank()).unwrap();
        assert_eq!(
            value,
            json!({"success": true, "stdout": "", "stderr": ""})
        );
    }

    #[test]
    fn test_stderr_implies_failure() {
        let output = RunOutput {
            result: Some(json!(3)),
            stderr: "Warning message:\nsomething odd\n".to_string(),
            ..Default::default()
        };
        let result = RunResult::settled(true, output);
        assert!(!result.success);
        assert_eq!(result.result, Some(json!(3)));
    }

    #[test]
    fn test_whitespace_stderr_is_not_failure() {
        let output = RunOutput {
            stderr: "\n  ".to_string(),
            ..Default::default()
        };
        assert!(RunResult::settled(true, output).success);
    }

    #[test]
    fn test_stderr_is_stripped() {
        let output = RunOutput {
            stderr: "\x1b[31mboom\x1b[0m".to_string(),
            error: Some("boom".to_string()),
            ..Default::default()
        };
        let result = RunResult::settled(false, output);
        assert_eq!(result.stderr, "boom");
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_conversion_error_reply() {
        let reply = WorkerReply {
            job_id: 1,
            error: Some("Can't convert from type environment".to_string()),
            error_name: Some("ConversionError".to_string()),
            stdout: "printed\n".to_string(),
            ..Default::default()
        };
        let output = RunOutput::from_reply(reply);
        assert_eq!(output.result, Some(Value::Null));
        assert!(output.error.is_none());
        assert_eq!(output.stdout, "printed\n");

        let result = RunResult::settled(true, output);
        assert!(result.success);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value.get("result"), Some(&Value::Null));
    }

    #[test]
    fn test_mime_types() {
        assert_eq!(mime_type_for("plot.svg"), ("image/svg+xml", false));
        assert_eq!(mime_type_for("report.PDF"), ("application/pdf", true));
        assert_eq!(mime_type_for("data.csv"), ("text/plain", false));
        assert_eq!(mime_type_for("README"), ("text/plain", false));
    }
}
