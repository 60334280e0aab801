//! Runner configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable overriding the Python interpreter.
pub const PYTHON_ENV: &str = "PROGRUN_PYTHON";

/// Environment variable overriding the Rscript program.
pub const RSCRIPT_ENV: &str = "PROGRUN_RSCRIPT";

/// Environment variable overriding the question resources directory.
pub const RESOURCES_ENV: &str = "PROGRUN_RESOURCES";

/// Settings shared by the built-in runners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Python interpreter, a path or a name looked up on `PATH`.
    pub python: PathBuf,
    /// Rscript program, a path or a name looked up on `PATH`.
    pub rscript: PathBuf,
    /// Directory question resources are fetched from.
    pub resources_dir: PathBuf,
    /// Mount point for context files, relative to the worker home.
    pub mount_path: String,
    /// Enable interrupts for Python workers.
    pub interrupt: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            python: PathBuf::from("python3"),
            rscript: PathBuf::from("Rscript"),
            resources_dir: PathBuf::from("resources/question-resources"),
            mount_path: "resources".to_string(),
            interrupt: cfg!(unix),
        }
    }
}

impl RunnerConfig {
    /// Defaults overlaid with `PROGRUN_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(python) = std::env::var_os(PYTHON_ENV) {
            config.python = PathBuf::from(python);
        }
        if let Some(rscript) = std::env::var_os(RSCRIPT_ENV) {
            config.rscript = PathBuf::from(rscript);
        }
        if let Some(resources) = std::env::var_os(RESOURCES_ENV) {
            config.resources_dir = PathBuf::from(resources);
        }
        config
    }

    /// Parse a JSON config file; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Locate an interpreter program.
    ///
    /// An existing path is used as-is; anything else is searched for on `PATH`.
    pub fn resolve_program(program: &Path) -> Result<PathBuf> {
        if program.components().count() > 1 && program.exists() {
            return Ok(program.to_path_buf());
        }

        if let Ok(path) = which::which(program) {
            return Ok(path);
        }

        Err(Error::Config(format!(
            "Could not find {}. Set {} or {} to its location, or ensure it's in PATH.",
            program.display(),
            PYTHON_ENV,
            RSCRIPT_ENV
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.python, PathBuf::from("python3"));
        assert_eq!(config.rscript, PathBuf::from("Rscript"));
        assert_eq!(config.mount_path, "resources");
        assert_eq!(
            config.resources_dir,
            PathBuf::from("resources/question-resources")
        );
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = RunnerConfig::from_json(r#"{"python": "/opt/py/bin/python3"}"#).unwrap();
        assert_eq!(config.python, PathBuf::from("/opt/py/bin/python3"));
        assert_eq!(config.rscript, PathBuf::from("Rscript"));
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let result = RunnerConfig::from_json("{python: 3}");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_resolve_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("python3");
        std::fs::write(&program, "").unwrap();

        let resolved = RunnerConfig::resolve_program(&program).unwrap();
        assert_eq!(resolved, program);
    }

    #[test]
    fn test_resolve_missing_program() {
        let err = RunnerConfig::resolve_program(Path::new("progrun-missing-program")).unwrap_err();
        assert!(err.to_string().contains("progrun-missing-program"));
    }
}
