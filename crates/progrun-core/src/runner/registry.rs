//! Runners by backend name.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::RunnerConfig;
use crate::error::{Error, Result};
use crate::execute::run_code_blocks;
use crate::output::RunResult;

use super::{LanguageRunner, PreloadOptions, PyodideRunner, WebRRunner};

/// The runners available to a caller, keyed by backend name.
#[derive(Clone, Default)]
pub struct LanguageRunners {
    runners: BTreeMap<String, Arc<dyn LanguageRunner>>,
}

impl LanguageRunners {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// `pyodide` and `webr` runners hosting local interpreters.
    pub fn with_defaults(config: &RunnerConfig) -> Self {
        let mut runners = Self::new();
        runners.register(Arc::new(PyodideRunner::from_config(config)));
        runners.register(Arc::new(WebRRunner::from_config(config)));
        runners
    }

    /// Add a runner under its own name, replacing any runner of that name.
    pub fn register(&mut self, runner: Arc<dyn LanguageRunner>) {
        self.runners.insert(runner.name().to_string(), runner);
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn LanguageRunner>> {
        self.runners
            .get(name)
            .ok_or_else(|| Error::UnknownLanguage(name.to_string()))
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.runners.keys().map(String::as_str)
    }

    /// Preload a backend. A bare package list is accepted as the options.
    pub async fn preload(&self, language: &str, options: impl Into<PreloadOptions>) -> Result<()> {
        self.get(language)?.preload(options.into()).await
    }

    /// Run blocks in one session of a backend.
    ///
    /// Always yields one result per block. If the backend isn't available
    /// every block fails with the same error.
    pub async fn run_code(
        &self,
        language: &str,
        codes: &[String],
        context_id: Option<&str>,
    ) -> Vec<RunResult> {
        match self.get(language) {
            Ok(runner) => run_code_blocks(runner, codes, context_id).await,
            Err(e) => {
                tracing::warn!("Can't run code: {}", e);
                codes.iter().map(|_| RunResult::failure(e.to_string())).collect()
            }
        }
    }
}

impl std::fmt::Debug for LanguageRunners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.runners.keys()).finish()
    }
}
