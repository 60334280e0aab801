//! Sessions: one namespace, an optional context and sequential blocks.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;
use crate::ipc::ValueHandle;
use crate::output::RunResult;
use crate::runner::LanguageRunner;

use super::jobs::Settled;
use super::namespace::NamespaceId;

/// What a runner needs to know about a session to run code in it.
#[derive(Debug, Clone)]
pub struct SessionRef {
    pub namespace_id: NamespaceId,
    pub context_id: Option<String>,
    last_value: Arc<Mutex<Option<ValueHandle>>>,
}

impl SessionRef {
    pub fn new(namespace_id: NamespaceId, context_id: Option<String>) -> Self {
        Self {
            namespace_id,
            context_id,
            last_value: Arc::new(Mutex::new(None)),
        }
    }

    /// Handle to the value of the previous block, for backends that keep values.
    pub fn last_value(&self) -> Option<ValueHandle> {
        *self.last_value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_last_value(&self, handle: Option<ValueHandle>) {
        *self.last_value.lock().unwrap_or_else(PoisonError::into_inner) = handle;
    }
}

/// A unit of work against one runner.
///
/// Blocks run in the same namespace and see each other's bindings. Disposing
/// the session releases what the worker holds for it; dropping it without
/// disposing schedules the same release.
pub struct Session {
    runner: Arc<dyn LanguageRunner>,
    handle: SessionRef,
    disposed: bool,
}

impl Session {
    pub fn new(
        runner: Arc<dyn LanguageRunner>,
        namespace_id: NamespaceId,
        context_id: Option<String>,
    ) -> Self {
        Self {
            runner,
            handle: SessionRef::new(namespace_id, context_id),
            disposed: false,
        }
    }

    pub fn namespace_id(&self) -> NamespaceId {
        self.handle.namespace_id
    }

    pub fn context_id(&self) -> Option<&str> {
        self.handle.context_id.as_deref()
    }

    pub fn handle(&self) -> &SessionRef {
        &self.handle
    }

    pub fn runner(&self) -> &Arc<dyn LanguageRunner> {
        &self.runner
    }

    /// Run one block and normalize its outcome.
    ///
    /// The block is queued before this returns, so calls made in sequence
    /// run in that sequence even if their futures are awaited out of order.
    /// Blank code never reaches the worker. Failures of the code itself are
    /// reported in the result; `Err` means the run could not happen.
    pub fn run_code(&self, code: &str) -> impl Future<Output = Result<RunResult>> + Send + use<> {
        let job = if code.trim().is_empty() {
            None
        } else {
            Some(self.runner.run_code(code, &self.handle))
        };

        async move {
            let Some(job) = job else {
                return Ok(RunResult::blank());
            };

            match job.outcome().await {
                Settled::Resolved(output) => Ok(RunResult::settled(true, output)),
                Settled::Rejected(output) => Ok(RunResult::settled(false, output)),
                Settled::Failed(err) => Err(err),
            }
        }
    }

    /// Release the session's worker-side resources.
    pub async fn dispose(mut self) -> Result<()> {
        self.disposed = true;
        self.runner.release_session(&self.handle).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let release = self.runner.release_session(&self.handle);
        let namespace_id = self.handle.namespace_id;
        runtime.spawn(async move {
            if let Err(e) = release.await {
                tracing::debug!("Failed to release namespace {}: {}", namespace_id, e);
            }
        });
    }
}

/// Run blocks in order in one fresh session, one result per block.
///
/// Never fails as a whole: a block that can't run gets a failure result.
pub async fn run_code_blocks(
    runner: &Arc<dyn LanguageRunner>,
    codes: &[String],
    context_id: Option<&str>,
) -> Vec<RunResult> {
    let session = Arc::clone(runner).new_session(context_id.map(str::to_string));

    let mut results = Vec::with_capacity(codes.len());
    for code in codes {
        let result = session
            .run_code(code)
            .await
            .unwrap_or_else(|e| RunResult::failure(e.to_string()));
        results.push(result);
    }

    if let Err(e) = session.dispose().await {
        tracing::warn!("Failed to dispose {} session: {}", runner.name(), e);
    }
    results
}
