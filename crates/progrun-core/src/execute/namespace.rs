//! Namespace manager: isolated variable scopes inside a worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use rustc_hash::FxHashSet;

use crate::error::Result;
use crate::ipc::WorkerCommand;
use crate::runner::WorkerConnection;

/// Identifier of a variable scope inside a worker.
pub type NamespaceId = u64;

/// A namespace known to exist in the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Namespace {
    pub id: NamespaceId,
    /// Whether this call allocated the scope.
    pub created: bool,
}

/// Allocates namespace ids and creates their scopes on first use.
///
/// Scopes are cached for the lifetime of the runner unless released.
#[derive(Debug)]
pub struct NamespaceManager {
    next_id: AtomicU64,
    created: Mutex<FxHashSet<NamespaceId>>,
}

impl Default for NamespaceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            created: Mutex::new(FxHashSet::default()),
        }
    }

    /// Reserve an id for a new session. No worker state is touched.
    pub fn allocate(&self) -> NamespaceId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether the scope for `id` has been created in the worker.
    pub fn exists(&self, id: NamespaceId) -> bool {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    /// Get the scope for `id`, creating it in the worker the first time.
    ///
    /// Callers run this from the execution queue, so two calls for the same
    /// id never race.
    pub async fn namespace_for(
        &self,
        id: NamespaceId,
        conn: &WorkerConnection,
    ) -> Result<Namespace> {
        if self.exists(id) {
            return Ok(Namespace { id, created: false });
        }

        conn.request(WorkerCommand::CreateNamespace { namespace_id: id })
            .await?;
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        tracing::debug!("Created namespace {}", id);

        Ok(Namespace { id, created: true })
    }

    /// Discard the scope for `id` if it was ever created.
    pub async fn release(&self, id: NamespaceId, conn: &WorkerConnection) -> Result<()> {
        let removed = self
            .created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed {
            conn.request(WorkerCommand::DropNamespace { namespace_id: id })
                .await?;
            tracing::debug!("Dropped namespace {}", id);
        }
        Ok(())
    }
}
