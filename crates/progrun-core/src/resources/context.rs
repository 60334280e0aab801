//! Question contexts and the single mount point their files are shown at.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use rustc_hash::FxHashMap;
use tokio::sync::OnceCell;

use crate::error::{Error, Result};
use crate::ipc::{MountedFile, WorkerCommand};
use crate::runner::WorkerConnection;

use super::fetch::ResourceFetcher;

/// Id of the context whose files are visible everywhere.
pub const DEFAULT_CONTEXT: &str = "";

/// One fetched resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFile {
    pub name: String,
    pub data: Arc<[u8]>,
}

#[derive(Debug, Default)]
struct Context {
    files: Vec<ContextFile>,
    /// Bumped whenever `files` changes.
    revision: u64,
    /// One entry per name ever requested; set once its file is in `files`.
    fetches: FxHashMap<String, Arc<OnceCell<()>>>,
}

/// What is currently mounted, precise enough to tell when a remount is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MountStamp {
    context_id: String,
    default_revision: u64,
    context_revision: u64,
}

#[derive(Debug)]
struct MountPoint {
    path: String,
    mounted: bool,
    active: Option<MountStamp>,
}

/// File lists per context and the state of the worker's mount point.
///
/// Activation only happens from the execution queue, so the mount point
/// never sees two activations at once.
#[derive(Debug)]
pub struct ContextStore {
    contexts: Mutex<FxHashMap<String, Context>>,
    mount: tokio::sync::Mutex<MountPoint>,
}

impl ContextStore {
    pub fn new(mount_path: impl Into<String>) -> Self {
        Self {
            contexts: Mutex::new(FxHashMap::default()),
            mount: tokio::sync::Mutex::new(MountPoint {
                path: mount_path.into(),
                mounted: false,
                active: None,
            }),
        }
    }

    fn contexts(&self) -> MutexGuard<'_, FxHashMap<String, Context>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch resources and append them to a context's file list.
    ///
    /// Each name is fetched at most once per context; a caller asking for a
    /// name whose fetch is already in flight waits for that fetch. Fetches
    /// run concurrently and a failure doesn't affect the others. The first
    /// failure is returned once all have finished, and that name may be
    /// registered again later.
    pub async fn register_files(
        &self,
        fetcher: &dyn ResourceFetcher,
        context_id: &str,
        names: &[String],
    ) -> Result<()> {
        let fetches: Vec<(&String, Arc<OnceCell<()>>)> = {
            let mut contexts = self.contexts();
            let context = contexts.entry(context_id.to_string()).or_default();
            names
                .iter()
                .map(|name| (name, Arc::clone(context.fetches.entry(name.clone()).or_default())))
                .collect()
        };

        let outcomes = join_all(fetches.iter().map(|(name, fetched)| async move {
            fetched
                .get_or_try_init(|| async {
                    let data = fetcher.fetch(name).await?;
                    self.append(context_id, name, data);
                    Ok::<_, Error>(())
                })
                .await
                .map(|_| ())
        }))
        .await;

        let mut first_error = None;
        for ((name, _), outcome) in fetches.iter().zip(outcomes) {
            if let Err(e) = outcome {
                tracing::warn!("Failed to fetch {} for context {:?}: {}", name, context_id, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn append(&self, context_id: &str, name: &str, data: Vec<u8>) {
        let mut contexts = self.contexts();
        let context = contexts.entry(context_id.to_string()).or_default();
        context.files.push(ContextFile {
            name: name.to_string(),
            data: data.into(),
        });
        context.revision += 1;
    }

    /// Names of the files registered for a context, in the order their
    /// fetches completed.
    pub fn file_names(&self, context_id: &str) -> Vec<String> {
        self.contexts()
            .get(context_id)
            .map(|context| context.files.iter().map(|f| f.name.clone()).collect())
            .unwrap_or_default()
    }

    /// The default context's files followed by the named context's.
    fn visible_files(&self, context_id: &str) -> (MountStamp, Vec<ContextFile>) {
        let contexts = self.contexts();
        let default = contexts.get(DEFAULT_CONTEXT);
        let named = if context_id == DEFAULT_CONTEXT {
            None
        } else {
            contexts.get(context_id)
        };

        let stamp = MountStamp {
            context_id: context_id.to_string(),
            default_revision: default.map_or(0, |c| c.revision),
            context_revision: named.map_or(0, |c| c.revision),
        };
        let files = default
            .into_iter()
            .chain(named)
            .flat_map(|c| c.files.iter().cloned())
            .collect();

        (stamp, files)
    }

    /// Make the files of `context_id` (plus the default context) the ones
    /// visible at the mount point.
    pub async fn activate(&self, context_id: Option<&str>, conn: &WorkerConnection) -> Result<()> {
        let context_id = context_id.unwrap_or(DEFAULT_CONTEXT);
        let (stamp, files) = self.visible_files(context_id);

        let mut mount = self.mount.lock().await;
        if mount.active.as_ref() == Some(&stamp) {
            return Ok(());
        }

        if mount.mounted {
            conn.request(WorkerCommand::Unmount {
                path: mount.path.clone(),
            })
            .await?;
            mount.mounted = false;
            mount.active = None;
        }

        let files = files
            .iter()
            .map(|f| MountedFile::encode(&f.name, &f.data))
            .collect::<Vec<_>>();
        tracing::debug!(
            "Mounting {} files for context {:?} at {}",
            files.len(),
            context_id,
            mount.path
        );
        conn.request(WorkerCommand::Mount {
            path: mount.path.clone(),
            files,
        })
        .await?;
        mount.mounted = true;
        mount.active = Some(stamp);

        Ok(())
    }

    /// Context whose files are currently mounted.
    pub async fn active_context(&self) -> Option<String> {
        self.mount
            .lock()
            .await
            .active
            .as_ref()
            .map(|stamp| stamp.context_id.clone())
    }
}
