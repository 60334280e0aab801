//! Fetching question resources by name.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Source of question resource files.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Fetch the contents of the resource called `name`.
    async fn fetch(&self, name: &str) -> Result<Vec<u8>>;
}

/// Serves resources from a directory on disk.
#[derive(Debug, Clone)]
pub struct DirectoryFetcher {
    root: PathBuf,
}

impl DirectoryFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if name.is_empty() || escapes {
            return Err(Error::ResourceFetch {
                name: name.to_string(),
                message: "resource names must be relative paths inside the resources directory"
                    .to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ResourceFetcher for DirectoryFetcher {
    async fn fetch(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name)?;
        tracing::debug!("Fetching resource {}", path.display());

        tokio::fs::read(&path)
            .await
            .map_err(|e| Error::ResourceFetch {
                name: name.to_string(),
                message: e.to_string(),
            })
    }
}
