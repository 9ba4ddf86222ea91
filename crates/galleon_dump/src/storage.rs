//! External blob store seam.
//!
//! The orchestrator only needs "create a named artifact and write bytes".
//! Artifact naming is the writer's concern.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Write-only view of the external store.
#[async_trait]
pub trait ExternalStorage: Send + Sync {
    async fn write_artifact(&self, name: &str, data: &[u8]) -> Result<()>;
}

/// Local-directory backend, also used by tests.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub async fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("create output directory {}", root.display()))?;
        Ok(Self { root })
    }
}

#[async_trait]
impl ExternalStorage for LocalStorage {
    async fn write_artifact(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.root.join(name);
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("write artifact {}", path.display()))
    }
}
