use crate::domain::ports::ReaderIdentityStore;
use crate::domain::reader::ReaderIdentity;
use crate::error::Result;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};

/// Persists the last connected reader as a small JSON document.
///
/// The file is rewritten on every `remember`; a missing file recalls as
/// `None`. Writes go to a sibling temp file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct JsonFileReaderStore {
    path: PathBuf,
}

impl JsonFileReaderStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn staging_path(&self) -> PathBuf {
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        PathBuf::from(staging)
    }
}

#[async_trait]
impl ReaderIdentityStore for JsonFileReaderStore {
    async fn remember(&self, reader: &ReaderIdentity) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(reader)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.staging_path();
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }

    async fn recall(&self) -> Result<Option<ReaderIdentity>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}
