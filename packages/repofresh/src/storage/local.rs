use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Local directory tree addressed with bucket-style keys rooted at `/`.
pub(super) struct LocalBackend;

impl LocalBackend {
    pub(super) fn new() -> Self {
        LocalBackend
    }

    fn resolve(&self, key: &str) -> PathBuf {
        Path::new("/").join(key)
    }

    pub(super) async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let path = self.resolve(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, body).await?;
        Ok(())
    }

    pub(super) async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        match tokio::fs::read(self.resolve(key)).await {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::PackageNotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub(super) async fn put_file(&self, key: &str, source: &Path) -> Result<()> {
        let path = self.resolve(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(source, path).await?;
        Ok(())
    }

    pub(super) async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.resolve(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub(super) async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(key)).await?)
    }
}
