mod local;
mod s3;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::instrument;
use url::Url;

use crate::error::{Error, Result};

/// Storage driver bound to one repository URL.
///
/// Owns exactly one scratch directory; the scratch is removed when the
/// value is dropped. Paths handed to the operations are relative to the
/// bucket prefix unless `absolute` is set, in which case they are
/// relative to the bucket root (the form object-store event keys use).
pub struct Storage {
    backend: Backend,
    prefix: String,
    scratch: TempDir,
}

enum Backend {
    S3(s3::S3Backend),
    Local(local::LocalBackend),
}

/// Open the storage backend matching the URL scheme.
///
/// `s3://bucket/prefix` talks to the object store (honouring
/// `S3_ENDPOINT_URL`); `file:///path` works against a local directory
/// tree, which is what the tests and disk-served repositories use.
pub async fn get_storage(url: &str) -> Result<Storage> {
    let parsed =
        Url::parse(url).map_err(|err| Error::config(format!("invalid storage url {url}: {err}")))?;
    let scratch = TempDir::new()?;
    match parsed.scheme() {
        "s3" => {
            let bucket = parsed
                .host_str()
                .ok_or_else(|| Error::config(format!("missing bucket in storage url: {url}")))?
                .to_string();
            let prefix = parsed.path().trim_matches('/').to_string();
            Ok(Storage {
                backend: Backend::S3(s3::S3Backend::connect(bucket).await),
                prefix,
                scratch,
            })
        }
        "file" => {
            let prefix = parsed.path().trim_matches('/').to_string();
            Ok(Storage {
                backend: Backend::Local(local::LocalBackend::new()),
                prefix,
                scratch,
            })
        }
        scheme => Err(Error::config(format!("unsupported storage scheme: {scheme}"))),
    }
}

impl Storage {
    /// Scratch directory for this transaction.
    pub fn path(&self) -> &Path {
        self.scratch.path()
    }

    /// Bucket key for `path`: prefixed unless `absolute`.
    pub fn key(&self, path: &str, absolute: bool) -> String {
        if absolute || self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    /// Prefix-joined bucket key.
    pub fn join(&self, path: &str) -> String {
        self.key(path, false)
    }

    /// Scratch-local path for `path`.
    pub fn tmp_join(&self, path: &str) -> PathBuf {
        self.scratch.path().join(path)
    }

    pub async fn put_object(&self, path: &str, body: Vec<u8>, absolute: bool) -> Result<()> {
        let key = self.key(path, absolute);
        match &self.backend {
            Backend::S3(backend) => backend.put_object(&key, body).await,
            Backend::Local(backend) => backend.put_object(&key, body).await,
        }
    }

    pub async fn get_object(&self, path: &str, absolute: bool) -> Result<Vec<u8>> {
        let key = self.key(path, absolute);
        match &self.backend {
            Backend::S3(backend) => backend.get_object(&key).await,
            Backend::Local(backend) => backend.get_object(&key).await,
        }
    }

    /// Download a bucket object into the scratch directory at `dst`
    /// (defaulting to the source path).
    pub async fn get_file(&self, path: &str, dst: Option<&str>, absolute: bool) -> Result<()> {
        let data = self.get_object(path, absolute).await?;
        let target = self.tmp_join(dst.unwrap_or(path));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, data).await?;
        Ok(())
    }

    /// Upload a scratch file to the same relative bucket key.
    pub async fn put_file(&self, path: &str) -> Result<()> {
        let key = self.key(path, false);
        let source = self.tmp_join(path);
        match &self.backend {
            Backend::S3(backend) => backend.put_file(&key, &source).await,
            Backend::Local(backend) => backend.put_file(&key, &source).await,
        }
    }

    /// Remove an object. Succeeds when the key is already absent.
    pub async fn remove(&self, path: &str, absolute: bool) -> Result<()> {
        let key = self.key(path, absolute);
        match &self.backend {
            Backend::S3(backend) => backend.remove(&key).await,
            Backend::Local(backend) => backend.remove(&key).await,
        }
    }

    pub async fn exists(&self, path: &str, absolute: bool) -> Result<bool> {
        let key = self.key(path, absolute);
        match &self.backend {
            Backend::S3(backend) => backend.exists(&key).await,
            Backend::Local(backend) => backend.exists(&key).await,
        }
    }

    /// Ensure a scratch file is gone.
    pub async fn remove_tmp(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(self.tmp_join(path)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Invalidate CDN caches for the given prefix-relative paths.
    ///
    /// Best effort: a no-op when no CDN is configured.
    #[instrument(skip(self, paths))]
    pub async fn invalidate_cache(&self, paths: &BTreeSet<String>) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = paths.iter().map(|path| self.key(path, false)).collect();
        match &self.backend {
            Backend::S3(backend) => backend.invalidate_cache(keys).await,
            Backend::Local(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_of(path: &Path) -> String {
        path.to_string_lossy().trim_start_matches('/').to_string()
    }

    #[tokio::test]
    async fn local_storage_round_trip() {
        let root = TempDir::new().unwrap();
        let url = format!("file://{}/repo", root.path().display());
        let storage = get_storage(&url).await.unwrap();

        // Objects.
        storage
            .put_object("object", b"object body".to_vec(), false)
            .await
            .unwrap();
        assert_eq!(
            storage.get_object("object", false).await.unwrap(),
            b"object body"
        );

        // Files through the scratch directory.
        let tmp = storage.tmp_join("file");
        assert!(tmp.starts_with(storage.path()));
        std::fs::write(&tmp, b"file body").unwrap();
        storage.put_file("file").await.unwrap();
        storage.remove_tmp("file").await.unwrap();
        assert!(!tmp.exists());
        storage.remove_tmp("file").await.unwrap();
        storage.get_file("file", None, false).await.unwrap();
        assert_eq!(std::fs::read(&tmp).unwrap(), b"file body");

        // Removal is idempotent.
        assert!(storage.exists("object", false).await.unwrap());
        storage.remove("object", false).await.unwrap();
        assert!(!storage.exists("object", false).await.unwrap());
        match storage.get_object("object", false).await {
            Err(Error::PackageNotFound(key)) => assert!(key.contains("object")),
            other => panic!("unexpected result: {other:?}"),
        }
        storage.remove("object", false).await.unwrap();

        // Key joining.
        let expected_prefix = key_of(&root.path().join("repo"));
        assert_eq!(storage.join("key"), format!("{expected_prefix}/key"));
        assert_eq!(storage.key("key", true), "key");
    }

    #[tokio::test]
    async fn unknown_scheme_is_a_configuration_error() {
        assert!(matches!(
            get_storage("notexists://path").await,
            Err(Error::Config(_))
        ));
    }
}
