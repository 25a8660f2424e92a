pub mod deb;
pub mod rpm;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use lazy_regex::lazy_regex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::gpg::{GpgConfig, GpgSession};
use crate::storage::Storage;

/// Extra template variables supplied by the caller.
pub type Variables = BTreeMap<String, String>;

/// Injected engine configuration, read once at process start.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub rpm: rpm::RpmConfig,
    pub deb: deb::DebConfig,
    pub gpg: GpgConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            rpm: rpm::RpmConfig::from_env()?,
            deb: deb::DebConfig::from_env(),
            gpg: GpgConfig::from_env(),
        })
    }
}

/// Per-transaction signing options; unset fields fall back to the
/// process-wide configuration and the format's defaults.
#[derive(Clone, Debug, Default)]
pub struct RepositoryOptions {
    pub gpg_private_key: Option<PathBuf>,
    pub gpg_password: Option<String>,
    pub gpg_verify: Option<bool>,
    pub gpg_clear: bool,
}

/// Path sets flushed by a completed transaction, for callers that need
/// to inspect what was published and retired.
#[derive(Clone, Debug)]
pub struct TransactionSummary {
    pub url: String,
    pub modified: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    Rpm,
    Deb,
}

/// Package extension to repository format. Registration is static.
const REGISTRY: [(&str, Format); 2] = [("rpm", Format::Rpm), ("deb", Format::Deb)];

fn format_for(filename: &str) -> Result<Format> {
    let extension = basename(filename).rsplit('.').next().unwrap_or_default();
    REGISTRY
        .iter()
        .find(|(known, _)| *known == extension)
        .map(|(_, format)| *format)
        .ok_or_else(|| Error::config(format!("unsupported package extension: {filename}")))
}

/// An open transaction on one repository, dispatched by package format.
pub enum Repository {
    Rpm(rpm::RpmRepository),
    Deb(deb::DebRepository),
}

/// Resolve the repository for `path` and open a transaction on it.
pub async fn get_repository(
    path: &str,
    variables: &Variables,
    config: &Config,
    options: RepositoryOptions,
) -> Result<Repository> {
    match format_for(path)? {
        Format::Rpm => {
            let url = rpm::RpmRepository::find_repository(path, variables, &config.rpm)?;
            let repo = rpm::RpmRepository::open(&url, config, &options).await?;
            Ok(Repository::Rpm(repo))
        }
        Format::Deb => {
            let coordinates = deb::DebRepository::find_repository(path, variables, &config.deb)?;
            let repo = deb::DebRepository::open(coordinates, config, &options).await?;
            Ok(Repository::Deb(repo))
        }
    }
}

impl Repository {
    /// Final repository URL.
    pub fn url(&self) -> &str {
        match self {
            Repository::Rpm(repo) => repo.url(),
            Repository::Deb(repo) => repo.url(),
        }
    }

    /// Declared signing identity, when a key is loaded.
    pub fn gpg_user_id(&self) -> Option<&str> {
        match self {
            Repository::Rpm(repo) => repo.gpg_user_id(),
            Repository::Deb(repo) => repo.gpg_user_id(),
        }
    }

    pub fn modified(&self) -> &BTreeSet<String> {
        match self {
            Repository::Rpm(repo) => repo.modified(),
            Repository::Deb(repo) => repo.modified(),
        }
    }

    pub fn removed(&self) -> &BTreeSet<String> {
        match self {
            Repository::Rpm(repo) => repo.removed(),
            Repository::Deb(repo) => repo.removed(),
        }
    }

    /// Ingest one package; returns the destination key.
    pub async fn add(&mut self, path: &str, remove_source: bool) -> Result<String> {
        match self {
            Repository::Rpm(repo) => repo.add(path, remove_source).await,
            Repository::Deb(repo) => repo.add(path, remove_source).await,
        }
    }

    /// Drop one package from every index.
    pub async fn remove(&mut self, filename: &str) -> Result<()> {
        match self {
            Repository::Rpm(repo) => repo.remove(filename).await,
            Repository::Deb(repo) => repo.remove(filename).await,
        }
    }

    /// Save, publish and release every transaction resource.
    pub async fn close(self) -> Result<TransactionSummary> {
        match self {
            Repository::Rpm(repo) => repo.close().await,
            Repository::Deb(repo) => repo.close().await,
        }
    }
}

/// State shared by every open transaction.
pub(crate) struct Transaction {
    pub(crate) url: String,
    pub(crate) storage: Storage,
    pub(crate) gpg: Option<GpgSession>,
    pub(crate) modified: BTreeSet<String>,
    pub(crate) removed: BTreeSet<String>,
}

impl Transaction {
    pub(crate) fn new(url: String, storage: Storage, gpg: Option<GpgSession>) -> Self {
        Transaction {
            url,
            storage,
            gpg,
            modified: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }

    pub(crate) fn mark_as_modified(&mut self, path: impl Into<String>) {
        self.modified.insert(path.into());
    }

    pub(crate) fn mark_for_deletion(&mut self, path: impl Into<String>) {
        self.removed.insert(path.into());
    }

    /// Flush deletions, invalidate the CDN over everything that changed,
    /// and close the signing session. The scratch directory goes away
    /// when the storage driver is dropped.
    pub(crate) async fn finish(self) -> Result<TransactionSummary> {
        let removals: Vec<&String> = self.removed.iter().collect();
        futures_util::future::try_join_all(
            removals.iter().map(|path| self.storage.remove(path, false)),
        )
        .await?;

        let changed: BTreeSet<String> = self.modified.union(&self.removed).cloned().collect();
        if !changed.is_empty() {
            self.storage.invalidate_cache(&changed).await?;
        }

        if let Some(gpg) = &self.gpg {
            gpg.close().await?;
        }

        info!(
            url = %self.url,
            modified = self.modified.len(),
            removed = self.removed.len(),
            "transaction closed"
        );
        Ok(TransactionSummary {
            url: self.url,
            modified: self.modified,
            removed: self.removed,
        })
    }
}

/// Initialise the signing session for a transaction, when a key is
/// configured.
pub(crate) async fn open_gpg(
    config: &Config,
    options: &RepositoryOptions,
    default_verify: bool,
    scratch: &Path,
) -> Result<Option<GpgSession>> {
    let key = options
        .gpg_private_key
        .clone()
        .or_else(|| config.gpg.private_key.clone());
    let Some(key) = key else {
        debug!("no signing key configured");
        return Ok(None);
    };
    let password = options
        .gpg_password
        .clone()
        .or_else(|| config.gpg.password.clone());
    let verify = options.gpg_verify.unwrap_or(default_verify);
    let session = GpgSession::open(
        &config.gpg,
        &key,
        password.as_deref(),
        verify,
        options.gpg_clear,
        scratch,
    )
    .await?;
    Ok(Some(session))
}

/// Substitute `$name` / `${name}` template variables. Unknown variables
/// are a configuration error.
pub(crate) fn substitute(template: &str, variables: &Variables) -> Result<String> {
    let pattern = lazy_regex!(r"\$(?:\{(?P<braced>\w+)\}|(?P<name>\w+))");
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for captures in pattern.captures_iter(template) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        let Some(name) = captures.name("braced").or_else(|| captures.name("name")) else {
            continue;
        };
        let value = variables.get(name.as_str()).ok_or_else(|| {
            Error::config(format!(
                "no value for template variable ${} in {template:?}",
                name.as_str()
            ))
        })?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Whether the template references `$name` at all.
pub(crate) fn template_contains(template: &str, name: &str) -> bool {
    let pattern = lazy_regex!(r"\$(?:\{(?P<braced>\w+)\}|(?P<name>\w+))");
    pattern.captures_iter(template).any(|captures| {
        captures
            .name("braced")
            .or_else(|| captures.name("name"))
            .is_some_and(|found| found.as_str() == name)
    })
}

/// Final path component.
pub(crate) fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Filename without its last extension.
pub(crate) fn stem(filename: &str) -> &str {
    filename
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(filename)
}
