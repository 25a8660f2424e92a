mod record;
mod repomd;
mod sqlite;
mod xml;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lazy_regex::lazy_regex;
use tracing::{debug, instrument};

use crate::checksum::{ChecksumType, CompressionType, decompress_named};
use crate::error::{Error, Result};
use crate::process;
use crate::repository::{
    Config, RepositoryOptions, Transaction, TransactionSummary, Variables, basename, open_gpg,
    stem, substitute, template_contains,
};
use crate::storage::{Storage, get_storage};
use self::record::{PKG_METADATA, RecordType, RpmRecord};

const REPODATA: &str = "repodata";
const REPOMD: &str = "repodata/repomd.xml";

/// Process-wide RPM settings.
#[derive(Clone, Debug)]
pub struct RpmConfig {
    /// Base-URL template; supports `$releasever`, `$basearch`, `$arch`
    /// plus caller variables.
    pub base_url: Option<String>,
    pub checksum_type: ChecksumType,
    pub compression: CompressionType,
    pub db_compression: CompressionType,
    /// Prefix `rpm` key import/erase invocations with `sudo`.
    pub gpg_require_sudo: bool,
}

impl Default for RpmConfig {
    fn default() -> Self {
        RpmConfig {
            base_url: None,
            checksum_type: ChecksumType::Sha256,
            compression: CompressionType::Gz,
            db_compression: CompressionType::Bz2,
            gpg_require_sudo: false,
        }
    }
}

impl RpmConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = RpmConfig::default();
        config.base_url = std::env::var("RPM_BASEURL").ok();
        if let Ok(raw) = std::env::var("RPM_CHECKSUM_TYPE") {
            config.checksum_type = ChecksumType::from_code(parse_code("RPM_CHECKSUM_TYPE", &raw)?)?;
        }
        if let Ok(raw) = std::env::var("RPM_COMPRESSION") {
            config.compression = CompressionType::from_code(parse_code("RPM_COMPRESSION", &raw)?)?;
        }
        if let Ok(raw) = std::env::var("RPM_DB_COMPRESSION") {
            config.db_compression =
                CompressionType::from_code(parse_code("RPM_DB_COMPRESSION", &raw)?)?;
        }
        config.gpg_require_sudo = std::env::var("RPM_GPG_REQUIRE_SUDO")
            .map(|value| !matches!(value.as_str(), "" | "0" | "false" | "False"))
            .unwrap_or(false);
        Ok(config)
    }
}

fn parse_code(name: &str, raw: &str) -> Result<u32> {
    raw.parse()
        .map_err(|_| Error::config(format!("{name} must be an integer, got {raw:?}")))
}

/// The four in-memory indices, keyed by NVRA. `updateinfo` tracks
/// mutations but is produced by a separate pipeline and never
/// serialised here.
#[derive(Default)]
struct Indices {
    primary: BTreeMap<String, Arc<RpmRecord>>,
    filelists: BTreeMap<String, Arc<RpmRecord>>,
    other: BTreeMap<String, Arc<RpmRecord>>,
    updateinfo: BTreeMap<String, Arc<RpmRecord>>,
}

impl Indices {
    fn for_type(&self, record_type: RecordType) -> &BTreeMap<String, Arc<RpmRecord>> {
        match record_type {
            RecordType::Primary => &self.primary,
            RecordType::Filelists => &self.filelists,
            RecordType::Other => &self.other,
        }
    }

    fn for_type_mut(&mut self, record_type: RecordType) -> &mut BTreeMap<String, Arc<RpmRecord>> {
        match record_type {
            RecordType::Primary => &mut self.primary,
            RecordType::Filelists => &mut self.filelists,
            RecordType::Other => &mut self.other,
        }
    }

    fn all_mut(&mut self) -> [&mut BTreeMap<String, Arc<RpmRecord>>; 4] {
        [
            &mut self.primary,
            &mut self.filelists,
            &mut self.other,
            &mut self.updateinfo,
        ]
    }
}

/// An open transaction on one RPM repository.
pub struct RpmRepository {
    tx: Transaction,
    checksum_type: ChecksumType,
    compression: CompressionType,
    db_compression: CompressionType,
    gpg_require_sudo: bool,
    gpg_clear: bool,
    indices: Indices,
    /// Files referenced by the previous `repomd.xml`; whatever is not
    /// re-emitted becomes stale.
    outdated: BTreeSet<String>,
}

impl RpmRepository {
    /// Resolve the repository URL for a package filename from the
    /// base-URL template.
    ///
    /// `$releasever` requires the dist tag in the package release field
    /// (Fedora/RHEL naming convention); its leading letters are
    /// stripped, so `el8` binds `releasever` to `8`.
    pub fn find_repository(
        filename: &str,
        variables: &Variables,
        config: &RpmConfig,
    ) -> Result<String> {
        let base_url = config.base_url.as_deref().ok_or_else(|| {
            Error::config(
                "base URL must be defined; it can be set using the RPM_BASEURL \
                 environment variable",
            )
        })?;

        let name = basename(filename);
        let pattern = lazy_regex!(
            r"^(.*/)?(?P<name>.*)-((?P<epoch>\d+):)?(?P<version>.*)-(?P<release>.*)\.(?P<arch>.*)\.rpm$"i
        );
        let captures = pattern.captures(name).ok_or_else(|| {
            Error::invalid_package(format!(
                "unable to parse the {filename:?} package name; the name must follow \
                 \"<name>-<version>-<release>.<arch>.rpm\" with \"release\" in the form \
                 \"<number>.<dist>\" (for instance \"my_package-1.0.0-1.el8.noarch.rpm\")"
            ))
        })?;

        let arch = captures
            .name("arch")
            .map(|found| found.as_str())
            .unwrap_or_default();
        let mut variables = variables.clone();
        variables.insert("arch".to_string(), arch.to_string());
        variables.insert("basearch".to_string(), arch.to_string());

        if template_contains(base_url, "releasever") {
            let release = captures
                .name("release")
                .map(|found| found.as_str())
                .unwrap_or_default();
            let dist = release.split_once('.').map(|(_, dist)| dist).ok_or_else(|| {
                Error::invalid_package(format!(
                    "unable to get \"releasever\" from \"release\" value {release:?} for \
                     package {filename:?}; the package \"release\" field must contain the \
                     dist tag and be in the form \"<number>.<dist>\" (for instance \
                     \"1.el8\")"
                ))
            })?;
            variables.insert(
                "releasever".to_string(),
                dist.trim_start_matches(|c: char| c.is_ascii_alphabetic())
                    .to_string(),
            );
        }

        substitute(base_url, &variables)
    }

    /// Open a transaction: storage first, then the signing session and
    /// the existing metadata concurrently, then the `rpm` keyring.
    #[instrument(skip(config, options))]
    pub async fn open(url: &str, config: &Config, options: &RepositoryOptions) -> Result<Self> {
        let storage = get_storage(url).await?;
        let (gpg, (indices, outdated)) = tokio::try_join!(
            open_gpg(config, options, false, storage.path()),
            load(&storage)
        )?;
        let repo = RpmRepository {
            tx: Transaction::new(url.to_string(), storage, gpg),
            checksum_type: config.rpm.checksum_type,
            compression: config.rpm.compression,
            db_compression: config.rpm.db_compression,
            gpg_require_sudo: config.rpm.gpg_require_sudo,
            gpg_clear: options.gpg_clear,
            indices,
            outdated,
        };
        repo.import_rpm_key().await?;
        Ok(repo)
    }

    pub fn url(&self) -> &str {
        &self.tx.url
    }

    pub fn gpg_user_id(&self) -> Option<&str> {
        self.tx.gpg.as_ref().map(|gpg| gpg.user_id())
    }

    pub fn modified(&self) -> &BTreeSet<String> {
        &self.tx.modified
    }

    pub fn removed(&self) -> &BTreeSet<String> {
        &self.tx.removed
    }

    /// Ingest one package, signing it when a key is loaded.
    #[instrument(skip(self))]
    pub async fn add(&mut self, path: &str, remove_source: bool) -> Result<String> {
        let filename = basename(path).to_string();
        let dst = self.tx.storage.join(&filename);
        let pkg_name = stem(&filename).to_string();
        if self.indices.primary.contains_key(&pkg_name) {
            if path != dst {
                self.tx.storage.remove(path, true).await?;
            }
            return Err(Error::PackageAlreadyExists(filename));
        }

        self.tx.storage.get_file(path, Some(&filename), true).await?;
        let signed = self.sign_package(&filename).await?;

        let local = self.tx.storage.tmp_join(&filename);
        let mut package = RpmRecord::from_file(&local, self.checksum_type)?;
        let nvra = package.nvra();
        if pkg_name != nvra && pkg_name != package.nevra() {
            return Err(Error::invalid_package(format!(
                "RPM package filename must match NVRA or NEVRA from its metadata: {nvra}"
            )));
        }
        package.location_href = filename.clone();
        let package = Arc::new(package);
        for index in self.indices.all_mut() {
            index.entry(nvra.clone()).or_insert_with(|| package.clone());
        }

        let upload = signed || path != dst;
        let remove_source = remove_source && path != dst;
        match (upload, remove_source) {
            (true, true) => {
                tokio::try_join!(
                    self.tx.storage.put_file(&filename),
                    self.tx.storage.remove(path, true)
                )?;
            }
            (true, false) => self.tx.storage.put_file(&filename).await?,
            (false, true) => self.tx.storage.remove(path, true).await?,
            (false, false) => {}
        }
        self.tx.mark_as_modified(filename.clone());
        self.tx.storage.remove_tmp(&filename).await?;
        debug!(package = %nvra, dst = %dst, "added package");
        Ok(dst)
    }

    /// Drop one package from every index.
    #[instrument(skip(self))]
    pub async fn remove(&mut self, filename: &str) -> Result<()> {
        let filename = basename(filename).to_string();
        let nvra = stem(&filename).to_string();
        for index in self.indices.all_mut() {
            index.remove(&nvra);
        }
        self.tx.mark_for_deletion(filename);
        Ok(())
    }

    /// Save, publish and release every transaction resource.
    #[instrument(skip(self))]
    pub async fn close(mut self) -> Result<TransactionSummary> {
        self.save().await?;
        self.clear_rpm_key().await?;
        self.tx.finish().await
    }

    /// Regenerate every metadata stream and publish what changed.
    ///
    /// Metadata filenames carry their content hash, so a file whose name
    /// matches one from the previous `repomd.xml` is unchanged: nothing
    /// to upload, nothing to delete. When nothing changed at all, the
    /// repository is left untouched.
    async fn save(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(self.tx.storage.tmp_join(REPODATA)).await?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut repomd_records = Vec::new();
        let mut metadata_files = Vec::new();
        for record_type in PKG_METADATA {
            let records: Vec<Arc<RpmRecord>> =
                self.indices.for_type(record_type).values().cloned().collect();

            let rendered = record::render(record_type, &records).into_bytes();
            let open_checksum = self.checksum_type.digest(&rendered);
            let packed = self.compression.compress(&rendered)?;
            let checksum = self.checksum_type.digest(&packed);
            let href = format!(
                "{REPODATA}/{checksum}-{}.xml{}",
                record_type.name(),
                self.compression.suffix()
            );
            tokio::fs::write(self.tx.storage.tmp_join(&href), &packed).await?;
            repomd_records.push(repomd::RepomdData {
                record_type: record_type.name().to_string(),
                href: href.clone(),
                checksum,
                open_checksum: Some(open_checksum.clone()),
                checksum_type: self.checksum_type,
                size: packed.len() as u64,
                open_size: Some(rendered.len() as u64),
                timestamp: now,
                database_version: None,
            });
            metadata_files.push(href);

            let database = self
                .tx
                .storage
                .tmp_join(&format!("{REPODATA}/{}.sqlite", record_type.name()));
            sqlite::write_database(record_type, &database, &records, &open_checksum)?;
            let db_bytes = tokio::fs::read(&database).await?;
            let db_packed = self.db_compression.compress(&db_bytes)?;
            let db_checksum = self.checksum_type.digest(&db_packed);
            let db_href = format!(
                "{REPODATA}/{db_checksum}-{}.sqlite{}",
                record_type.name(),
                self.db_compression.suffix()
            );
            tokio::fs::write(self.tx.storage.tmp_join(&db_href), &db_packed).await?;
            repomd_records.push(repomd::RepomdData {
                record_type: format!("{}_db", record_type.name()),
                href: db_href.clone(),
                checksum: db_checksum,
                open_checksum: Some(self.checksum_type.digest(&db_bytes)),
                checksum_type: self.checksum_type,
                size: db_packed.len() as u64,
                open_size: Some(db_bytes.len() as u64),
                timestamp: now,
                database_version: Some(10),
            });
            metadata_files.push(db_href);
        }
        repomd::sort_records(&mut repomd_records);

        let outdated = &mut self.outdated;
        metadata_files.retain(|path| !outdated.remove(path));
        if metadata_files.is_empty() {
            debug!("metadata unchanged, publishing nothing");
            return Ok(());
        }

        self.tx.mark_as_modified(REPOMD);
        for path in &metadata_files {
            self.tx.mark_as_modified(path.clone());
        }
        for path in std::mem::take(&mut self.outdated) {
            self.tx.mark_for_deletion(path);
        }

        let rendered = repomd::render(&repomd_records, now);
        tokio::fs::write(self.tx.storage.tmp_join(REPOMD), rendered).await?;

        let mut uploads = metadata_files;
        uploads.push(REPOMD.to_string());
        if let Some(gpg) = &self.tx.gpg {
            let signature = gpg.sign_detached(REPOMD).await?;
            self.tx.mark_as_modified(signature.clone());
            uploads.push(signature);
        }
        futures_util::future::try_join_all(
            uploads.iter().map(|path| self.tx.storage.put_file(path)),
        )
        .await?;
        Ok(())
    }

    fn rpm_argv(&self) -> Vec<String> {
        if self.gpg_require_sudo {
            vec!["sudo".to_string(), "rpm".to_string()]
        } else {
            vec!["rpm".to_string()]
        }
    }

    /// Sign the downloaded package in place. Returns whether a
    /// signature was applied.
    async fn sign_package(&self, filename: &str) -> Result<bool> {
        let Some(gpg) = &self.tx.gpg else {
            return Ok(false);
        };
        process::run(
            &[
                "rpm",
                "--addsign",
                "--define",
                &format!("%_gpg_name {}", gpg.user_id()),
                filename,
            ],
            self.tx.storage.path(),
            None,
            true,
        )
        .await?;
        if gpg.verify() {
            let mut argv = self.rpm_argv();
            argv.extend(["--checksig".to_string(), filename.to_string()]);
            process::run(&argv, self.tx.storage.path(), None, true).await?;
        }
        Ok(true)
    }

    /// Prime the `rpm` keyring so `--checksig` can validate signatures.
    async fn import_rpm_key(&self) -> Result<()> {
        let Some(gpg) = &self.tx.gpg else {
            return Ok(());
        };
        if !gpg.verify() {
            return Ok(());
        }
        let mut argv = self.rpm_argv();
        argv.extend([
            "--import".to_string(),
            gpg.public_key().to_string_lossy().into_owned(),
        ]);
        process::run(&argv, self.tx.storage.path(), None, true).await?;
        Ok(())
    }

    /// Erase the imported key from the `rpm` keyring again.
    async fn clear_rpm_key(&self) -> Result<()> {
        let Some(gpg) = &self.tx.gpg else {
            return Ok(());
        };
        if !self.gpg_clear || !gpg.verify() {
            return Ok(());
        }
        let mut argv = self.rpm_argv();
        argv.extend(
            [
                "-q",
                "gpg-pubkey",
                "--qf",
                "%{NAME}-%{VERSION}-%{RELEASE}\t%{SUMMARY}\n",
            ]
            .map(String::from),
        );
        let listing = process::run(&argv, self.tx.storage.path(), None, false).await?;
        let key_name = format!("{} ", gpg.user_id());
        for line in String::from_utf8_lossy(&listing).lines() {
            let Some((key_id, summary)) = line.split_once('\t') else {
                continue;
            };
            if summary.starts_with(&key_name) {
                let mut erase = self.rpm_argv();
                erase.extend([
                    "--erase".to_string(),
                    "--allmatches".to_string(),
                    key_id.to_string(),
                ]);
                process::run(&erase, self.tx.storage.path(), None, true).await?;
                break;
            }
        }
        Ok(())
    }
}

/// Load the current repository if it exists; a missing `repomd.xml`
/// means "start empty".
async fn load(storage: &Storage) -> Result<(Indices, BTreeSet<String>)> {
    tokio::fs::create_dir_all(storage.tmp_join(REPODATA)).await?;
    let mut indices = Indices::default();
    let mut outdated = BTreeSet::new();

    let repomd_data = match storage.get_object(REPOMD, false).await {
        Ok(data) => data,
        Err(Error::PackageNotFound(_)) => return Ok((indices, outdated)),
        Err(err) => return Err(err),
    };

    let mut wanted: Vec<(RecordType, String)> = Vec::new();
    for (record_type, href) in xml::parse_repomd(&repomd_data)? {
        outdated.insert(href.clone());
        match record_type.as_str() {
            "primary" => wanted.push((RecordType::Primary, href)),
            "filelists" => wanted.push((RecordType::Filelists, href)),
            "other" => wanted.push((RecordType::Other, href)),
            _ => {}
        }
    }

    let fetched = futures_util::future::try_join_all(
        wanted.iter().map(|(_, href)| storage.get_object(href, false)),
    )
    .await?;
    for ((record_type, href), data) in wanted.iter().zip(fetched) {
        let plain = decompress_named(href, data)?;
        let records = match record_type {
            RecordType::Primary => xml::parse_primary(&plain)?,
            RecordType::Filelists => xml::parse_filelists(&plain)?,
            RecordType::Other => xml::parse_other(&plain)?,
        };
        let index = indices.for_type_mut(*record_type);
        for record in records {
            index.insert(record.nvra(), Arc::new(record));
        }
    }
    debug!(packages = indices.primary.len(), "loaded existing repository");
    Ok((indices, outdated))
}
