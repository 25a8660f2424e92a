mod deb822;
mod debfile;
mod release;

use std::collections::{BTreeMap, BTreeSet};

use lazy_regex::{lazy_regex, regex_captures};
use md5::Md5;
use sha2::Digest as _;
use tracing::{debug, instrument};

use self::deb822::Paragraph;
use self::release::IndexFile;
use crate::checksum::{CompressionType, Hashes, RELEASE_ALGORITHMS};
use crate::error::{Error, Result};
use crate::repository::{
    Config, RepositoryOptions, Transaction, TransactionSummary, Variables, basename, open_gpg,
    substitute,
};
use crate::storage::{Storage, get_storage};

/// Process-wide DEB repository template: `url`, `suite`, `codename`,
/// `component` and `architecture`, each supporting `$var` substitution
/// over auto-detected fields and caller extras.
#[derive(Clone, Debug, Default)]
pub struct DebConfig {
    pub template: BTreeMap<String, String>,
}

impl DebConfig {
    pub fn from_env() -> Self {
        let mut template = BTreeMap::new();
        for (variable, key) in [
            ("DEB_URL", "url"),
            ("DEB_SUITE", "suite"),
            ("DEB_CODENAME", "codename"),
            ("DEB_COMPONENT", "component"),
            ("DEB_ARCHITECTURE", "architecture"),
        ] {
            if let Ok(value) = std::env::var(variable) {
                template.insert(key.to_string(), value);
            }
        }
        DebConfig { template }
    }
}

/// Repository coordinates resolved for one package filename.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebCoordinates {
    pub url: String,
    pub suite: Option<String>,
    pub codename: Option<String>,
    pub component: String,
    pub architecture: String,
}

#[derive(Debug, PartialEq, Eq)]
struct ParsedName {
    name: String,
    version: String,
    architecture: String,
}

type Pair = (String, String);
type PackageIndex = BTreeMap<Pair, BTreeMap<String, Paragraph>>;
type ContentsIndex = BTreeMap<Pair, BTreeMap<String, BTreeSet<String>>>;

/// An open transaction on one Debian repository.
pub struct DebRepository {
    tx: Transaction,
    suite: Option<String>,
    codename: Option<String>,
    component: String,
    dist: String,
    packages: PackageIndex,
    contents: ContentsIndex,
    prior_exists: bool,
    /// `by-hash` paths referenced by the previous `Release`, relative to
    /// `dists/<dist>/`.
    prior_by_hash: BTreeSet<String>,
}

impl DebRepository {
    /// Resolve repository coordinates for a package filename.
    ///
    /// The architecture comes from the filename; the codename, when the
    /// template does not pin one, must be carried by the version suffix
    /// (`~<codename>` or `+<codename>` after the revision).
    pub fn find_repository(
        filename: &str,
        variables: &Variables,
        config: &DebConfig,
    ) -> Result<DebCoordinates> {
        let parsed = parse_pkg_name(filename)?;
        let mut variables = variables.clone();
        variables.insert("architecture".to_string(), parsed.architecture.clone());

        let detected_codename =
            regex_captures!(r"^.+-[^~+-]+[~+](?P<codename>[^_]+)$", &parsed.version)
                .map(|(_, codename)| codename.to_string());
        match &detected_codename {
            Some(codename) => {
                variables.insert("codename".to_string(), codename.clone());
            }
            None if !config.template.contains_key("codename") => {
                return Err(Error::invalid_package(format!(
                    "unable to detect the codename from {filename:?}; the version must \
                     carry a revision and codename suffix (for instance \
                     \"1.0.0-1~bullseye\") when no codename is configured"
                )));
            }
            None => {}
        }

        let resolve = |key: &str, fallback: Option<String>| -> Result<Option<String>> {
            match config.template.get(key) {
                Some(template) => substitute(template, &variables).map(Some),
                None => Ok(fallback),
            }
        };

        let url = config
            .template
            .get("url")
            .ok_or_else(|| Error::config("the DEB repository template must define \"url\""))?;
        Ok(DebCoordinates {
            url: substitute(url, &variables)?,
            suite: resolve("suite", None)?,
            codename: resolve("codename", detected_codename)?,
            component: resolve("component", None)?.unwrap_or_else(|| "main".to_string()),
            architecture: resolve("architecture", None)?.unwrap_or(parsed.architecture),
        })
    }

    /// Open a transaction: storage first, then the signing session and
    /// the existing indices concurrently.
    #[instrument(skip(config, options))]
    pub async fn open(
        coordinates: DebCoordinates,
        config: &Config,
        options: &RepositoryOptions,
    ) -> Result<Self> {
        if coordinates.suite.is_none() && coordinates.codename.is_none() {
            return Err(Error::config(
                "at least one of \"suite\" and \"codename\" must be configured",
            ));
        }
        let dist = coordinates
            .codename
            .clone()
            .or_else(|| coordinates.suite.clone())
            .unwrap_or_default();

        let storage = get_storage(&coordinates.url).await?;
        let (gpg, loaded) = tokio::try_join!(
            open_gpg(config, options, true, storage.path()),
            load(&storage, &dist)
        )?;

        let mut repo = DebRepository {
            tx: Transaction::new(coordinates.url, storage, gpg),
            suite: coordinates.suite,
            codename: coordinates.codename,
            component: coordinates.component.clone(),
            dist,
            packages: loaded.packages,
            contents: loaded.contents,
            prior_exists: loaded.prior_exists,
            prior_by_hash: loaded.prior_by_hash,
        };
        let pair = (coordinates.component, coordinates.architecture);
        repo.packages.entry(pair.clone()).or_default();
        repo.contents.entry(pair).or_default();
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

    /// Ingest one package into the pool and the indices.
    #[instrument(skip(self))]
    pub async fn add(&mut self, path: &str, remove_source: bool) -> Result<String> {
        let filename = basename(path).to_string();
        let parsed = parse_pkg_name(&filename)?;
        let pool = pool_path(&self.component, &parsed.name, &filename);
        let dst = self.tx.storage.join(&pool);
        let pair = (self.component.clone(), parsed.architecture.clone());
        if self
            .packages
            .get(&pair)
            .is_some_and(|index| index.contains_key(&parsed.name))
        {
            if path != dst {
                self.tx.storage.remove(path, true).await?;
            }
            return Err(Error::PackageAlreadyExists(filename));
        }

        self.tx.storage.get_file(path, Some(&pool), true).await?;
        let data = tokio::fs::read(self.tx.storage.tmp_join(&pool)).await?;
        let parsed_deb = debfile::read(&data)?;
        let mut stanza = parsed_deb.control;
        check_package(&parsed, &stanza)?;
        hash_description(&mut stanza);

        let hashes = Hashes::digest(&data);
        stanza.set("Filename", pool.clone());
        stanza.set("Size", data.len().to_string());
        stanza.set("MD5sum", hashes.md5);
        stanza.set("SHA1", hashes.sha1);
        stanza.set("SHA256", hashes.sha256);

        let qualified = qualified_name(&stanza, &parsed.name);
        union_contents(
            self.contents.entry(pair.clone()).or_default(),
            &qualified,
            parsed_deb.files,
        );
        self.packages
            .entry(pair)
            .or_default()
            .insert(parsed.name.clone(), stanza);

        if path != dst {
            if remove_source {
                tokio::try_join!(
                    self.tx.storage.put_file(&pool),
                    self.tx.storage.remove(path, true)
                )?;
            } else {
                self.tx.storage.put_file(&pool).await?;
            }
        }
        self.tx.mark_as_modified(pool);
        debug!(package = %parsed.name, dst = %dst, "added package");
        Ok(dst)
    }

    /// Drop one package from the indices and schedule its pool file for
    /// deletion.
    #[instrument(skip(self))]
    pub async fn remove(&mut self, filename: &str) -> Result<()> {
        let filename = basename(filename).to_string();
        let parsed = parse_pkg_name(&filename)?;
        let pair = (self.component.clone(), parsed.architecture.clone());
        let stanza = self
            .packages
            .get_mut(&pair)
            .and_then(|index| index.remove(&parsed.name));
        if let Some(table) = self.contents.get_mut(&pair) {
            match stanza.as_ref() {
                Some(stanza) => {
                    subtract_contents(table, &qualified_name(stanza, &parsed.name));
                }
                None => {
                    // The stanza was never loaded; drop any entry that can
                    // only belong to this package name.
                    let suffix = format!("/{}", parsed.name);
                    table.retain(|_, names| {
                        names.retain(|name| name != &parsed.name && !name.ends_with(&suffix));
                        !names.is_empty()
                    });
                }
            }
        }
        self.tx
            .mark_for_deletion(pool_path(&self.component, &parsed.name, &filename));
        Ok(())
    }

    /// Save, publish and release every transaction resource.
    #[instrument(skip(self))]
    pub async fn close(mut self) -> Result<TransactionSummary> {
        self.save().await?;
        self.tx.finish().await
    }

    /// Regenerate every index and publish what changed.
    ///
    /// `by-hash` names collide only when content is identical, so an
    /// index whose hashed location already exists in the previous
    /// `Release` produces no upload and keeps its pool files alive.
    async fn save(&mut self) -> Result<()> {
        let mut pairs: BTreeSet<Pair> = self.packages.keys().cloned().collect();
        pairs.extend(self.contents.keys().cloned());

        let mut components = BTreeSet::new();
        let mut architectures = BTreeSet::new();
        let archive = self
            .suite
            .clone()
            .unwrap_or_else(|| self.dist.clone());

        let mut files: Vec<IndexFile> = Vec::new();
        for (component, architecture) in &pairs {
            components.insert(component.clone());
            architectures.insert(architecture.clone());

            let base = format!("{component}/binary-{architecture}");
            let packages = render_packages(self.packages.get(&(component.clone(), architecture.clone())));
            let packages = packages.into_bytes();
            files.push(IndexFile::new(
                format!("{base}/Packages.gz"),
                CompressionType::Gz.compress(&packages)?,
            ));
            files.push(IndexFile::new(
                format!("{base}/Packages.xz"),
                CompressionType::Xz.compress(&packages)?,
            ));
            files.push(IndexFile::new(format!("{base}/Packages"), packages));
            files.push(IndexFile::new(
                format!("{base}/Release"),
                release::render_binary_release(&archive, component, architecture).into_bytes(),
            ));

            let contents = render_contents(
                self.contents
                    .get(&(component.clone(), architecture.clone())),
            )
            .into_bytes();
            files.push(IndexFile::new(
                format!("{component}/Contents-{architecture}.gz"),
                CompressionType::Gz.compress(&contents)?,
            ));
            files.push(IndexFile::new(
                format!("{component}/Contents-{architecture}"),
                contents,
            ));
        }

        let dists = format!("dists/{}", self.dist);
        let mut new_by_hash = BTreeSet::new();
        let mut changed: Vec<IndexFile> = Vec::new();
        for file in files.iter() {
            let hashed = file.by_hash_paths();
            let unchanged = self
                .prior_by_hash
                .contains(&release::by_hash_path(&file.rel, "SHA256", &file.hashes.sha256));
            new_by_hash.extend(hashed);
            if !unchanged {
                changed.push(file.clone());
            }
        }

        if changed.is_empty() && self.prior_exists {
            debug!("indices unchanged, publishing nothing");
            return Ok(());
        }

        // Index contents (plain and by-hash pool) go up before the
        // release files so the published Release always points at
        // objects that exist.
        let mut uploads: Vec<(String, Vec<u8>)> = Vec::new();
        for file in &changed {
            uploads.push((format!("{dists}/{}", file.rel), file.data.clone()));
            for algorithm in RELEASE_ALGORITHMS {
                let digest = file.hashes.by_algorithm(algorithm).unwrap_or_default();
                uploads.push((
                    format!("{dists}/{}", release::by_hash_path(&file.rel, algorithm, digest)),
                    file.data.clone(),
                ));
            }
        }
        futures_util::future::try_join_all(
            uploads
                .iter()
                .map(|(path, data)| self.tx.storage.put_object(path, data.clone(), false)),
        )
        .await?;
        for (path, _) in uploads {
            self.tx.mark_as_modified(path);
        }

        let release_text = release::render_release(
            self.suite.as_deref(),
            self.codename.as_deref(),
            &architectures,
            &components,
            &files,
        )?;
        let release_rel = format!("{dists}/Release");
        let inrelease_rel = format!("{dists}/InRelease");
        let signature_rel = format!("{dists}/Release.gpg");

        tokio::fs::create_dir_all(self.tx.storage.tmp_join(&dists)).await?;
        tokio::fs::write(self.tx.storage.tmp_join(&release_rel), &release_text).await?;
        self.tx.storage.put_file(&release_rel).await?;
        self.tx.mark_as_modified(release_rel.clone());

        match &self.tx.gpg {
            Some(gpg) => {
                gpg.sign_cleartext(&release_rel, &inrelease_rel).await?;
                gpg.sign_detached_to(&release_rel, &signature_rel).await?;
                tokio::try_join!(
                    self.tx.storage.put_file(&inrelease_rel),
                    self.tx.storage.put_file(&signature_rel)
                )?;
                self.tx.mark_as_modified(signature_rel);
            }
            None => {
                // Unsigned repositories still publish InRelease so
                // clients have one fetch path; it is a plain copy.
                self.tx
                    .storage
                    .put_object(&inrelease_rel, release_text.into_bytes(), false)
                    .await?;
            }
        }
        self.tx.mark_as_modified(inrelease_rel);

        for stale in std::mem::take(&mut self.prior_by_hash) {
            if !new_by_hash.contains(&stale) {
                self.tx.mark_for_deletion(format!("{dists}/{stale}"));
            }
        }
        Ok(())
    }
}

/// Parse `<name>_<version>_<arch>.deb`.
fn parse_pkg_name(filename: &str) -> Result<ParsedName> {
    let name = basename(filename);
    let pattern = lazy_regex!(r"^(?P<name>[^_/]+)_(?P<version>[^_/]+)_(?P<arch>[^_/.]+)\.deb$");
    let captures = pattern.captures(name).ok_or_else(|| {
        Error::invalid_package(format!(
            "unable to parse the {filename:?} package name; the name must follow \
             \"<name>_<version>_<arch>.deb\""
        ))
    })?;
    Ok(ParsedName {
        name: captures
            .name("name")
            .map(|found| found.as_str().to_string())
            .unwrap_or_default(),
        version: captures
            .name("version")
            .map(|found| found.as_str().to_string())
            .unwrap_or_default(),
        architecture: captures
            .name("arch")
            .map(|found| found.as_str().to_string())
            .unwrap_or_default(),
    })
}

/// Pool location for a package: one-letter prefix directories, with the
/// `libX` four-character convention.
fn pool_path(component: &str, name: &str, filename: &str) -> String {
    let prefix = if name.starts_with("lib") && name.len() >= 4 {
        &name[..4]
    } else {
        &name[..1]
    };
    format!("pool/{component}/{prefix}/{name}/{filename}")
}

/// Cross-check the filename against the control stanza.
fn check_package(parsed: &ParsedName, control: &Paragraph) -> Result<()> {
    for (field, expected) in [
        ("Package", &parsed.name),
        ("Version", &parsed.version),
        ("Architecture", &parsed.architecture),
    ] {
        let found = control.get(field).unwrap_or_default();
        if found != expected {
            return Err(Error::invalid_package(format!(
                "{field} mismatch between filename and control: {expected:?} != {found:?}"
            )));
        }
    }
    Ok(())
}

/// Add `Description-md5` when a description is present.
fn hash_description(control: &mut Paragraph) {
    if let Some(description) = control.get("Description") {
        let digest = hex::encode(Md5::digest(description.as_bytes()));
        control.set("Description-md5", digest);
    }
}

/// `<section>/<name>` as listed in `Contents` files.
fn qualified_name(control: &Paragraph, name: &str) -> String {
    match control.get("Section") {
        Some(section) if !section.is_empty() => format!("{section}/{name}"),
        _ => name.to_string(),
    }
}

/// Union a package's file list into the contents table, dropping the
/// entries it no longer provides.
fn union_contents(
    table: &mut BTreeMap<String, BTreeSet<String>>,
    qualified: &str,
    files: impl IntoIterator<Item = String>,
) {
    subtract_contents(table, qualified);
    for file in files {
        table.entry(file).or_default().insert(qualified.to_string());
    }
}

/// Remove a package from every contents entry.
fn subtract_contents(table: &mut BTreeMap<String, BTreeSet<String>>, qualified: &str) {
    table.retain(|_, names| {
        names.remove(qualified);
        !names.is_empty()
    });
}

fn render_packages(index: Option<&BTreeMap<String, Paragraph>>) -> String {
    let stanzas: Vec<String> = index
        .map(|index| index.values().map(Paragraph::render).collect())
        .unwrap_or_default();
    if stanzas.is_empty() {
        return String::new();
    }
    stanzas.join("\n")
}

fn render_contents(table: Option<&BTreeMap<String, BTreeSet<String>>>) -> String {
    let mut out = String::new();
    if let Some(table) = table {
        for (path, names) in table {
            let names = names.iter().cloned().collect::<Vec<_>>().join(",");
            out.push_str(path);
            out.push(' ');
            out.push_str(&names);
            out.push('\n');
        }
    }
    out
}

struct LoadedState {
    packages: PackageIndex,
    contents: ContentsIndex,
    prior_exists: bool,
    prior_by_hash: BTreeSet<String>,
}

/// Load the previous release; a missing `Release` means "start empty".
async fn load(storage: &Storage, dist: &str) -> Result<LoadedState> {
    let mut state = LoadedState {
        packages: PackageIndex::new(),
        contents: ContentsIndex::new(),
        prior_exists: false,
        prior_by_hash: BTreeSet::new(),
    };
    let release_text = match storage.get_object(&format!("dists/{dist}/Release"), false).await {
        Ok(data) => String::from_utf8_lossy(&data).into_owned(),
        Err(Error::PackageNotFound(_)) => return Ok(state),
        Err(err) => return Err(err),
    };
    state.prior_exists = true;

    let lists = release::parse_file_lists(&release_text);
    let mut package_pairs = BTreeSet::new();
    let mut contents_pairs = BTreeSet::new();
    for (algorithm, entries) in &lists {
        for (digest, _, path) in entries {
            state
                .prior_by_hash
                .insert(release::by_hash_path(path, algorithm, digest));
            if path.contains("/by-hash/") {
                continue;
            }
            if let Some((_, component, architecture)) =
                regex_captures!(r"^([^/]+)/binary-([^/]+)/", path)
            {
                package_pairs.insert((component.to_string(), architecture.to_string()));
            }
            if let Some((_, component, architecture)) =
                regex_captures!(r"^([^/]+)/Contents-([^/.]+)$", path)
            {
                contents_pairs.insert((component.to_string(), architecture.to_string()));
            }
        }
    }

    // An index listed by the previous Release but since gone is treated
    // as empty rather than failing the whole transaction.
    let fetch = |path: String| async move {
        match storage.get_object(&path, false).await {
            Ok(data) => Ok(Some(data)),
            Err(Error::PackageNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    };
    let package_fetches =
        futures_util::future::try_join_all(package_pairs.iter().map(|(component, architecture)| {
            fetch(format!(
                "dists/{dist}/{component}/binary-{architecture}/Packages"
            ))
        }));
    let contents_fetches =
        futures_util::future::try_join_all(contents_pairs.iter().map(|(component, architecture)| {
            fetch(format!("dists/{dist}/{component}/Contents-{architecture}"))
        }));
    let (package_data, contents_data) = tokio::try_join!(package_fetches, contents_fetches)?;

    for (pair, data) in package_pairs.into_iter().zip(package_data) {
        let index = state.packages.entry(pair).or_default();
        let Some(data) = data else { continue };
        for stanza in deb822::parse(&String::from_utf8_lossy(&data))? {
            let Some(name) = stanza.get("Package").map(str::to_string) else {
                continue;
            };
            index.insert(name, stanza);
        }
    }
    for (pair, data) in contents_pairs.into_iter().zip(contents_data) {
        let table = state.contents.entry(pair).or_default();
        let Some(data) = data else { continue };
        for line in String::from_utf8_lossy(&data).lines() {
            let Some((path, names)) = line.rsplit_once(' ') else {
                continue;
            };
            let path = path.trim_end();
            if path.is_empty() {
                continue;
            }
            let entry = table.entry(path.to_string()).or_default();
            for name in names.split(',') {
                if !name.is_empty() {
                    entry.insert(name.to_string());
                }
            }
        }
    }
    debug!(
        pairs = state.packages.len(),
        prior = state.prior_exists,
        "loaded existing repository"
    );
    Ok(state)
}
