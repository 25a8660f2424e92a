use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::io::Write as _;

use tabwriter::{Alignment, TabWriter};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;

use crate::checksum::{Hashes, RELEASE_ALGORITHMS};
use crate::error::{Error, Result};

/// One generated index file, addressed relative to `dists/<dist>/`.
#[derive(Clone, Debug)]
pub struct IndexFile {
    pub rel: String,
    pub data: Vec<u8>,
    pub hashes: Hashes,
}

impl IndexFile {
    pub fn new(rel: String, data: Vec<u8>) -> Self {
        let hashes = Hashes::digest(&data);
        IndexFile { rel, data, hashes }
    }

    /// `by-hash` pool locations of this file, one per algorithm.
    pub fn by_hash_paths(&self) -> Vec<String> {
        RELEASE_ALGORITHMS
            .iter()
            .filter_map(|algorithm| {
                let digest = self.hashes.by_algorithm(algorithm)?;
                Some(by_hash_path(&self.rel, algorithm, digest))
            })
            .collect()
    }
}

/// `by-hash` location next to an index file.
pub fn by_hash_path(rel: &str, algorithm: &str, digest: &str) -> String {
    match rel.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/by-hash/{algorithm}/{digest}"),
        None => format!("by-hash/{algorithm}/{digest}"),
    }
}

/// Render the top-level `Release` file.
///
/// The date format is RFC 2822; the Debian spec technically asks for the
/// `date -R -u` format (RFC 5322), but 5322 is a compatible revision of
/// 2822.
pub fn render_release(
    suite: Option<&str>,
    codename: Option<&str>,
    architectures: &BTreeSet<String>,
    components: &BTreeSet<String>,
    files: &[IndexFile],
) -> Result<String> {
    let date = OffsetDateTime::now_utc()
        .format(&Rfc2822)
        .map_err(Error::metadata)?;

    let mut release = String::new();
    if let Some(suite) = suite {
        write!(release, "Suite: {suite}\n").unwrap();
    }
    if let Some(codename) = codename {
        write!(release, "Codename: {codename}\n").unwrap();
    }
    write!(release, "Date: {date}\n").unwrap();
    let architectures = architectures.iter().cloned().collect::<Vec<_>>().join(" ");
    write!(release, "Architectures: {architectures}\n").unwrap();
    let components = components.iter().cloned().collect::<Vec<_>>().join(" ");
    write!(release, "Components: {components}\n").unwrap();
    release.push_str("Acquire-By-Hash: yes\n");

    for algorithm in RELEASE_ALGORITHMS {
        write!(release, "{algorithm}:\n").unwrap();
        let mut writer = TabWriter::new(vec![]).alignment(Alignment::Right).padding(1);
        for file in files {
            let digest = file.hashes.by_algorithm(algorithm).unwrap_or_default();
            writeln!(writer, " {}\t{}\t{}", digest, file.data.len(), file.rel).unwrap();
        }
        writer.flush().unwrap();
        release.push_str(&String::from_utf8(writer.into_inner().unwrap()).unwrap());
    }
    Ok(release)
}

/// The small `Release` stanza published next to each `Packages` index.
pub fn render_binary_release(archive: &str, component: &str, architecture: &str) -> String {
    format!("Archive: {archive}\nComponent: {component}\nArchitecture: {architecture}\n")
}

/// Parse the per-algorithm file lists of an existing `Release` file into
/// `algorithm -> [(digest, size, path)]`.
pub fn parse_file_lists(release: &str) -> BTreeMap<String, Vec<(String, u64, String)>> {
    let mut lists: BTreeMap<String, Vec<(String, u64, String)>> = BTreeMap::new();
    let mut section: Option<String> = None;
    for line in release.lines() {
        if !line.starts_with(' ') && !line.starts_with('\t') {
            let header = line.trim_end().trim_end_matches(':');
            section = RELEASE_ALGORITHMS
                .iter()
                .find(|algorithm| **algorithm == header)
                .map(|algorithm| algorithm.to_string());
            continue;
        }
        let Some(section) = &section else { continue };
        let mut parts = line.split_whitespace();
        let (Some(digest), Some(size), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let Ok(size) = size.parse() else { continue };
        lists
            .entry(section.clone())
            .or_default()
            .push((digest.to_string(), size, path.to_string()));
    }
    lists
}
