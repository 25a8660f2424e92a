//! Readers for existing repository metadata. Serialisation lives in
//! `record`; these only need to round-trip what the renderers emit plus
//! what createrepo-style tooling produces.

use serde::Deserialize;

use super::record::{Changelog, FileKind, PkgEntry, PkgFile, RpmRecord};
use crate::checksum::ChecksumType;
use crate::error::{Error, Result};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MetadataXml {
    #[serde(rename = "package")]
    packages: Vec<PackageXml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PackageXml {
    #[serde(rename = "@pkgid")]
    pkgid: Option<String>,
    #[serde(rename = "@name")]
    name_attr: Option<String>,
    #[serde(rename = "@arch")]
    arch_attr: Option<String>,
    name: Option<String>,
    arch: Option<String>,
    version: Option<VersionXml>,
    checksum: Option<ChecksumXml>,
    summary: Option<String>,
    description: Option<String>,
    packager: Option<String>,
    url: Option<String>,
    time: Option<TimeXml>,
    size: Option<SizeXml>,
    location: Option<LocationXml>,
    format: Option<FormatXml>,
    #[serde(rename = "file")]
    files: Vec<FileXml>,
    #[serde(rename = "changelog")]
    changelogs: Vec<ChangelogXml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VersionXml {
    #[serde(rename = "@epoch")]
    epoch: Option<String>,
    #[serde(rename = "@ver")]
    ver: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChecksumXml {
    #[serde(rename = "@type")]
    checksum_type: Option<String>,
    #[serde(rename = "$text")]
    value: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TimeXml {
    #[serde(rename = "@file")]
    file: Option<String>,
    #[serde(rename = "@build")]
    build: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SizeXml {
    #[serde(rename = "@package")]
    package: Option<String>,
    #[serde(rename = "@installed")]
    installed: Option<String>,
    #[serde(rename = "@archive")]
    archive: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LocationXml {
    #[serde(rename = "@href")]
    href: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FormatXml {
    #[serde(rename = "license")]
    license: Option<String>,
    #[serde(rename = "vendor")]
    vendor: Option<String>,
    #[serde(rename = "group")]
    group: Option<String>,
    #[serde(rename = "buildhost")]
    buildhost: Option<String>,
    #[serde(rename = "sourcerpm")]
    sourcerpm: Option<String>,
    #[serde(rename = "provides")]
    provides: Option<EntriesXml>,
    #[serde(rename = "requires")]
    requires: Option<EntriesXml>,
    #[serde(rename = "conflicts")]
    conflicts: Option<EntriesXml>,
    #[serde(rename = "obsoletes")]
    obsoletes: Option<EntriesXml>,
    #[serde(rename = "file")]
    files: Vec<FileXml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EntriesXml {
    #[serde(rename = "entry")]
    entries: Vec<EntryXml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EntryXml {
    #[serde(rename = "@name")]
    name: Option<String>,
    #[serde(rename = "@flags")]
    flags: Option<String>,
    #[serde(rename = "@epoch")]
    epoch: Option<String>,
    #[serde(rename = "@ver")]
    ver: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
    #[serde(rename = "@pre")]
    pre: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileXml {
    #[serde(rename = "@type")]
    kind: Option<String>,
    #[serde(rename = "$text")]
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChangelogXml {
    #[serde(rename = "@author")]
    author: Option<String>,
    #[serde(rename = "@date")]
    date: Option<String>,
    #[serde(rename = "$text")]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RepomdXml {
    #[serde(rename = "data")]
    data: Vec<RepomdDataXml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RepomdDataXml {
    #[serde(rename = "@type")]
    record_type: Option<String>,
    location: Option<LocationXml>,
}

fn number(value: &Option<String>) -> u64 {
    value
        .as_deref()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default()
}

fn text(value: Option<String>) -> String {
    value.unwrap_or_default()
}

fn convert_entries(entries: Option<EntriesXml>) -> Vec<PkgEntry> {
    entries
        .map(|wrapper| wrapper.entries)
        .unwrap_or_default()
        .into_iter()
        .map(|entry| PkgEntry {
            name: text(entry.name),
            epoch: entry.epoch.as_deref().and_then(|raw| raw.parse().ok()),
            version: entry.ver,
            release: entry.rel,
            pre: entry.pre.as_deref() == Some("1"),
            flags: entry.flags,
        })
        .collect()
}

fn convert_files(files: Vec<FileXml>) -> Vec<PkgFile> {
    files
        .into_iter()
        .filter_map(|file| {
            let path = file.path?;
            let kind = match file.kind.as_deref() {
                Some("dir") => FileKind::Dir,
                Some("ghost") => FileKind::Ghost,
                _ => FileKind::File,
            };
            Some(PkgFile { path, kind })
        })
        .collect()
}

fn convert_version(record: &mut RpmRecord, version: Option<VersionXml>) {
    if let Some(version) = version {
        record.epoch = version
            .epoch
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default();
        record.version = text(version.ver);
        record.release = text(version.rel);
    }
}

fn parse<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
    let content = String::from_utf8_lossy(data);
    quick_xml::de::from_str(&content).map_err(Error::metadata)
}

/// Parse a primary index back into package records.
pub fn parse_primary(data: &[u8]) -> Result<Vec<RpmRecord>> {
    let document: MetadataXml = parse(data)?;
    Ok(document
        .packages
        .into_iter()
        .map(|package| {
            let mut record = RpmRecord {
                name: text(package.name),
                arch: text(package.arch),
                summary: text(package.summary),
                description: text(package.description),
                packager: text(package.packager),
                url: text(package.url),
                ..RpmRecord::default()
            };
            convert_version(&mut record, package.version);
            if let Some(checksum) = package.checksum {
                record.checksum = text(checksum.value);
                record.checksum_type = checksum
                    .checksum_type
                    .as_deref()
                    .and_then(|name| ChecksumType::from_name(name).ok());
            }
            if let Some(time) = package.time {
                record.time_file = number(&time.file);
                record.time_build = number(&time.build);
            }
            if let Some(size) = package.size {
                record.size_package = number(&size.package);
                record.size_installed = number(&size.installed);
                record.size_archive = size.archive.as_deref().and_then(|raw| raw.parse().ok());
            }
            if let Some(location) = package.location {
                record.location_href = text(location.href);
            }
            if let Some(format) = package.format {
                record.license = text(format.license);
                record.vendor = text(format.vendor);
                record.group = text(format.group);
                record.buildhost = text(format.buildhost);
                record.sourcerpm = text(format.sourcerpm);
                record.provides = convert_entries(format.provides);
                record.requires = convert_entries(format.requires);
                record.conflicts = convert_entries(format.conflicts);
                record.obsoletes = convert_entries(format.obsoletes);
                record.files = convert_files(format.files);
            }
            record
        })
        .collect())
}

/// Parse a filelists index back into package records.
pub fn parse_filelists(data: &[u8]) -> Result<Vec<RpmRecord>> {
    let document: MetadataXml = parse(data)?;
    Ok(document
        .packages
        .into_iter()
        .map(|package| {
            let mut record = RpmRecord {
                name: text(package.name_attr),
                arch: text(package.arch_attr),
                checksum: text(package.pkgid),
                files: convert_files(package.files),
                ..RpmRecord::default()
            };
            convert_version(&mut record, package.version);
            record
        })
        .collect())
}

/// Parse an other (changelog) index back into package records.
pub fn parse_other(data: &[u8]) -> Result<Vec<RpmRecord>> {
    let document: MetadataXml = parse(data)?;
    Ok(document
        .packages
        .into_iter()
        .map(|package| {
            let mut record = RpmRecord {
                name: text(package.name_attr),
                arch: text(package.arch_attr),
                checksum: text(package.pkgid),
                changelogs: package
                    .changelogs
                    .into_iter()
                    .map(|changelog| Changelog {
                        author: text(changelog.author),
                        date: number(&changelog.date),
                        text: text(changelog.text),
                    })
                    .collect(),
                ..RpmRecord::default()
            };
            convert_version(&mut record, package.version);
            record
        })
        .collect())
}

/// Parse `repomd.xml` into `(record type, location href)` pairs.
pub fn parse_repomd(data: &[u8]) -> Result<Vec<(String, String)>> {
    let document: RepomdXml = parse(data)?;
    Ok(document
        .data
        .into_iter()
        .filter_map(|record| {
            let href = record.location.and_then(|location| location.href)?;
            Some((record.record_type.unwrap_or_default(), href))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::repository::rpm::record::{RecordType, render, tests::sample_record};

    #[test]
    fn primary_round_trips_through_the_renderer() {
        let record = sample_record();
        let xml = render(RecordType::Primary, &[Arc::new(record.clone())]);
        let parsed = parse_primary(xml.as_bytes()).unwrap();
        assert_eq!(parsed.len(), 1);
        let loaded = &parsed[0];
        assert_eq!(loaded.nvra(), record.nvra());
        assert_eq!(loaded.checksum, record.checksum);
        assert_eq!(loaded.checksum_type, record.checksum_type);
        assert_eq!(loaded.summary, record.summary);
        assert_eq!(loaded.description, record.description);
        assert_eq!(loaded.location_href, record.location_href);
        assert_eq!(loaded.size_package, record.size_package);
        assert_eq!(loaded.time_build, record.time_build);
        assert_eq!(loaded.license, record.license);
        assert_eq!(loaded.provides.len(), 1);
        assert_eq!(loaded.provides[0].flags.as_deref(), Some("EQ"));
        assert_eq!(loaded.provides[0].version.as_deref(), Some("8.6"));
        assert_eq!(loaded.requires.len(), 1);
        assert_eq!(loaded.requires[0].name, "bash");
        assert_eq!(loaded.files.len(), 1, "only primary files are listed");
    }

    #[test]
    fn filelists_round_trips_through_the_renderer() {
        let record = sample_record();
        let xml = render(RecordType::Filelists, &[Arc::new(record.clone())]);
        let parsed = parse_filelists(xml.as_bytes()).unwrap();
        assert_eq!(parsed.len(), 1);
        let loaded = &parsed[0];
        assert_eq!(loaded.nvra(), record.nvra());
        assert_eq!(loaded.checksum, record.checksum);
        assert_eq!(loaded.files.len(), 2);
        assert_eq!(loaded.files[1].kind, FileKind::Dir);
    }

    #[test]
    fn other_round_trips_through_the_renderer() {
        let record = sample_record();
        let xml = render(RecordType::Other, &[Arc::new(record.clone())]);
        let parsed = parse_other(xml.as_bytes()).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].changelogs.len(), 1);
        assert_eq!(parsed[0].changelogs[0].date, 1_640_000_000);
        assert_eq!(parsed[0].changelogs[0].text, "- roll 8.6 release & notes");
    }

    #[test]
    fn repomd_record_listing() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<repomd xmlns="http://linux.duke.edu/metadata/repo">
  <revision>1650000000</revision>
  <data type="primary">
    <checksum type="sha256">aa</checksum>
    <location href="repodata/aa-primary.xml.gz"/>
  </data>
  <data type="primary_db">
    <location href="repodata/bb-primary.sqlite.bz2"/>
  </data>
</repomd>
"#;
        let records = parse_repomd(xml.as_bytes()).unwrap();
        assert_eq!(
            records,
            vec![
                (
                    "primary".to_string(),
                    "repodata/aa-primary.xml.gz".to_string()
                ),
                (
                    "primary_db".to_string(),
                    "repodata/bb-primary.sqlite.bz2".to_string()
                ),
            ]
        );
    }
}
