use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use crate::checksum::ChecksumType;
use crate::error::Result;

/// The three per-package metadata streams a repository serialises.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordType {
    Primary,
    Filelists,
    Other,
}

impl RecordType {
    pub fn name(self) -> &'static str {
        match self {
            RecordType::Primary => "primary",
            RecordType::Filelists => "filelists",
            RecordType::Other => "other",
        }
    }
}

pub const PKG_METADATA: [RecordType; 3] =
    [RecordType::Primary, RecordType::Filelists, RecordType::Other];

#[derive(Clone, Debug, Default)]
pub struct PkgEntry {
    pub name: String,
    pub flags: Option<String>,
    pub epoch: Option<u32>,
    pub version: Option<String>,
    pub release: Option<String>,
    pub pre: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Ghost,
}

#[derive(Clone, Debug)]
pub struct PkgFile {
    pub path: String,
    pub kind: FileKind,
}

#[derive(Clone, Debug)]
pub struct Changelog {
    pub author: String,
    pub date: u64,
    pub text: String,
}

/// One package as it appears across the metadata streams.
#[derive(Clone, Debug, Default)]
pub struct RpmRecord {
    pub name: String,
    pub epoch: u32,
    pub version: String,
    pub release: String,
    pub arch: String,
    pub checksum: String,
    pub checksum_type: Option<ChecksumType>,
    pub summary: String,
    pub description: String,
    pub packager: String,
    pub url: String,
    pub time_file: u64,
    pub time_build: u64,
    pub size_package: u64,
    pub size_installed: u64,
    pub size_archive: Option<u64>,
    pub location_href: String,
    pub license: String,
    pub vendor: String,
    pub group: String,
    pub buildhost: String,
    pub sourcerpm: String,
    pub provides: Vec<PkgEntry>,
    pub requires: Vec<PkgEntry>,
    pub conflicts: Vec<PkgEntry>,
    pub obsoletes: Vec<PkgEntry>,
    pub files: Vec<PkgFile>,
    pub changelogs: Vec<Changelog>,
}

impl RpmRecord {
    /// Parse a package file into a record, keyed by the digest of the
    /// file as it will be stored.
    pub fn from_file(path: &Path, checksum_type: ChecksumType) -> Result<Self> {
        let data = std::fs::read(path)?;
        let checksum = checksum_type.digest(&data);
        let time_file = std::fs::metadata(path)?
            .modified()
            .ok()
            .and_then(|modified| modified.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        let package = rpm::Package::parse(&mut &data[..])?;
        let metadata = &package.metadata;

        fn text<T: AsRef<str>>(value: std::result::Result<T, rpm::Error>) -> String {
            value
                .ok()
                .map(|value| value.as_ref().to_string())
                .unwrap_or_default()
        }

        let files = metadata
            .get_file_entries()
            .unwrap_or_default()
            .into_iter()
            .map(|entry| {
                let kind = if entry.flags.contains(rpm::FileFlags::GHOST) {
                    FileKind::Ghost
                } else if matches!(entry.mode, rpm::FileMode::Dir { .. }) {
                    FileKind::Dir
                } else {
                    FileKind::File
                };
                PkgFile {
                    path: entry.path.to_string_lossy().into_owned(),
                    kind,
                }
            })
            .collect();

        let changelogs = metadata
            .get_changelog_entries()
            .unwrap_or_default()
            .into_iter()
            .map(|entry| Changelog {
                author: entry.name,
                date: entry.timestamp,
                text: entry.description,
            })
            .collect();

        Ok(RpmRecord {
            name: metadata.get_name()?.to_string(),
            epoch: metadata.get_epoch().unwrap_or_default(),
            version: metadata.get_version()?.to_string(),
            release: metadata.get_release()?.to_string(),
            arch: metadata.get_arch()?.to_string(),
            checksum,
            checksum_type: Some(checksum_type),
            summary: text(metadata.get_summary()),
            description: text(metadata.get_description()),
            packager: text(metadata.get_packager()),
            url: text(metadata.get_url()),
            time_file,
            time_build: metadata.get_build_time().unwrap_or_default(),
            size_package: data.len() as u64,
            size_installed: metadata.get_installed_size().unwrap_or_default(),
            size_archive: None,
            location_href: String::new(),
            license: text(metadata.get_license()),
            vendor: text(metadata.get_vendor()),
            group: text(metadata.get_group()),
            buildhost: text(metadata.get_build_host()),
            sourcerpm: text(metadata.get_source_rpm()),
            provides: convert_deps(metadata.get_provides().unwrap_or_default()),
            requires: convert_deps(metadata.get_requires().unwrap_or_default()),
            conflicts: convert_deps(metadata.get_conflicts().unwrap_or_default()),
            obsoletes: convert_deps(metadata.get_obsoletes().unwrap_or_default()),
            files,
            changelogs,
        })
    }

    pub fn nvra(&self) -> String {
        format!("{}-{}-{}.{}", self.name, self.version, self.release, self.arch)
    }

    pub fn nevra(&self) -> String {
        format!(
            "{}-{}:{}-{}.{}",
            self.name, self.epoch, self.version, self.release, self.arch
        )
    }
}

fn convert_deps(deps: Vec<rpm::Dependency>) -> Vec<PkgEntry> {
    deps.into_iter()
        .filter(|dep| !dep.name.starts_with("rpmlib("))
        .map(|dep| {
            let pre = dep.flags.intersects(
                rpm::DependencyFlags::PREREQ
                    | rpm::DependencyFlags::SCRIPT_PRE
                    | rpm::DependencyFlags::SCRIPT_POST,
            );
            let flags = sense_flags(dep.flags);
            let (epoch, version, release) = if flags.is_some() && !dep.version.is_empty() {
                parse_evr(&dep.version)
            } else {
                (None, None, None)
            };
            PkgEntry {
                name: dep.name,
                flags,
                epoch,
                version,
                release,
                pre,
            }
        })
        .collect()
}

fn sense_flags(flags: rpm::DependencyFlags) -> Option<String> {
    let less = flags.contains(rpm::DependencyFlags::LESS);
    let greater = flags.contains(rpm::DependencyFlags::GREATER);
    let equal = flags.contains(rpm::DependencyFlags::EQUAL);
    let name = match (less, greater, equal) {
        (true, false, true) => "LE",
        (false, true, true) => "GE",
        (false, false, true) => "EQ",
        (true, false, false) => "LT",
        (false, true, false) => "GT",
        _ => return None,
    };
    Some(name.to_string())
}

/// Split an `[epoch:]version[-release]` dependency version string.
fn parse_evr(evr: &str) -> (Option<u32>, Option<String>, Option<String>) {
    let (epoch, rest) = match evr.split_once(':') {
        Some((epoch, rest)) => (epoch.parse().ok().or(Some(0)), rest),
        None => (Some(0), evr),
    };
    let (version, release) = match rest.rsplit_once('-') {
        Some((version, release)) => (version.to_string(), Some(release.to_string())),
        None => (rest.to_string(), None),
    };
    (epoch, Some(version), release)
}

/// Files listed directly in the primary index.
pub fn is_primary_file(path: &str) -> bool {
    path.starts_with("/etc/") || path.contains("bin/") || path == "/usr/lib/sendmail"
}

pub fn xml_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for character in input.chars() {
        match character {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Serialise one metadata stream for the given records.
pub fn render(record_type: RecordType, records: &[Arc<RpmRecord>]) -> String {
    match record_type {
        RecordType::Primary => render_primary(records),
        RecordType::Filelists => render_filelists(records),
        RecordType::Other => render_other(records),
    }
}

fn render_primary(records: &[Arc<RpmRecord>]) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    write!(
        out,
        "<metadata xmlns=\"http://linux.duke.edu/metadata/common\" \
         xmlns:rpm=\"http://linux.duke.edu/metadata/rpm\" packages=\"{}\">\n",
        records.len()
    )
    .unwrap();
    for record in records {
        render_primary_package(&mut out, record);
    }
    out.push_str("</metadata>\n");
    out
}

fn render_primary_package(out: &mut String, record: &RpmRecord) {
    let checksum_type = record
        .checksum_type
        .map(|checksum| checksum.name())
        .unwrap_or("sha256");
    out.push_str("<package type=\"rpm\">\n");
    write!(out, "  <name>{}</name>\n", xml_escape(&record.name)).unwrap();
    write!(out, "  <arch>{}</arch>\n", xml_escape(&record.arch)).unwrap();
    write!(
        out,
        "  <version epoch=\"{}\" ver=\"{}\" rel=\"{}\"/>\n",
        record.epoch,
        xml_escape(&record.version),
        xml_escape(&record.release)
    )
    .unwrap();
    write!(
        out,
        "  <checksum type=\"{}\" pkgid=\"YES\">{}</checksum>\n",
        checksum_type, record.checksum
    )
    .unwrap();
    write!(out, "  <summary>{}</summary>\n", xml_escape(&record.summary)).unwrap();
    write!(
        out,
        "  <description>{}</description>\n",
        xml_escape(&record.description)
    )
    .unwrap();
    write!(
        out,
        "  <packager>{}</packager>\n",
        xml_escape(&record.packager)
    )
    .unwrap();
    write!(out, "  <url>{}</url>\n", xml_escape(&record.url)).unwrap();
    write!(
        out,
        "  <time file=\"{}\" build=\"{}\"/>\n",
        record.time_file, record.time_build
    )
    .unwrap();
    match record.size_archive {
        Some(archive) => write!(
            out,
            "  <size package=\"{}\" installed=\"{}\" archive=\"{}\"/>\n",
            record.size_package, record.size_installed, archive
        )
        .unwrap(),
        None => write!(
            out,
            "  <size package=\"{}\" installed=\"{}\"/>\n",
            record.size_package, record.size_installed
        )
        .unwrap(),
    }
    write!(
        out,
        "  <location href=\"{}\"/>\n",
        xml_escape(&record.location_href)
    )
    .unwrap();
    out.push_str("  <format>\n");
    write!(
        out,
        "    <rpm:license>{}</rpm:license>\n",
        xml_escape(&record.license)
    )
    .unwrap();
    write!(
        out,
        "    <rpm:vendor>{}</rpm:vendor>\n",
        xml_escape(&record.vendor)
    )
    .unwrap();
    write!(out, "    <rpm:group>{}</rpm:group>\n", xml_escape(&record.group)).unwrap();
    write!(
        out,
        "    <rpm:buildhost>{}</rpm:buildhost>\n",
        xml_escape(&record.buildhost)
    )
    .unwrap();
    write!(
        out,
        "    <rpm:sourcerpm>{}</rpm:sourcerpm>\n",
        xml_escape(&record.sourcerpm)
    )
    .unwrap();
    render_entries(out, "provides", &record.provides);
    render_entries(out, "requires", &record.requires);
    render_entries(out, "conflicts", &record.conflicts);
    render_entries(out, "obsoletes", &record.obsoletes);
    for file in &record.files {
        if !is_primary_file(&file.path) {
            continue;
        }
        match file.kind {
            FileKind::File => {
                write!(out, "    <file>{}</file>\n", xml_escape(&file.path)).unwrap()
            }
            FileKind::Dir => write!(
                out,
                "    <file type=\"dir\">{}</file>\n",
                xml_escape(&file.path)
            )
            .unwrap(),
            FileKind::Ghost => write!(
                out,
                "    <file type=\"ghost\">{}</file>\n",
                xml_escape(&file.path)
            )
            .unwrap(),
        }
    }
    out.push_str("  </format>\n");
    out.push_str("</package>\n");
}

fn render_entries(out: &mut String, kind: &str, entries: &[PkgEntry]) {
    if entries.is_empty() {
        return;
    }
    write!(out, "    <rpm:{kind}>\n").unwrap();
    for entry in entries {
        write!(out, "      <rpm:entry name=\"{}\"", xml_escape(&entry.name)).unwrap();
        if let Some(flags) = &entry.flags {
            write!(out, " flags=\"{flags}\"").unwrap();
            write!(out, " epoch=\"{}\"", entry.epoch.unwrap_or(0)).unwrap();
            if let Some(version) = &entry.version {
                write!(out, " ver=\"{}\"", xml_escape(version)).unwrap();
            }
            if let Some(release) = &entry.release {
                write!(out, " rel=\"{}\"", xml_escape(release)).unwrap();
            }
        }
        if entry.pre {
            out.push_str(" pre=\"1\"");
        }
        out.push_str("/>\n");
    }
    write!(out, "    </rpm:{kind}>\n").unwrap();
}

fn render_filelists(records: &[Arc<RpmRecord>]) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    write!(
        out,
        "<filelists xmlns=\"http://linux.duke.edu/metadata/filelists\" packages=\"{}\">\n",
        records.len()
    )
    .unwrap();
    for record in records {
        render_identity(&mut out, record);
        for file in &record.files {
            match file.kind {
                FileKind::File => {
                    write!(out, "  <file>{}</file>\n", xml_escape(&file.path)).unwrap()
                }
                FileKind::Dir => write!(
                    out,
                    "  <file type=\"dir\">{}</file>\n",
                    xml_escape(&file.path)
                )
                .unwrap(),
                FileKind::Ghost => write!(
                    out,
                    "  <file type=\"ghost\">{}</file>\n",
                    xml_escape(&file.path)
                )
                .unwrap(),
            }
        }
        out.push_str("</package>\n");
    }
    out.push_str("</filelists>\n");
    out
}

fn render_other(records: &[Arc<RpmRecord>]) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    write!(
        out,
        "<otherdata xmlns=\"http://linux.duke.edu/metadata/other\" packages=\"{}\">\n",
        records.len()
    )
    .unwrap();
    for record in records {
        render_identity(&mut out, record);
        for changelog in &record.changelogs {
            write!(
                out,
                "  <changelog author=\"{}\" date=\"{}\">{}</changelog>\n",
                xml_escape(&changelog.author),
                changelog.date,
                xml_escape(&changelog.text)
            )
            .unwrap();
        }
        out.push_str("</package>\n");
    }
    out.push_str("</otherdata>\n");
    out
}

fn render_identity(out: &mut String, record: &RpmRecord) {
    write!(
        out,
        "<package pkgid=\"{}\" name=\"{}\" arch=\"{}\">\n",
        record.checksum,
        xml_escape(&record.name),
        xml_escape(&record.arch)
    )
    .unwrap();
    write!(
        out,
        "  <version epoch=\"{}\" ver=\"{}\" rel=\"{}\"/>\n",
        record.epoch,
        xml_escape(&record.version),
        xml_escape(&record.release)
    )
    .unwrap();
}
