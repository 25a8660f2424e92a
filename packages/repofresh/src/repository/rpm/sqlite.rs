//! SQLite renditions of the metadata streams, matching the schema
//! package managers expect next to the XML files.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{Connection, params};

use super::record::{FileKind, PkgEntry, RecordType, RpmRecord};
use crate::error::Result;

const DB_VERSION: u32 = 10;

/// Write the SQLite form of one metadata stream to `path`.
///
/// `xml_checksum` is the digest of the corresponding uncompressed XML
/// stream; clients use it to pair the database with the XML it mirrors.
pub fn write_database(
    record_type: RecordType,
    path: &Path,
    records: &[Arc<RpmRecord>],
    xml_checksum: &str,
) -> Result<()> {
    let mut connection = Connection::open(path)?;
    let tx = connection.transaction()?;
    match record_type {
        RecordType::Primary => write_primary(&tx, records)?,
        RecordType::Filelists => write_filelists(&tx, records)?,
        RecordType::Other => write_other(&tx, records)?,
    }
    tx.execute_batch("CREATE TABLE db_info (dbversion INTEGER, checksum TEXT)")?;
    tx.execute(
        "INSERT INTO db_info (dbversion, checksum) VALUES (?1, ?2)",
        params![DB_VERSION, xml_checksum],
    )?;
    tx.commit()?;
    Ok(())
}

fn write_primary(tx: &rusqlite::Transaction<'_>, records: &[Arc<RpmRecord>]) -> Result<()> {
    tx.execute_batch(
        "CREATE TABLE packages (
             pkgKey INTEGER PRIMARY KEY,
             pkgId TEXT,
             name TEXT,
             arch TEXT,
             version TEXT,
             epoch TEXT,
             release TEXT,
             summary TEXT,
             description TEXT,
             url TEXT,
             time_file INTEGER,
             time_build INTEGER,
             rpm_license TEXT,
             rpm_vendor TEXT,
             rpm_group TEXT,
             rpm_buildhost TEXT,
             rpm_sourcerpm TEXT,
             rpm_header_start INTEGER,
             rpm_header_end INTEGER,
             rpm_packager TEXT,
             size_package INTEGER,
             size_installed INTEGER,
             size_archive INTEGER,
             location_href TEXT,
             location_base TEXT,
             checksum_type TEXT
         );
         CREATE TABLE provides (name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT, pkgKey INTEGER);
         CREATE TABLE conflicts (name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT, pkgKey INTEGER);
         CREATE TABLE obsoletes (name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT, pkgKey INTEGER);
         CREATE TABLE requires (name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT, pkgKey INTEGER, pre BOOLEAN DEFAULT FALSE);
         CREATE TABLE files (name TEXT, type TEXT, pkgKey INTEGER);",
    )?;
    for (index, record) in records.iter().enumerate() {
        let pkg_key = index as i64 + 1;
        tx.execute(
            "INSERT INTO packages (
                 pkgKey, pkgId, name, arch, version, epoch, release, summary,
                 description, url, time_file, time_build, rpm_license, rpm_vendor,
                 rpm_group, rpm_buildhost, rpm_sourcerpm, rpm_header_start,
                 rpm_header_end, rpm_packager, size_package, size_installed,
                 size_archive, location_href, location_base, checksum_type
             ) VALUES (
                 ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                 ?15, ?16, ?17, NULL, NULL, ?18, ?19, ?20, ?21, ?22, NULL, ?23
             )",
            params![
                pkg_key,
                record.checksum,
                record.name,
                record.arch,
                record.version,
                record.epoch.to_string(),
                record.release,
                record.summary,
                record.description,
                record.url,
                record.time_file as i64,
                record.time_build as i64,
                record.license,
                record.vendor,
                record.group,
                record.buildhost,
                record.sourcerpm,
                record.packager,
                record.size_package as i64,
                record.size_installed as i64,
                record.size_archive.map(|size| size as i64),
                record.location_href,
                record
                    .checksum_type
                    .map(|checksum| checksum.name())
                    .unwrap_or("sha256"),
            ],
        )?;
        insert_entries(tx, "provides", pkg_key, &record.provides, false)?;
        insert_entries(tx, "conflicts", pkg_key, &record.conflicts, false)?;
        insert_entries(tx, "obsoletes", pkg_key, &record.obsoletes, false)?;
        insert_entries(tx, "requires", pkg_key, &record.requires, true)?;
        // The primary stream only carries the lookup-relevant subset of
        // the file list; the full list lives in the filelists stream.
        for file in record
            .files
            .iter()
            .filter(|file| super::record::is_primary_file(&file.path))
        {
            let kind = match file.kind {
                FileKind::File => "file",
                FileKind::Dir => "dir",
                FileKind::Ghost => "ghost",
            };
            tx.execute(
                "INSERT INTO files (name, type, pkgKey) VALUES (?1, ?2, ?3)",
                params![file.path, kind, pkg_key],
            )?;
        }
    }
    Ok(())
}

fn insert_entries(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    pkg_key: i64,
    entries: &[PkgEntry],
    with_pre: bool,
) -> Result<()> {
    for entry in entries {
        if with_pre {
            tx.execute(
                &format!(
                    "INSERT INTO {table} (name, flags, epoch, version, release, pkgKey, pre)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    entry.name,
                    entry.flags,
                    entry.epoch.map(|epoch| epoch.to_string()),
                    entry.version,
                    entry.release,
                    pkg_key,
                    entry.pre,
                ],
            )?;
        } else {
            tx.execute(
                &format!(
                    "INSERT INTO {table} (name, flags, epoch, version, release, pkgKey)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                ),
                params![
                    entry.name,
                    entry.flags,
                    entry.epoch.map(|epoch| epoch.to_string()),
                    entry.version,
                    entry.release,
                    pkg_key,
                ],
            )?;
        }
    }
    Ok(())
}

fn write_filelists(tx: &rusqlite::Transaction<'_>, records: &[Arc<RpmRecord>]) -> Result<()> {
    tx.execute_batch(
        "CREATE TABLE packages (pkgKey INTEGER PRIMARY KEY, pkgId TEXT);
         CREATE TABLE filelist (pkgKey INTEGER, dirname TEXT, filenames TEXT, filetypes TEXT);",
    )?;
    for (index, record) in records.iter().enumerate() {
        let pkg_key = index as i64 + 1;
        tx.execute(
            "INSERT INTO packages (pkgKey, pkgId) VALUES (?1, ?2)",
            params![pkg_key, record.checksum],
        )?;
        for (dirname, (filenames, filetypes)) in group_by_directory(record) {
            tx.execute(
                "INSERT INTO filelist (pkgKey, dirname, filenames, filetypes)
                 VALUES (?1, ?2, ?3, ?4)",
                params![pkg_key, dirname, filenames, filetypes],
            )?;
        }
    }
    Ok(())
}

/// Collapse file entries into per-directory rows: filenames are joined
/// by `/`, filetypes hold one character per file.
fn group_by_directory(
    record: &RpmRecord,
) -> std::collections::BTreeMap<String, (String, String)> {
    let mut directories = std::collections::BTreeMap::<String, (String, String)>::new();
    for file in &record.files {
        let (dirname, filename) = match file.path.rsplit_once('/') {
            Some((dirname, filename)) if !dirname.is_empty() => (dirname, filename),
            _ => ("/", file.path.as_str()),
        };
        let kind = match file.kind {
            FileKind::File => 'f',
            FileKind::Dir => 'd',
            FileKind::Ghost => 'g',
        };
        let entry = directories.entry(dirname.to_string()).or_default();
        if !entry.0.is_empty() {
            entry.0.push('/');
        }
        entry.0.push_str(filename);
        entry.1.push(kind);
    }
    directories
}

fn write_other(tx: &rusqlite::Transaction<'_>, records: &[Arc<RpmRecord>]) -> Result<()> {
    tx.execute_batch(
        "CREATE TABLE packages (pkgKey INTEGER PRIMARY KEY, pkgId TEXT);
         CREATE TABLE changelog (pkgKey INTEGER, author TEXT, date INTEGER, changelog TEXT);",
    )?;
    for (index, record) in records.iter().enumerate() {
        let pkg_key = index as i64 + 1;
        tx.execute(
            "INSERT INTO packages (pkgKey, pkgId) VALUES (?1, ?2)",
            params![pkg_key, record.checksum],
        )?;
        for changelog in &record.changelogs {
            tx.execute(
                "INSERT INTO changelog (pkgKey, author, date, changelog)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    pkg_key,
                    changelog.author,
                    changelog.date as i64,
                    changelog.text
                ],
            )?;
        }
    }
    Ok(())
}
