//! Programmatically built package fixtures and storage helpers for the
//! end-to-end scenarios, which run against `file://` storage.

use std::io::{Read as _, Write as _};
use std::path::Path;

use repofresh::repository::Config;
use repofresh::repository::deb::DebConfig;
use repofresh::repository::rpm::RpmConfig;

/// Bucket key of a filesystem path (`file://` storage is rooted at `/`).
pub fn bucket_key(path: &Path) -> String {
    path.to_string_lossy().trim_start_matches('/').to_string()
}

pub fn seed(path: &Path, data: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, data).unwrap();
}

pub fn rpm_config(root: &Path) -> Config {
    Config {
        rpm: RpmConfig {
            base_url: Some(format!("file://{}/$releasever/$basearch", root.display())),
            ..RpmConfig::default()
        },
        ..Config::default()
    }
}

pub fn deb_config(root: &Path, suite: &str, codename: &str, component: &str) -> Config {
    let template = [
        ("url", format!("file://{}/repo", root.display())),
        ("suite", suite.to_string()),
        ("codename", codename.to_string()),
        ("component", component.to_string()),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value))
    .collect();
    Config {
        deb: DebConfig { template },
        ..Config::default()
    }
}

pub fn build_rpm(name: &str, version: &str, release: &str, arch: &str) -> Vec<u8> {
    let package = rpm::PackageBuilder::new(name, version, "MIT", arch, "Test package")
        .release(release)
        .build()
        .unwrap();
    let mut data = Vec::new();
    package.write(&mut data).unwrap();
    data
}

fn tar_member(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut out)
        .unwrap();
    out
}

pub fn unxz(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    xz2::read::XzDecoder::new(data).read_to_end(&mut out).unwrap();
    out
}

pub fn build_deb(
    name: &str,
    version: &str,
    arch: &str,
    section: &str,
    description: &str,
    data_files: &[(&str, &[u8])],
) -> Vec<u8> {
    let control = format!(
        "Package: {name}\nVersion: {version}\nArchitecture: {arch}\nMaintainer: Test \
         <test@example.com>\nSection: {section}\nDescription: {description}\n"
    );
    let control_tar = gzip(&tar_member(&[("./control", control.as_bytes())]));
    let data_tar = gzip(&tar_member(data_files));

    let mut builder = ar::Builder::new(Vec::new());
    builder
        .append(
            &ar::Header::new(b"debian-binary".to_vec(), 4),
            &b"2.0\n"[..],
        )
        .unwrap();
    builder
        .append(
            &ar::Header::new(b"control.tar.gz".to_vec(), control_tar.len() as u64),
            &control_tar[..],
        )
        .unwrap();
    builder
        .append(
            &ar::Header::new(b"data.tar.gz".to_vec(), data_tar.len() as u64),
            &data_tar[..],
        )
        .unwrap();
    builder.into_inner().unwrap()
}

/// Parse the per-algorithm file lists of a `Release` file into
/// `(algorithm, digest, size, path)` rows.
pub fn release_entries(release: &str) -> Vec<(String, String, u64, String)> {
    let mut rows = Vec::new();
    let mut section: Option<String> = None;
    for line in release.lines() {
        if !line.starts_with(' ') {
            let header = line.trim_end().trim_end_matches(':');
            section = ["MD5Sum", "SHA1", "SHA256"]
                .iter()
                .find(|algorithm| **algorithm == header)
                .map(|algorithm| algorithm.to_string());
            continue;
        }
        let Some(algorithm) = &section else { continue };
        let mut parts = line.split_whitespace();
        if let (Some(digest), Some(size), Some(path)) = (parts.next(), parts.next(), parts.next())
        {
            rows.push((
                algorithm.clone(),
                digest.to_string(),
                size.parse().unwrap(),
                path.to_string(),
            ));
        }
    }
    rows
}
