use std::path::Path;

use md5::Md5;
use repofresh::Error;
use repofresh::repository::{Config, Repository, RepositoryOptions, Variables, get_repository};
use sha2::{Digest as _, Sha256};

use crate::fixtures::{
    bucket_key, build_deb, deb_config, gunzip, release_entries, seed, unxz,
};

const PKG: &str = "base-files_11.1+deb11u3_amd64.deb";
const PKG2: &str = "libpam-chroot_0.9-5_amd64.deb";

fn base_files_deb() -> Vec<u8> {
    build_deb(
        "base-files",
        "11.1+deb11u3",
        "amd64",
        "admin",
        "Debian base system miscellaneous files",
        &[
            ("./usr/lib/os-release", b"PRETTY_NAME=test".as_slice()),
            ("./usr/share/base-files/motd", b"".as_slice()),
        ],
    )
}

fn libpam_deb() -> Vec<u8> {
    build_deb(
        "libpam-chroot",
        "0.9-5",
        "amd64",
        "devel",
        "Chroot PAM module",
        &[(
            "./lib/x86_64-linux-gnu/pam_chroot.so",
            b"\x7fELF".as_slice(),
        )],
    )
}

async fn open(config: &Config, filename: &str) -> Repository {
    get_repository(
        filename,
        &Variables::new(),
        config,
        RepositoryOptions::default(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn initialize_empty_repository() {
    let root = tempfile::TempDir::new().unwrap();
    let config = deb_config(root.path(), "stable", "bullseye", "main");

    let repo = open(&config, PKG).await;
    repo.close().await.unwrap();

    let dists = root.path().join("repo/dists/bullseye");
    assert!(dists.join("InRelease").is_file());
    assert!(dists.join("Release").is_file());
    assert!(dists.join("main/binary-amd64/Release").is_file());

    let release = std::fs::read(dists.join("Release")).unwrap();
    assert_eq!(release, std::fs::read(dists.join("InRelease")).unwrap());
    let release = String::from_utf8(release).unwrap();
    assert!(release.contains("Suite: stable\n"));
    assert!(release.contains("Codename: bullseye\n"));
    assert!(release.contains("Components: main\n"));
    assert!(release.contains("Architectures: amd64\n"));
    assert!(release.contains("Acquire-By-Hash: yes\n"));
    assert!(release.contains("Date: "));

    // A later transaction for another component and architecture keeps
    // the existing pair.
    let config = deb_config(root.path(), "stable", "bullseye", "testing");
    let repo = open(&config, "base-files_11.1+deb11u3_arm64.deb").await;
    repo.close().await.unwrap();

    assert!(dists.join("main/binary-amd64/Release").is_file());
    assert!(dists.join("testing/binary-arm64/Release").is_file());
    let release = std::fs::read_to_string(dists.join("Release")).unwrap();
    assert!(release.contains("Components: main testing\n"));
    assert!(release.contains("Architectures: amd64 arm64\n"));
}

#[test_log::test(tokio::test)]
async fn add_publishes_consistent_indices() {
    let root = tempfile::TempDir::new().unwrap();
    let config = deb_config(root.path(), "stable", "stable", "main");
    let dists = root.path().join("repo/dists/stable");

    let base_files = base_files_deb();
    let incoming = root.path().join("incoming").join(PKG);
    seed(&incoming, &base_files);
    let pool2 = root
        .path()
        .join("repo/pool/main/libp/libpam-chroot")
        .join(PKG2);
    let libpam = libpam_deb();
    seed(&pool2, &libpam);

    let mut repo = open(&config, &bucket_key(&incoming)).await;
    repo.add(&bucket_key(&incoming), true).await.unwrap();
    repo.add(&bucket_key(&pool2), true).await.unwrap();
    let summary = repo.close().await.unwrap();

    // Pool placement: moved for the incoming file, in place for the
    // pre-positioned one.
    let pool1 = root.path().join("repo/pool/main/b/base-files").join(PKG);
    assert!(pool1.is_file());
    assert!(!incoming.exists());
    assert!(pool2.is_file());

    // The plain and compressed Packages indices agree.
    let binary = dists.join("main/binary-amd64");
    let packages = std::fs::read(binary.join("Packages")).unwrap();
    assert_eq!(
        packages,
        gunzip(&std::fs::read(binary.join("Packages.gz")).unwrap())
    );
    assert_eq!(
        packages,
        unxz(&std::fs::read(binary.join("Packages.xz")).unwrap())
    );
    let packages = String::from_utf8(packages).unwrap();
    assert!(packages.starts_with("Package: "));
    assert!(packages.contains("Package: base-files\n"));
    assert!(packages.contains("Package: libpam-chroot\n"));
    assert!(packages.contains("Version: 11.1+deb11u3\n"));
    assert!(packages.contains("Architecture: amd64\n"));
    assert!(packages.contains(&format!("Filename: pool/main/b/base-files/{PKG}\n")));
    assert!(packages.contains("Size: "));
    assert!(packages.contains(&format!("MD5sum: {}\n", hex::encode(Md5::digest(&base_files)))));
    assert!(packages.contains(&format!(
        "SHA256: {}\n",
        hex::encode(Sha256::digest(&base_files))
    )));

    // Contents entries carry section-qualified package names.
    let contents = String::from_utf8(gunzip(
        &std::fs::read(dists.join("main/Contents-amd64.gz")).unwrap(),
    ))
    .unwrap();
    assert!(contents.contains("usr/lib/os-release admin/base-files\n"));
    assert!(contents.contains("usr/share/base-files/motd admin/base-files\n"));
    assert!(contents.contains("lib/x86_64-linux-gnu/pam_chroot.so devel/libpam-chroot\n"));

    // Every Release entry resolves, matches its declared size and
    // digest, and has an identical by-hash twin.
    let release = std::fs::read_to_string(dists.join("Release")).unwrap();
    let entries = release_entries(&release);
    assert!(!entries.is_empty());
    for (algorithm, digest, size, path) in &entries {
        let plain = std::fs::read(dists.join(path)).unwrap();
        assert_eq!(plain.len() as u64, *size, "{path} size");
        let computed = match algorithm.as_str() {
            "MD5Sum" => hex::encode(Md5::digest(&plain)),
            "SHA256" => hex::encode(Sha256::digest(&plain)),
            _ => continue,
        };
        assert_eq!(&computed, digest, "{path} {algorithm}");

        let parent = Path::new(path).parent().unwrap_or(Path::new(""));
        let by_hash = dists.join(parent).join("by-hash").join(algorithm).join(digest);
        assert!(by_hash.is_file(), "missing by-hash twin of {path}");
        assert_eq!(std::fs::read(by_hash).unwrap(), plain);
        let rel = format!(
            "dists/stable/{}",
            parent.join("by-hash").join(algorithm).join(digest).display()
        );
        assert!(summary.modified.contains(&rel), "{rel} not marked modified");
    }
}

#[tokio::test]
async fn duplicate_add_is_rejected_across_transactions() {
    let root = tempfile::TempDir::new().unwrap();
    let config = deb_config(root.path(), "stable", "stable", "main");
    let base_files = base_files_deb();
    let incoming = root.path().join("incoming").join(PKG);
    seed(&incoming, &base_files);

    let mut repo = open(&config, &bucket_key(&incoming)).await;
    repo.add(&bucket_key(&incoming), true).await.unwrap();
    repo.close().await.unwrap();
    let pool = root.path().join("repo/pool/main/b/base-files").join(PKG);
    assert!(pool.is_file());

    // Re-adding after a reload fails and removes the stray source copy.
    seed(&incoming, &base_files);
    let mut repo = open(&config, &bucket_key(&incoming)).await;
    let err = repo.add(&bucket_key(&incoming), true).await.unwrap_err();
    assert!(matches!(err, Error::PackageAlreadyExists(_)));
    repo.close().await.unwrap();
    assert!(pool.is_file());
    assert!(!incoming.exists());

    // Re-adding the pool copy in place also fails, without deleting it.
    let mut repo = open(&config, &bucket_key(&pool)).await;
    let err = repo.add(&bucket_key(&pool), true).await.unwrap_err();
    assert!(matches!(err, Error::PackageAlreadyExists(_)));
    repo.close().await.unwrap();
    assert!(pool.is_file());
}

#[tokio::test]
async fn unchanged_repository_publishes_nothing() {
    let root = tempfile::TempDir::new().unwrap();
    let config = deb_config(root.path(), "stable", "stable", "main");
    let incoming = root.path().join("incoming").join(PKG);
    seed(&incoming, &base_files_deb());

    let mut repo = open(&config, &bucket_key(&incoming)).await;
    repo.add(&bucket_key(&incoming), true).await.unwrap();
    repo.close().await.unwrap();

    let repo = open(&config, PKG).await;
    let summary = repo.close().await.unwrap();
    assert!(summary.modified.is_empty());
    assert!(summary.removed.is_empty());
}

#[tokio::test]
async fn remove_retires_the_package_everywhere() {
    let root = tempfile::TempDir::new().unwrap();
    let config = deb_config(root.path(), "stable", "stable", "main");
    let dists = root.path().join("repo/dists/stable");

    let incoming = root.path().join("incoming").join(PKG);
    seed(&incoming, &base_files_deb());
    let incoming2 = root.path().join("incoming").join(PKG2);
    seed(&incoming2, &libpam_deb());

    let mut repo = open(&config, &bucket_key(&incoming)).await;
    repo.add(&bucket_key(&incoming), true).await.unwrap();
    repo.add(&bucket_key(&incoming2), true).await.unwrap();
    repo.close().await.unwrap();
    let before = std::fs::read_to_string(dists.join("Release")).unwrap();

    let mut repo = open(&config, PKG).await;
    repo.remove(PKG).await.unwrap();
    repo.close().await.unwrap();

    // Pool file and index entries are gone; the other package stays.
    assert!(!root.path().join("repo/pool/main/b/base-files").join(PKG).exists());
    assert!(root
        .path()
        .join("repo/pool/main/libp/libpam-chroot")
        .join(PKG2)
        .is_file());
    let packages = String::from_utf8(gunzip(
        &std::fs::read(dists.join("main/binary-amd64/Packages.gz")).unwrap(),
    ))
    .unwrap();
    assert!(!packages.contains("Package: base-files\n"));
    assert!(packages.contains("Package: libpam-chroot\n"));
    let contents = String::from_utf8(gunzip(
        &std::fs::read(dists.join("main/Contents-amd64.gz")).unwrap(),
    ))
    .unwrap();
    assert!(!contents.contains("base-files"));
    assert!(contents.contains("lib/x86_64-linux-gnu/pam_chroot.so devel/libpam-chroot\n"));

    // by-hash copies of the indices that changed are retired; the
    // unchanged per-architecture Release keeps its twin.
    for (algorithm, digest, _, path) in release_entries(&before) {
        let parent = Path::new(&path).parent().unwrap_or(Path::new(""));
        let by_hash = dists
            .join(parent)
            .join("by-hash")
            .join(&algorithm)
            .join(&digest);
        if path.contains("Packages") || path.contains("Contents") {
            assert!(!by_hash.exists(), "stale by-hash {path} survived");
        } else {
            assert!(by_hash.is_file(), "unchanged by-hash {path} was deleted");
        }
    }
}
