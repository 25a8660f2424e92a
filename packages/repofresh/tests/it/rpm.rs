use std::path::Path;

use repofresh::Error;
use repofresh::repository::{Repository, RepositoryOptions, Variables, get_repository};

use crate::fixtures::{bucket_key, build_rpm, gunzip, rpm_config, seed};

const PKG: &str = "centos-stream-release-8.6-1.el8.noarch.rpm";
const PKG_NAME: &str = "centos-stream-release";

async fn open(root: &Path, filename: &str) -> Repository {
    get_repository(
        filename,
        &Variables::new(),
        &rpm_config(root),
        RepositoryOptions::default(),
    )
    .await
    .unwrap()
}

fn metadata_texts(root: &Path) -> Vec<(String, String)> {
    let repodata = root.join("8/noarch/repodata");
    let mut texts = Vec::new();
    for entry in std::fs::read_dir(repodata).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with("-primary.xml.gz")
            || name.ends_with("-filelists.xml.gz")
            || name.ends_with("-other.xml.gz")
        {
            let text =
                String::from_utf8(gunzip(&std::fs::read(entry.path()).unwrap())).unwrap();
            texts.push((name, text));
        }
    }
    texts
}

#[tokio::test]
async fn initialize_empty_repository() {
    let root = tempfile::TempDir::new().unwrap();
    let repo = open(root.path(), PKG).await;
    let summary = repo.close().await.unwrap();

    assert!(root.path().join("8/noarch/repodata/repomd.xml").is_file());
    assert!(summary.modified.contains("repodata/repomd.xml"));
}

#[test_log::test(tokio::test)]
async fn add_then_remove_package() {
    let root = tempfile::TempDir::new().unwrap();
    let data = build_rpm(PKG_NAME, "8.6", "1.el8", "noarch");
    let incoming = root.path().join("incoming").join(PKG);
    seed(&incoming, &data);
    let key = bucket_key(&incoming);

    // Add: the package moves into the repository and every metadata
    // stream references it.
    let mut repo = open(root.path(), &key).await;
    let dst = repo.add(&key, true).await.unwrap();
    assert!(dst.ends_with(&format!("8/noarch/{PKG}")));
    repo.close().await.unwrap();

    let repo_file = root.path().join("8/noarch").join(PKG);
    assert!(repo_file.is_file());
    assert!(!incoming.exists());
    let texts = metadata_texts(root.path());
    assert_eq!(texts.len(), 3);
    for (name, text) in &texts {
        assert!(text.contains(PKG_NAME), "{name} should list the package");
    }

    // Re-running an identical transaction publishes nothing.
    let repo = open(root.path(), PKG).await;
    let summary = repo.close().await.unwrap();
    assert!(summary.modified.is_empty());
    assert!(summary.removed.is_empty());

    // Remove: the package and its index entries are gone.
    let mut repo = open(root.path(), PKG).await;
    repo.remove(PKG).await.unwrap();
    assert!(repo.removed().contains(PKG));
    repo.close().await.unwrap();

    assert!(!repo_file.exists());
    let texts = metadata_texts(root.path());
    assert_eq!(texts.len(), 3);
    for (name, text) in &texts {
        assert!(!text.contains(PKG_NAME), "{name} should no longer list the package");
    }
}

#[tokio::test]
async fn duplicate_add_is_rejected() {
    let root = tempfile::TempDir::new().unwrap();
    let data = build_rpm(PKG_NAME, "8.6", "1.el8", "noarch");
    let incoming = root.path().join("incoming").join(PKG);
    seed(&incoming, &data);
    let key = bucket_key(&incoming);

    let mut repo = open(root.path(), &key).await;
    repo.add(&key, true).await.unwrap();
    repo.close().await.unwrap();
    let repo_file = root.path().join("8/noarch").join(PKG);

    // The indexed package survives a duplicate add; the stray source
    // copy does not.
    seed(&incoming, &data);
    let mut repo = open(root.path(), &key).await;
    let err = repo.add(&key, true).await.unwrap_err();
    assert!(matches!(err, Error::PackageAlreadyExists(_)));
    repo.close().await.unwrap();
    assert!(repo_file.is_file());
    assert!(!incoming.exists());

    // Duplicate add of the in-place repository copy.
    let mut repo = open(root.path(), PKG).await;
    let err = repo.add(&bucket_key(&repo_file), true).await.unwrap_err();
    assert!(matches!(err, Error::PackageAlreadyExists(_)));
    repo.close().await.unwrap();
    assert!(repo_file.is_file());
}

#[tokio::test]
async fn add_can_keep_the_source_object() {
    let root = tempfile::TempDir::new().unwrap();
    let data = build_rpm(PKG_NAME, "8.6", "1.el8", "noarch");
    let incoming = root.path().join("incoming").join(PKG);
    seed(&incoming, &data);
    let key = bucket_key(&incoming);

    let mut repo = open(root.path(), &key).await;
    repo.add(&key, false).await.unwrap();
    repo.close().await.unwrap();

    assert!(incoming.is_file());
    assert!(root.path().join("8/noarch").join(PKG).is_file());
}

#[tokio::test]
async fn filename_must_match_package_metadata() {
    let root = tempfile::TempDir::new().unwrap();
    let data = build_rpm(PKG_NAME, "8.6", "1.el8", "noarch");
    let incoming = root.path().join("incoming").join(PKG);
    seed(&incoming, &data);
    let key = bucket_key(&incoming);

    let mut repo = open(root.path(), &key).await;
    repo.add(&key, true).await.unwrap();
    repo.close().await.unwrap();

    // Same bytes under a name that does not match the parsed NVRA.
    let bad = root.path().join("incoming").join(format!("os{PKG}"));
    seed(&bad, &data);
    let mut repo = open(root.path(), PKG).await;
    let err = repo.add(&bucket_key(&bad), true).await.unwrap_err();
    assert!(matches!(err, Error::InvalidPackage(_)));
    repo.close().await.unwrap();
    assert!(root.path().join("8/noarch").join(PKG).is_file());
}

#[tokio::test]
async fn persistence_round_trip_rejects_readding() {
    let root = tempfile::TempDir::new().unwrap();
    let data = build_rpm(PKG_NAME, "8.6", "1.el8", "noarch");
    let repo_file = root.path().join("8/noarch").join(PKG);
    seed(&repo_file, &data);
    let key = bucket_key(&repo_file);

    // In-place add of a pre-seeded repository file.
    let mut repo = open(root.path(), &key).await;
    repo.add(&key, true).await.unwrap();
    repo.close().await.unwrap();
    assert!(repo_file.is_file());

    // A fresh transaction loads the index back and refuses the re-add.
    let mut repo = open(root.path(), &key).await;
    let err = repo.add(&key, true).await.unwrap_err();
    assert!(matches!(err, Error::PackageAlreadyExists(_)));
    repo.close().await.unwrap();
    assert!(repo_file.is_file());
}
