//! Binary package reading: the control stanza and the data-member file
//! list (for `Contents`) out of the `ar` envelope.

use std::io::Read;

use super::deb822::{self, Paragraph};
use crate::error::{Error, Result};

pub struct DebContents {
    pub control: Paragraph,
    pub files: Vec<String>,
}

/// Read the control stanza and data file list out of a `.deb`.
pub fn read(data: &[u8]) -> Result<DebContents> {
    let mut archive = ar::Archive::new(data);
    let mut control: Option<Paragraph> = None;
    let mut files: Option<Vec<String>> = None;
    while let Some(entry) = archive.next_entry() {
        let Ok(entry) = entry else { continue };
        let identifier = entry.header().identifier().to_vec();
        if identifier.starts_with(b"control.tar") {
            control = Some(read_control(member_reader(&identifier, entry)?)?);
        } else if identifier.starts_with(b"data.tar") {
            files = Some(list_files(member_reader(&identifier, entry)?)?);
        }
    }
    let control = control
        .ok_or_else(|| Error::invalid_package("control archive not found or format unsupported"))?;
    let files =
        files.ok_or_else(|| Error::invalid_package("data archive not found or format unsupported"))?;
    Ok(DebContents { control, files })
}

/// Wrap an archive member in the decoder its name calls for.
fn member_reader<'a, R: Read + 'a>(identifier: &[u8], reader: R) -> Result<Box<dyn Read + 'a>> {
    if identifier.ends_with(b".xz") {
        Ok(Box::new(xz2::read::XzDecoder::new(reader)))
    } else if identifier.ends_with(b".gz") {
        Ok(Box::new(flate2::read::GzDecoder::new(reader)))
    } else if identifier.ends_with(b".tar") {
        Ok(Box::new(reader))
    } else {
        Err(Error::invalid_package(format!(
            "unknown member format: {:?}",
            String::from_utf8_lossy(identifier)
        )))
    }
}

fn read_control<R: Read>(reader: R) -> Result<Paragraph> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path_bytes();
        if path.as_ref() == b"./control" || path.as_ref() == b"control" {
            let mut raw = String::new();
            entry.read_to_string(&mut raw)?;
            return deb822::parse_one(&raw);
        }
    }
    Err(Error::invalid_package("could not read control file"))
}

fn list_files<R: Read>(reader: R) -> Result<Vec<String>> {
    let mut archive = tar::Archive::new(reader);
    let mut files = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        if entry.header().entry_type() == tar::EntryType::Directory {
            continue;
        }
        let path = entry.path_bytes();
        let path = String::from_utf8_lossy(path.as_ref())
            .trim_start_matches("./")
            .trim_start_matches('/')
            .to_string();
        if !path.is_empty() {
            files.push(path);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

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

    fn gz(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn build_deb(control: &str, data_files: &[(&str, &[u8])]) -> Vec<u8> {
        let control_tar = gz(&tar_member(&[("./control", control.as_bytes())]));
        let data_tar = gz(&tar_member(data_files));
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

    #[test]
    fn reads_control_and_file_list() {
        let control = "Package: base-files\nVersion: 11.1+deb11u3\nArchitecture: amd64\nSection: admin\nDescription: base files\n";
        let deb = build_deb(
            control,
            &[
                ("./usr/lib/os-release", b"PRETTY_NAME=test".as_slice()),
                ("./usr/share/base-files/motd", b"".as_slice()),
            ],
        );
        let parsed = read(&deb).unwrap();
        assert_eq!(parsed.control.get("Package"), Some("base-files"));
        assert_eq!(parsed.control.get("Version"), Some("11.1+deb11u3"));
        assert_eq!(
            parsed.files,
            vec![
                "usr/lib/os-release".to_string(),
                "usr/share/base-files/motd".to_string(),
            ]
        );
    }

    #[test]
    fn missing_control_member_is_invalid() {
        let data_tar = gz(&tar_member(&[("./usr/bin/tool", b"".as_slice())]));
        let mut builder = ar::Builder::new(Vec::new());
        builder
            .append(
                &ar::Header::new(b"data.tar.gz".to_vec(), data_tar.len() as u64),
                &data_tar[..],
            )
            .unwrap();
        let deb = builder.into_inner().unwrap();
        assert!(matches!(read(&deb), Err(Error::InvalidPackage(_))));
    }
}
