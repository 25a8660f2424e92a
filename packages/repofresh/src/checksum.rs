use std::io::Write as _;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest as _, Sha256, Sha512};

use crate::error::{Error, Result};

/// Checksum algorithm used in repository metadata.
///
/// The numeric codes accepted by `from_code` follow the createrepo-style
/// convention used by the `RPM_CHECKSUM_TYPE` environment variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl ChecksumType {
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(ChecksumType::Md5),
            3 => Ok(ChecksumType::Sha1),
            5 => Ok(ChecksumType::Sha256),
            7 => Ok(ChecksumType::Sha512),
            other => Err(Error::config(format!("unknown checksum type code: {other}"))),
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "md5" => Ok(ChecksumType::Md5),
            "sha1" => Ok(ChecksumType::Sha1),
            "sha256" => Ok(ChecksumType::Sha256),
            "sha512" => Ok(ChecksumType::Sha512),
            other => Err(Error::Metadata(format!("unknown checksum type: {other}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChecksumType::Md5 => "md5",
            ChecksumType::Sha1 => "sha1",
            ChecksumType::Sha256 => "sha256",
            ChecksumType::Sha512 => "sha512",
        }
    }

    pub fn digest(self, data: &[u8]) -> String {
        match self {
            ChecksumType::Md5 => hex::encode(Md5::digest(data)),
            ChecksumType::Sha1 => hex::encode(Sha1::digest(data)),
            ChecksumType::Sha256 => hex::encode(Sha256::digest(data)),
            ChecksumType::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }
}

/// Compression applied to generated metadata files.
///
/// Numeric codes follow the createrepo-style convention used by the
/// `RPM_COMPRESSION` and `RPM_DB_COMPRESSION` environment variables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Gz,
    Bz2,
    Xz,
}

impl CompressionType {
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            2 => Ok(CompressionType::None),
            3 => Ok(CompressionType::Gz),
            4 => Ok(CompressionType::Bz2),
            5 => Ok(CompressionType::Xz),
            other => Err(Error::config(format!("unknown compression code: {other}"))),
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            CompressionType::None => "",
            CompressionType::Gz => ".gz",
            CompressionType::Bz2 => ".bz2",
            CompressionType::Xz => ".xz",
        }
    }

    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionType::None => Ok(data.to_vec()),
            CompressionType::Gz => {
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            CompressionType::Bz2 => {
                let mut encoder =
                    bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::best());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            CompressionType::Xz => {
                let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
        }
    }
}

/// Decompress `data` based on the extension of the path it was stored at.
pub fn decompress_named(path: &str, data: Vec<u8>) -> Result<Vec<u8>> {
    use std::io::Read as _;

    let mut out = Vec::new();
    if path.ends_with(".gz") {
        flate2::read::GzDecoder::new(&data[..]).read_to_end(&mut out)?;
    } else if path.ends_with(".bz2") {
        bzip2::read::BzDecoder::new(&data[..]).read_to_end(&mut out)?;
    } else if path.ends_with(".xz") {
        xz2::read::XzDecoder::new(&data[..]).read_to_end(&mut out)?;
    } else {
        return Ok(data);
    }
    Ok(out)
}

/// The hash triple every Debian index entry carries.
#[derive(Clone, Debug)]
pub struct Hashes {
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
}

impl Hashes {
    pub fn digest(data: &[u8]) -> Self {
        Hashes {
            md5: hex::encode(Md5::digest(data)),
            sha1: hex::encode(Sha1::digest(data)),
            sha256: hex::encode(Sha256::digest(data)),
        }
    }

    pub fn by_algorithm(&self, algorithm: &str) -> Option<&str> {
        match algorithm {
            "MD5Sum" => Some(&self.md5),
            "SHA1" => Some(&self.sha1),
            "SHA256" => Some(&self.sha256),
            _ => None,
        }
    }
}

/// Algorithm names as they appear in `Release` checksum sections and
/// `by-hash` directory names, in the order they are emitted.
pub const RELEASE_ALGORITHMS: [&str; 3] = ["MD5Sum", "SHA1", "SHA256"];
