use std::path::{Path, PathBuf};

use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::process;

/// Process-wide GPG configuration, read once at startup.
#[derive(Clone, Debug, Default)]
pub struct GpgConfig {
    /// Overridden `gpg` binary path; defaults to `gpg` on `$PATH`.
    pub executable: Option<String>,
    /// Path to the private key used to sign packages and metadata.
    pub private_key: Option<PathBuf>,
    /// Passphrase for the private key.
    pub password: Option<String>,
}

impl GpgConfig {
    pub fn from_env() -> Self {
        GpgConfig {
            executable: std::env::var("GPG_EXECUTABLE").ok(),
            private_key: std::env::var("GPG_PRIVATE_KEY").ok().map(PathBuf::from),
            password: std::env::var("GPG_PASSWORD").ok(),
        }
    }
}

const GPG_BASE_ARGS: [&str; 6] = [
    "--batch",
    "--no-tty",
    "--status-fd",
    "1",
    "--yes",
    "--with-colons",
];

/// Stored in various places depending on the OS, and generally not on
/// `$PATH`.
const PRESET_PASSPHRASE_CANDIDATES: [&str; 3] = [
    "/usr/lib/gnupg/gpg-preset-passphrase",
    "/usr/libexec/gpg-preset-passphrase",
    "gpg-preset-passphrase",
];

/// Discovered once per process; the agent is started alongside it.
static PRESET_PASSPHRASE: OnceCell<String> = OnceCell::const_new();

#[derive(Debug, PartialEq, Eq)]
struct KeyInfo {
    keygrip: String,
    fingerprint: String,
    user_id: String,
}

/// An ephemeral signing session against a headless GPG agent.
///
/// Opening a session imports the private key (presetting its passphrase
/// in the agent when one is supplied) and exports the public half into
/// the scratch directory. Closing with `clear` set removes both halves
/// from the keyring again.
pub struct GpgSession {
    executable: String,
    user_id: String,
    fingerprint: String,
    public_key: PathBuf,
    cwd: PathBuf,
    verify: bool,
    clear: bool,
}

impl GpgSession {
    #[instrument(skip(config, password))]
    pub async fn open(
        config: &GpgConfig,
        key: &Path,
        password: Option<&str>,
        verify: bool,
        clear: bool,
        scratch: &Path,
    ) -> Result<Self> {
        let executable = config.executable.clone().unwrap_or_else(|| "gpg".to_string());
        let key = key
            .to_str()
            .ok_or_else(|| Error::config("GPG private key path is not valid UTF-8"))?;

        let listing = gpg_exec(
            &executable,
            scratch,
            &[
                "--with-keygrip",
                "--import-options",
                "show-only",
                "--import",
                key,
            ],
            None,
        )
        .await?;
        let info = parse_key_info(&listing)?;
        debug!(user_id = %info.user_id, fingerprint = %info.fingerprint, "loaded signing key");

        if let Some(password) = password {
            preset_passphrase(&info.keygrip, password, scratch).await?;
        }

        gpg_exec(&executable, scratch, &["--import", key], None).await?;
        let public_key_data = gpg_exec(
            &executable,
            scratch,
            &["--armor", "--export", &info.user_id],
            None,
        )
        .await?;
        let public_key = scratch.join(format!("{}.pub", info.user_id));
        tokio::fs::write(&public_key, public_key_data).await?;

        Ok(GpgSession {
            executable,
            user_id: info.user_id,
            fingerprint: info.fingerprint,
            public_key,
            cwd: scratch.to_path_buf(),
            verify,
            clear,
        })
    }

    /// Declared signing identity.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Exported public key in the scratch directory.
    pub fn public_key(&self) -> &Path {
        &self.public_key
    }

    /// Whether produced signatures are verified before being accepted.
    pub fn verify(&self) -> bool {
        self.verify
    }

    async fn exec(&self, args: &[&str]) -> Result<Vec<u8>> {
        gpg_exec(&self.executable, &self.cwd, args, None).await
    }

    /// Write an armored detached signature next to `relpath` and return
    /// the signature's scratch-relative path.
    pub async fn sign_detached(&self, relpath: &str) -> Result<String> {
        self.exec(&[
            "--default-key",
            &self.user_id,
            "--detach-sign",
            "--armor",
            relpath,
        ])
        .await?;
        let signature = format!("{relpath}.asc");
        if self.verify {
            self.verify_signature(&signature, Some(relpath)).await?;
        }
        Ok(signature)
    }

    /// Write an armored detached signature of `src` at `dst`.
    pub async fn sign_detached_to(&self, src: &str, dst: &str) -> Result<()> {
        self.exec(&[
            "--default-key",
            &self.user_id,
            "--output",
            dst,
            "--detach-sign",
            "--armor",
            src,
        ])
        .await?;
        if self.verify {
            self.verify_signature(dst, Some(src)).await?;
        }
        Ok(())
    }

    /// Write a cleartext-signed copy of `src` at `dst`.
    pub async fn sign_cleartext(&self, src: &str, dst: &str) -> Result<()> {
        self.exec(&[
            "--default-key",
            &self.user_id,
            "--output",
            dst,
            "--clearsign",
            src,
        ])
        .await?;
        if self.verify {
            self.verify_signature(dst, None).await?;
        }
        Ok(())
    }

    async fn verify_signature(&self, signature: &str, signed: Option<&str>) -> Result<()> {
        let mut args = vec!["--verify", signature];
        if let Some(signed) = signed {
            args.push(signed);
        }
        self.exec(&args).await.map_err(|err| match err {
            Error::Command { .. } => Error::Verification(signature.to_string()),
            other => other,
        })?;
        Ok(())
    }

    /// Tear the session down, deleting the key material from the keyring
    /// when the transaction asked for it.
    pub async fn close(&self) -> Result<()> {
        if !self.clear {
            return Ok(());
        }
        self.exec(&["--delete-secret-key", &self.fingerprint])
            .await?;
        self.exec(&["--delete-key", &self.fingerprint]).await?;
        Ok(())
    }
}

async fn gpg_exec(
    executable: &str,
    cwd: &Path,
    args: &[&str],
    stdin: Option<&str>,
) -> Result<Vec<u8>> {
    let mut argv: Vec<&str> = vec![executable];
    argv.extend_from_slice(&GPG_BASE_ARGS);
    argv.extend_from_slice(args);
    process::run(&argv, cwd, stdin, true).await.map_err(|err| {
        if matches!(&err, Error::Config(message) if message.contains("executable not found")) {
            Error::config(format!(
                "GnuPG v2 is required (looked for `{executable}`); set GPG_EXECUTABLE to \
                 point at the gpg binary"
            ))
        } else {
            err
        }
    })
}

/// Preset the key passphrase in the GPG agent, starting the agent with
/// preset support if it is not already running.
async fn preset_passphrase(keygrip: &str, password: &str, cwd: &Path) -> Result<()> {
    let preset = PRESET_PASSPHRASE
        .get_or_try_init(|| async {
            let found = PRESET_PASSPHRASE_CANDIDATES
                .iter()
                .find(|candidate| Path::new(candidate).is_file())
                .map(|candidate| candidate.to_string())
                .ok_or_else(|| {
                    Error::config("unable to find the \"gpg-preset-passphrase\" executable")
                })?;
            process::run(
                &["gpg-agent", "--daemon", "--allow-preset-passphrase"],
                cwd,
                None,
                false,
            )
            .await?;
            Ok::<_, Error>(found)
        })
        .await?;
    process::run(
        &[preset.as_str(), "--preset", keygrip],
        cwd,
        Some(password),
        true,
    )
    .await?;
    Ok(())
}

/// Extract keygrip, fingerprint and user id from a colon-format key
/// listing. The first key found wins.
fn parse_key_info(listing: &[u8]) -> Result<KeyInfo> {
    let text = String::from_utf8_lossy(listing);
    let mut keygrip = None;
    let mut fingerprint = None;
    let mut user_id = None;
    for line in text.lines() {
        let field = |index| line.split(':').nth(index).map(str::to_string);
        if line.starts_with("grp:") {
            keygrip = keygrip.or_else(|| field(9));
        } else if line.starts_with("fpr:") {
            fingerprint = fingerprint.or_else(|| field(9));
        } else if line.starts_with("uid:") {
            user_id = user_id.or_else(|| field(9));
        }
        if keygrip.is_some() && fingerprint.is_some() && user_id.is_some() {
            break;
        }
    }
    match (keygrip, fingerprint, user_id) {
        (Some(keygrip), Some(fingerprint), Some(user_id)) => Ok(KeyInfo {
            keygrip,
            fingerprint,
            user_id,
        }),
        _ => Err(Error::Gpg("unable to find GPG key information".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
sec:-:4096:1:0123456789ABCDEF:1650000000:::u:::scESC:::+:::23::0:
fpr:::::::::AB12CD34EF56AB12CD34EF56AB12CD34EF56AB12:
grp:::::::::0000111122223333444455556666777788889999:
uid:-::::1650000000::DEADBEEF::Test Repository <repo@example.com>::::::::::0:
ssb:-:4096:1:FEDCBA9876543210:1650000000::::::e:::+:::23:
fpr:::::::::9999888877776666555544443333222211110000:
grp:::::::::AAAA0000BBBB1111CCCC2222DDDD3333EEEE4444:
";

    #[test]
    fn parses_first_key_information() {
        let info = parse_key_info(LISTING.as_bytes()).unwrap();
        assert_eq!(
            info,
            KeyInfo {
                keygrip: "0000111122223333444455556666777788889999".to_string(),
                fingerprint: "AB12CD34EF56AB12CD34EF56AB12CD34EF56AB12".to_string(),
                user_id: "Test Repository <repo@example.com>".to_string(),
            }
        );
    }

    #[test]
    fn incomplete_listing_is_an_error() {
        let listing = "fpr:::::::::AB12CD34EF56:\n";
        assert!(matches!(
            parse_key_info(listing.as_bytes()),
            Err(Error::Gpg(_))
        ));
    }
}
