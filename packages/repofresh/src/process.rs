use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt as _;
use tracing::debug;

use crate::error::{Error, Result};

/// Execute `argv` with the working directory pinned to `cwd`.
///
/// The command is spawned directly, never through a shell. Stdout and
/// stderr are captured; `stdin` is written to the child before waiting.
/// When `check` is set, a non-zero exit status becomes an error carrying
/// the argv, the exit code and the captured stderr.
pub async fn run<S: AsRef<str>>(
    argv: &[S],
    cwd: &Path,
    stdin: Option<&str>,
    check: bool,
) -> Result<Vec<u8>> {
    let argv: Vec<&str> = argv.iter().map(|part| part.as_ref()).collect();
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::config("empty command line"))?;
    debug!(command = ?argv, cwd = %cwd.display(), "running command");

    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::config(format!("executable not found: {program}"))
        } else {
            Error::Io(err)
        }
    })?;

    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input.as_bytes()).await?;
        }
    }

    let output = child.wait_with_output().await?;
    if check && !output.status.success() {
        return Err(Error::Command {
            command: argv.iter().map(|part| part.to_string()).collect(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = run(&["echo", "hello"], Path::new("/"), None, true)
            .await
            .unwrap();
        assert_eq!(out, b"hello\n");
    }

    #[tokio::test]
    async fn passes_stdin_through() {
        let out = run(&["cat"], Path::new("/"), Some("stdin contents"), true)
            .await
            .unwrap();
        assert_eq!(out, b"stdin contents");
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error_when_checked() {
        let err = run(&["false"], Path::new("/"), None, true)
            .await
            .unwrap_err();
        match err {
            Error::Command {
                command, status, ..
            } => {
                assert_eq!(command, vec!["false".to_string()]);
                assert_ne!(status, 0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_is_ignored_when_unchecked() {
        run(&["false"], Path::new("/"), None, false).await.unwrap();
    }

    #[tokio::test]
    async fn missing_binary_names_the_program() {
        let err = run(&["repofresh-no-such-binary"], Path::new("/"), None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(message) if message.contains("repofresh-no-such-binary")));
    }
}
