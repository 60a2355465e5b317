//! External command execution.

use std::ffi::OsStr;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

/// Upper bound on stderr carried inside an error.
const MAX_STDERR_BYTES: usize = 4096;

/// Run `program` with `args`, optionally feeding `stdin`, and return stdout.
///
/// Children are killed if the future is dropped, so an aborted build never
/// leaves a `buildah` process behind.  Arguments are logged; secrets must go
/// through `stdin`.
pub async fn run<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
    stdin: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let program = program.as_ref();
    let program_name = program.to_string_lossy().into_owned();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(
        program = %program_name,
        args = ?args.iter().map(|a| a.as_ref().to_string_lossy()).collect::<Vec<_>>(),
        "executing command"
    );

    let mut child = cmd.spawn().map_err(|e| Error::Command {
        program: program_name.clone(),
        status: "spawn failed".into(),
        stderr: e.to_string(),
    })?;

    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(Error::Command {
            program: program_name,
            status: output.status.to_string(),
            stderr: tail(&output.stderr),
        });
    }

    debug!(program = %program_name, stdout_bytes = output.stdout.len(), "command finished");
    Ok(output.stdout)
}

fn tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(MAX_STDERR_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = run("sh", &["-c", "printf hello"], None).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let out = run("cat", &[] as &[&str], Some(b"piped")).await.unwrap();
        assert_eq!(out, b"piped");
    }

    #[tokio::test]
    async fn failure_carries_stderr() {
        let err = run("sh", &["-c", "echo boom >&2; exit 3"], None)
            .await
            .unwrap_err();
        match err {
            Error::Command { program, stderr, .. } => {
                assert_eq!(program, "sh");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_a_command_error() {
        let err = run("/nonexistent/deltad-test-binary", &[] as &[&str], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
    }
}
