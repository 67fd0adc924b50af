//! External command execution for the gcloud and linkerd CLIs

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use mitmesh_common::Error;

/// Captured result of a command that ran to completion
pub(crate) struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Run a command, optionally feeding `stdin`, and capture its output.
///
/// Spawn failures are errors; a non-zero exit is reported in
/// [`CommandOutput::success`] so callers can classify stderr.
pub(crate) async fn run(
    cmd: &str,
    args: &[&str],
    stdin: Option<&[u8]>,
) -> Result<CommandOutput, Error> {
    let command_line = format!("{} {}", cmd, args.join(" "));
    debug!(command = %command_line, "running command");

    let mut child = Command::new(cmd)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::command_failed(&command_line, e.to_string()))?;

    // Feed stdin concurrently with draining stdout so large inputs cannot
    // deadlock on a full pipe. Dropping the pipe signals EOF.
    let writer = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.to_vec();
            Some(tokio::spawn(async move { pipe.write_all(&input).await }))
        }
        _ => None,
    };

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| Error::command_failed(&command_line, e.to_string()))?;

    if let Some(writer) = writer {
        match writer.await {
            Ok(Ok(())) => {}
            // The child may exit without reading all of its input
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(Error::command_failed(&command_line, e.to_string())),
            Err(e) => return Err(Error::command_failed(&command_line, e.to_string())),
        }
    }

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        success: output.status.success(),
    })
}

/// Run a command and return stdout, failing on a non-zero exit.
pub(crate) async fn run_checked(
    cmd: &str,
    args: &[&str],
    stdin: Option<&[u8]>,
) -> Result<String, Error> {
    let output = run(cmd, args, stdin).await?;
    if !output.success {
        return Err(Error::command_failed(
            format!("{} {}", cmd, args.join(" ")),
            output.stderr.trim(),
        ));
    }
    Ok(output.stdout)
}
