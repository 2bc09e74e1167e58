use std::{
    ffi::OsStr,
    future::Future,
    path::Path,
    process::{ExitStatus, Stdio},
};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::mpsc,
};

use crate::error::{KeelError, KeelResult};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stderr followed by stdout, the way failures are reported to users.
    pub fn combined(&self) -> String {
        let mut out = self.stderr.trim_end().to_string();
        let stdout = self.stdout.trim_end();
        if !stdout.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(stdout);
        }
        out
    }
}

/// Runs a command to completion, capturing its output. A non-zero exit is not an error here.
pub async fn run_captured<I, S>(
    program: &str,
    args: I,
    dir: Option<&Path>,
    envs: &[(String, String)],
) -> KeelResult<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    for (k, v) in envs {
        cmd.env(k, v);
    }

    let output = cmd
        .output()
        .await
        .map_err(|e| KeelError::FailedToRunUserCommand(format!("{}: {}", program, e)))?;
    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Spawns `cmd`, forwarding each stdout/stderr line to `lines` as it is produced.
///
/// When `stop` completes first the child is killed and `KeelError::Interrupted` is returned.
pub async fn stream_command_output<F>(
    mut cmd: Command,
    lines: mpsc::UnboundedSender<String>,
    stop: F,
) -> KeelResult<ExitStatus>
where
    F: Future<Output = ()>,
{
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| KeelError::FailedToRunUserCommand("stdout is not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| KeelError::FailedToRunUserCommand("stderr is not captured".into()))?;

    let out_tx = lines.clone();
    let stdout_handle = tokio::spawn(async move {
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            let _ = out_tx.send(line);
        }
    });
    let stderr_handle = tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            let _ = lines.send(line);
        }
    });

    tokio::pin!(stop);
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = &mut stop => None,
    };
    let status = match waited {
        Some(status) => status?,
        None => {
            let _ = child.kill().await;
            stdout_handle.abort();
            stderr_handle.abort();
            return Err(KeelError::Interrupted);
        }
    };

    let _ = stdout_handle.await;
    let _ = stderr_handle.await;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn captures_output_and_status() {
        let out = run_captured("sh", ["-c", "echo out; echo err >&2; exit 3"], None, &[])
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.code, Some(3));
        assert_eq!(out.combined(), "err\nout");
    }

    #[tokio::test]
    async fn streams_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo one; echo two"]);
        let status = stream_command_output(cmd, tx, std::future::pending())
            .await
            .unwrap();
        assert!(status.success());
        let mut got = Vec::new();
        while let Ok(line) = rx.try_recv() {
            got.push(line);
        }
        assert_eq!(got, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn stop_kills_the_child() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30"]);
        let res =
            stream_command_output(cmd, tx, tokio::time::sleep(Duration::from_millis(50))).await;
        assert!(matches!(res, Err(KeelError::Interrupted)));
    }
}
