//! The optional external status helper, grounded on `status-cmd.c`: spawns
//! a configured command and forwards each line of its stdout verbatim as a
//! STATUS_UPDATE payload, for boards whose telemetry comes from a script
//! rather than one of the built-in parsers.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::backends::StatusSink;
use crate::error::BackendError;

pub fn spawn(command_line: &str, sink: StatusSink) -> Result<JoinHandle<()>, BackendError> {
    let mut parts = command_line.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| BackendError::Open("status-cmd is empty".into()))?;

    let mut child = Command::new(program)
        .args(parts)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit())
        .spawn()
        .map_err(BackendError::Io)?;

    let stdout = child.stdout.take().expect("stdout was piped");
    Ok(tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if sink.send(line).is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
        let _ = child.wait().await;
    }))
}
