//! external: delegates control operations to an arbitrary helper program,
//! grounded on `drivers/external.c`. Each operation runs the configured
//! helper as `<helper> <board> <verb> [on|off]`, waits for it to exit, and
//! treats a non-zero exit status as failure. The helper's stdout is
//! redirected to the agent's stderr so it ends up in the same log stream as
//! everything else rather than being silently discarded.

use std::os::unix::io::{AsRawFd, FromRawFd};

use async_trait::async_trait;
use tokio::process::Command;

use super::{ControlBackend, Key};
use crate::error::BackendError;

/// The agent's real stdout carries the binary protocol to the controller,
/// so a helper inheriting it outright would corrupt the stream. Duplicate
/// our stderr fd instead and hand the helper that.
fn helper_stdout() -> Result<std::process::Stdio, BackendError> {
    let fd = nix::unistd::dup(std::io::stderr().as_raw_fd())
        .map_err(|e| BackendError::Protocol(format!("dup stderr failed: {e}")))?;
    Ok(unsafe { std::process::Stdio::from_raw_fd(fd) })
}

pub struct ExternalBackend {
    helper: String,
    board: String,
}

impl ExternalBackend {
    pub async fn open(helper: String, board: String, usb_always_on: bool) -> Result<Self, BackendError> {
        let mut backend = Self { helper, board };
        backend.power(false).await?;
        backend.usb(usb_always_on).await?;
        Ok(backend)
    }

    async fn run(&self, verb: &str, arg: Option<&str>) -> Result<(), BackendError> {
        let mut command = Command::new(&self.helper);
        command.arg(&self.board).arg(verb);
        if let Some(arg) = arg {
            command.arg(arg);
        }
        command.stdout(helper_stdout()?);
        command.stderr(std::process::Stdio::inherit());

        let status = command
            .status()
            .await
            .map_err(|e| BackendError::Protocol(format!("external helper spawn failed: {e}")))?;
        if !status.success() {
            return Err(BackendError::Protocol(format!(
                "external helper `{} {} {}` exited with {status}",
                self.helper, self.board, verb
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ControlBackend for ExternalBackend {
    async fn power(&mut self, on: bool) -> Result<(), BackendError> {
        self.run("power", Some(if on { "on" } else { "off" })).await
    }

    async fn usb(&mut self, on: bool) -> Result<(), BackendError> {
        self.run("usb", Some(if on { "on" } else { "off" })).await
    }

    async fn key(&mut self, key: Key, asserted: bool) -> Result<(), BackendError> {
        let verb = match key {
            Key::Power => "key-power",
            Key::Fastboot => "key-fastboot",
        };
        self.run(verb, Some(if asserted { "on" } else { "off" })).await
    }
}
