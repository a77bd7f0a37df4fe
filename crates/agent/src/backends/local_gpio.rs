//! local-gpio: Linux GPIO chip lines, grounded on `drivers/local-gpio.c`.
//!
//! Each named logical line (power, fastboot-key, power-key, usb-disconnect)
//! is a `(chip, offset, active_low)` triple; `present` (via `Option`) gates
//! whether the line is driven at all, matching a board that simply never
//! wired up e.g. a power key. Lines are driven through the kernel's sysfs
//! GPIO interface (`/sys/class/gpio/gpio<N>/value`), exported on first use;
//! `chip` (e.g. `"gpiochip0"`) is resolved to that chip's sysfs base so a
//! line's `offset` is per-chip, not a single flat global number — needed as
//! soon as a board has more than one gpiochip, e.g. an SoC's own plus a
//! USB-attached expander.

use async_trait::async_trait;
use tokio::fs;
use tokio::time::{sleep, Duration};

use super::{ControlBackend, GpioLine, GpioLines, Key};
use crate::error::BackendError;

/// Resolves a named chip (e.g. `"gpiochip0"`) to its sysfs-global GPIO base
/// offset, so a line's `offset` is interpreted relative to its own chip
/// rather than as a single flat global number — a board with more than one
/// gpiochip (an SoC's own plus a USB-attached expander, say) needs both.
async fn chip_base(chip: &str) -> Result<u32, BackendError> {
    let path = format!("/sys/class/gpio/{chip}/base");
    let text = fs::read_to_string(&path).await.map_err(BackendError::Io)?;
    text.trim()
        .parse()
        .map_err(|_| BackendError::Protocol(format!("gpio chip {chip}: malformed base at {path}")))
}

async fn global_offset(line: &GpioLine) -> Result<u32, BackendError> {
    Ok(chip_base(&line.chip).await? + line.offset)
}

async fn export(global: u32) -> Result<(), BackendError> {
    let path = format!("/sys/class/gpio/gpio{global}");
    if fs::metadata(&path).await.is_ok() {
        return Ok(());
    }
    fs::write("/sys/class/gpio/export", global.to_string())
        .await
        .map_err(BackendError::Io)
}

async fn set_direction_out(global: u32) -> Result<(), BackendError> {
    fs::write(
        format!("/sys/class/gpio/gpio{global}/direction"),
        "out",
    )
    .await
    .map_err(BackendError::Io)
}

async fn write_line(line: &GpioLine, asserted: bool) -> Result<(), BackendError> {
    let global = global_offset(line).await?;
    export(global).await?;
    set_direction_out(global).await?;
    let level = asserted ^ line.active_low;
    fs::write(
        format!("/sys/class/gpio/gpio{global}/value"),
        if level { "1" } else { "0" },
    )
    .await
    .map_err(BackendError::Io)
}

pub struct LocalGpioBackend {
    lines: GpioLines,
}

impl LocalGpioBackend {
    pub async fn open(lines: GpioLines, usb_always_on: bool) -> Result<Self, BackendError> {
        let mut backend = Self { lines };
        backend.power(false).await?;
        backend.usb(usb_always_on).await?;
        sleep(Duration::from_millis(500)).await;
        Ok(backend)
    }
}

#[async_trait]
impl ControlBackend for LocalGpioBackend {
    fn has_power_key(&self) -> bool {
        self.lines.power_key.is_some()
    }

    async fn power(&mut self, on: bool) -> Result<(), BackendError> {
        if let Some(line) = &self.lines.power {
            write_line(line, on).await?;
        }
        Ok(())
    }

    async fn usb(&mut self, on: bool) -> Result<(), BackendError> {
        if let Some(line) = &self.lines.usb_disconnect {
            // "usb-disconnect" is asserted to *remove* the device, so the
            // logical sense is inverted relative to `on`.
            write_line(line, !on).await?;
        }
        Ok(())
    }

    async fn key(&mut self, key: Key, asserted: bool) -> Result<(), BackendError> {
        let line = match key {
            Key::Power => &self.lines.power_key,
            Key::Fastboot => &self.lines.fastboot_key,
        };
        if let Some(line) = line {
            write_line(line, asserted).await?;
        }
        Ok(())
    }
}
