//! The control/console backend abstraction and its eight
//! concrete variants. A tagged [`BackendConfig`] enum plus one
//! [`ControlBackend`] trait replaces the original's function-pointer tables
//! tied together by global symbol name, giving exhaustive match coverage
//! and compile-time linkage.

pub mod alpaca;
pub mod cdb_assist;
pub mod conmux;
pub mod external;
pub mod ftdi_gpio;
pub mod laurent;
pub mod local_gpio;
pub mod qcomlt_debug;
pub mod serial_console;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::BackendError;

/// Logical key a power-up sequence can actuate. cdb-assist and qcomlt-debug
/// also use these to name their GPIO-like single-character commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Power,
    Fastboot,
}

/// One `(chip, offset, active_low)` line as used by local-gpio / ftdi-gpio.
/// `present` mirrors the original's per-line optionality: a board that
/// never wired up e.g. a power key simply omits that line from its config.
#[derive(Debug, Clone, Deserialize)]
pub struct GpioLine {
    pub chip: String,
    pub offset: u32,
    #[serde(default)]
    pub active_low: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GpioLines {
    pub power: Option<GpioLine>,
    pub fastboot_key: Option<GpioLine>,
    pub power_key: Option<GpioLine>,
    pub usb_disconnect: Option<GpioLine>,
}

/// Backend-specific options recognized by the YAML device inventory loader.
/// Exactly one variant is selected per board.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    Alpaca { device: String },
    CdbAssist { device: String },
    Conmux { name: String },
    FtdiGpio { lines: GpioLines },
    LocalGpio { lines: GpioLines },
    QcomltDebug { device: String },
    Laurent {
        server: String,
        password: String,
        relay: u32,
        usb_relay: Option<u32>,
    },
    External { helper: String },
}

impl BackendConfig {
    pub fn name(&self) -> &'static str {
        match self {
            BackendConfig::Alpaca { .. } => "alpaca",
            BackendConfig::CdbAssist { .. } => "cdb-assist",
            BackendConfig::Conmux { .. } => "conmux",
            BackendConfig::FtdiGpio { .. } => "ftdi-gpio",
            BackendConfig::LocalGpio { .. } => "local-gpio",
            BackendConfig::QcomltDebug { .. } => "qcomlt-debug",
            BackendConfig::Laurent { .. } => "laurent",
            BackendConfig::External { .. } => "external",
        }
    }
}

/// Uniform capability surface over the heterogeneous backends. Every
/// operation is invoked synchronously (conceptually) from the dispatcher
/// and must return within a few milliseconds of wall clock; anything
/// genuinely slow (process spawn, TCP connect) still happens inline here
/// because none of it blocks more than that in practice, matching the
/// original's "none may block more than a few milliseconds" contract.
#[async_trait]
pub trait ControlBackend: Send {
    /// Whether this board physically has a power key line (affects the
    /// power-up FSM's branching).
    fn has_power_key(&self) -> bool {
        false
    }

    async fn power(&mut self, on: bool) -> Result<(), BackendError>;

    async fn usb(&mut self, _on: bool) -> Result<(), BackendError> {
        Ok(())
    }

    async fn key(&mut self, _key: Key, _asserted: bool) -> Result<(), BackendError> {
        Ok(())
    }

    /// Enable periodic telemetry/status emission. Idempotent: a second call
    /// after the first must not start a second timer.
    async fn status_enable(&mut self, _emit: StatusSink) -> Result<(), BackendError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Capability record for the console half of a board. Separate from
/// [`ControlBackend`] because most backends are console-less (the console
/// is a plain serial line instead); conmux is the one backend that is both.
#[async_trait]
pub trait ConsoleBackend: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), BackendError>;

    async fn send_break(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Starts forwarding bytes read from the board back to `sink`, one
    /// chunk per read. Called exactly once, right after the backend opens;
    /// the default no-op exists only so backends that can't ever produce
    /// console bytes don't have to implement it.
    fn spawn_reader(&mut self, _sink: ConsoleSink) {}
}

/// Where a backend's `status_enable` hands off JSON status lines. Kept as a
/// `tokio::sync::mpsc` sender so the emitting side (a spawned timer task)
/// never has to borrow the owning `Session`.
pub type StatusSink = tokio::sync::mpsc::UnboundedSender<String>;

/// Where a console backend's reader task hands off raw bytes read from the
/// board, matching the shape of [`StatusSink`].
pub type ConsoleSink = tokio::sync::mpsc::UnboundedSender<Vec<u8>>;
