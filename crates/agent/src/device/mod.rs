//! The board registry: static descriptors loaded from the YAML inventory,
//! the per-board session lifecycle, the power-up state machine, and
//! the small amount of host-side plumbing (ppps, the advisory lockfile,
//! an optional status-cmd helper) that a `Session` pulls together.
//!
//! Grounded on `device.c`/`device.h`/`device_parser.c`.

pub mod inventory;
pub mod lock;
pub mod power_fsm;
pub mod ppps;
pub mod session;
pub mod status_cmd;

pub use inventory::load_inventory;
pub use session::{whoami, Session};

use crate::backends::BackendConfig;

/// Selects how a FASTBOOT_DOWNLOAD image is made to run once uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStrategy {
    /// Plain `fastboot boot`.
    Boot,
    /// `fastboot flash boot` followed by `fastboot reboot` — used by boards
    /// whose bootloader mishandles the RAM-boot command (the inventory's
    /// `broken_fastboot_boot` flag).
    FlashReboot,
}

/// A board's static descriptor, loaded once from the inventory and never
/// mutated afterwards.
#[derive(Debug, Clone)]
pub struct BoardConfig {
    pub board: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub users: Option<Vec<String>>,
    /// Plain serial console device path. `None` when the control backend
    /// (conmux) also supplies the console itself.
    pub console: Option<String>,
    pub voltage_mv: Option<u32>,
    /// `None` for a console-only board with no fastboot USB gadget.
    pub fastboot_serial: Option<String>,
    pub fastboot_set_active: Option<String>,
    pub fastboot_key_timeout: Option<u32>,
    pub boot_strategy: BootStrategy,
    pub usb_always_on: bool,
    pub power_always_on: bool,
    pub ppps_path: Option<String>,
    pub ppps3_path: Option<String>,
    pub status_cmd: Option<String>,
    pub video_device: Option<String>,
    pub backend: BackendConfig,
}

impl BoardConfig {
    pub fn has_power_key(&self) -> bool {
        matches!(
            &self.backend,
            BackendConfig::Alpaca { .. } | BackendConfig::QcomltDebug { .. } | BackendConfig::External { .. }
        ) || matches!(
            &self.backend,
            BackendConfig::LocalGpio { lines } | BackendConfig::FtdiGpio { lines }
                if lines.power_key.is_some()
        )
    }

    pub fn user_allowed(&self, username: Option<&str>) -> bool {
        let Some(users) = &self.users else {
            return true;
        };
        match username {
            Some(name) => users.iter().any(|u| u == name),
            None => false,
        }
    }
}
