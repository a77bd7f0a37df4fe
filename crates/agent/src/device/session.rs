//! A single client's board session, grounded on `device_open()`/`device_close()`
//! in `device.c`. Ties a board descriptor to its open backends, drives the
//! power-up state machine, and owns the optional fastboot and status-cmd
//! handles for the session's lifetime.

use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backends::{alpaca, cdb_assist, conmux, external, ftdi_gpio, laurent, local_gpio, qcomlt_debug};
use crate::backends::{BackendConfig, ConsoleBackend, ConsoleSink, ControlBackend, StatusSink};
use crate::error::BackendError;
use crate::fastboot::FastbootHandle;

use super::lock::BoardLock;
use super::power_fsm::{self, PowerState};
use super::{ppps, status_cmd, BoardConfig};

pub struct Session {
    pub board: BoardConfig,
    control: Box<dyn ControlBackend>,
    console: Box<dyn ConsoleBackend>,
    fastboot: Option<FastbootHandle>,
    power_state: PowerState,
    fsm_cancel: CancellationToken,
    status_enabled: bool,
    status_cmd_task: Option<tokio::task::JoinHandle<()>>,
    _lock: BoardLock,
}

impl Session {
    pub async fn open(
        board: BoardConfig,
        username: Option<&str>,
        transport_gone: &CancellationToken,
    ) -> Result<Self, BackendError> {
        if !board.user_allowed(username) {
            return Err(BackendError::Open(format!(
                "user {username:?} is not permitted to open board {}",
                board.board
            )));
        }

        let lock = BoardLock::acquire(&board.board, transport_gone).await?;

        info!(board = %board.board, user = ?username, "opening board session");

        let (control, console) = open_backends(&board).await?;

        let mut session = Self {
            board,
            control,
            console,
            fastboot: None,
            power_state: PowerState::Start,
            fsm_cancel: CancellationToken::new(),
            status_enabled: false,
            status_cmd_task: None,
            _lock: lock,
        };

        // "Power off before opening fastboot" (device.c): a board already
        // sitting in fastboot must be reset once so we don't race it.
        if session.board.power_always_on {
            session.control.power(false).await?;
            sleep(Duration::from_secs(2)).await;
        }
        if session.board.usb_always_on {
            session.usb(true).await?;
        }

        Ok(session)
    }

    pub async fn power_on(&mut self) {
        self.fsm_cancel = CancellationToken::new();
        let cancel = self.fsm_cancel.clone();
        let has_power_key = self.board.has_power_key();
        let fastboot_key_timeout = self
            .board
            .fastboot_key_timeout
            .map(|secs| Duration::from_secs(secs as u64));

        let result = power_fsm::run_power_up(
            self.control.as_mut(),
            has_power_key,
            fastboot_key_timeout,
            self.board.ppps_path.as_deref(),
            self.board.ppps3_path.as_deref(),
            &cancel,
        )
        .await;

        match result {
            Ok(state) => self.power_state = state,
            Err(e) => warn!(board = %self.board.board, "power-up sequence failed: {e}"),
        }
    }

    pub async fn power_off(&mut self) -> Result<(), BackendError> {
        self.fsm_cancel.cancel();
        self.power_state = PowerState::Start;
        self.control.power(false).await
    }

    pub fn is_running(&self) -> bool {
        self.power_state == PowerState::Running
    }

    pub async fn usb(&mut self, on: bool) -> Result<(), BackendError> {
        if let Some(path) = self.board.ppps_path.clone() {
            ppps::power(&path, self.board.ppps3_path.as_deref(), on).await;
            Ok(())
        } else {
            self.control.usb(on).await
        }
    }

    pub async fn write_console(&mut self, data: &[u8]) -> Result<(), BackendError> {
        self.console.write(data).await
    }

    /// Starts forwarding bytes read from the board's console to `sink`,
    /// called once right after the session opens.
    pub fn spawn_console_reader(&mut self, sink: ConsoleSink) {
        self.console.spawn_reader(sink);
    }

    pub async fn send_break(&mut self) -> Result<(), BackendError> {
        self.console.send_break().await
    }

    pub async fn status_enable(&mut self, sink: StatusSink) -> Result<(), BackendError> {
        if self.status_enabled {
            return Ok(());
        }
        self.control.status_enable(sink.clone()).await?;
        if let Some(command) = self.board.status_cmd.clone() {
            self.status_cmd_task = Some(status_cmd::spawn(&command, sink)?);
        }
        self.status_enabled = true;
        Ok(())
    }

    /// The board's configured fastboot USB serial, watched for by the
    /// dispatcher's background hotplug task.
    pub fn fastboot_serial(&self) -> Option<&str> {
        self.board.fastboot_serial.as_deref()
    }

    /// Adopts a newly attached fastboot handle.
    pub fn set_fastboot(&mut self, handle: FastbootHandle) {
        self.fastboot = Some(handle);
    }

    pub fn fastboot(&self) -> Option<&FastbootHandle> {
        self.fastboot.as_ref()
    }

    /// Drops the fastboot handle once its USB device has disconnected
    /// so the dispatcher's hotplug task starts watching for
    /// the board to reappear.
    pub fn clear_fastboot(&mut self) {
        self.fastboot = None;
    }

    /// Accumulated-chunks boot step (`device_boot()` in `device.c`): set
    /// the active slot if configured, download the staged image, then run
    /// either a plain boot or the flash+reboot fallback, finally dropping
    /// USB power if status telemetry is enabled and the board isn't pinned
    /// always-on (matching the original's "disabling USB, use ^A V to
    /// enable" warning path).
    pub async fn boot_fastboot(&mut self, image: Vec<u8>) -> Result<(), crate::error::FastbootError> {
        let Some(handle) = self.fastboot.as_ref() else {
            return Err(crate::error::FastbootError::NoInterface);
        };
        if let Some(slot) = &self.board.fastboot_set_active {
            handle.set_active(slot).await?;
        }
        handle.download(&image).await?;
        match self.board.boot_strategy {
            BootStrategy::Boot => handle.boot().await?,
            BootStrategy::FlashReboot => {
                handle.flash("boot").await?;
                handle.reboot().await?;
            }
        }
        if self.status_enabled && !self.board.usb_always_on {
            warn!(board = %self.board.board, "disabling USB, use ^A V to enable");
            let _ = self.usb(false).await;
        }
        Ok(())
    }

    pub async fn fastboot_continue(&self) -> Result<(), crate::error::FastbootError> {
        let Some(handle) = self.fastboot.as_ref() else {
            return Err(crate::error::FastbootError::NoInterface);
        };
        handle.continue_boot().await
    }

    pub async fn close(&mut self) -> Result<(), BackendError> {
        if let Some(task) = self.status_cmd_task.take() {
            task.abort();
        }
        self.fsm_cancel.cancel();
        if !self.board.usb_always_on {
            self.usb(false).await?;
        }
        if !self.board.power_always_on {
            self.control.power(false).await?;
        }
        self.control.close().await
    }
}

async fn open_backends(
    board: &BoardConfig,
) -> Result<(Box<dyn ControlBackend>, Box<dyn ConsoleBackend>), BackendError> {
    if let BackendConfig::Conmux { name } = &board.backend {
        let backend = conmux::ConmuxBackend::open(name, &whoami()).await?;
        let (control, console) = conmux::split(backend);
        return Ok((Box::new(control), Box::new(console)));
    }

    let control: Box<dyn ControlBackend> = match &board.backend {
        BackendConfig::Alpaca { device } => {
            Box::new(alpaca::AlpacaBackend::open(device, board.usb_always_on).await?)
        }
        BackendConfig::CdbAssist { device } => Box::new(
            cdb_assist::CdbAssistBackend::open(device, board.voltage_mv.unwrap_or(0)).await?,
        ),
        BackendConfig::QcomltDebug { device } => {
            Box::new(qcomlt_debug::QcomltDebugBackend::open(device).await?)
        }
        BackendConfig::LocalGpio { lines } => {
            Box::new(local_gpio::LocalGpioBackend::open(lines.clone(), board.usb_always_on).await?)
        }
        BackendConfig::FtdiGpio { lines } => {
            Box::new(ftdi_gpio::FtdiGpioBackend::open(lines.clone(), board.usb_always_on).await?)
        }
        BackendConfig::Laurent {
            server,
            password,
            relay,
            usb_relay,
        } => Box::new(
            laurent::LaurentBackend::open(
                server.clone(),
                password.clone(),
                *relay,
                *usb_relay,
                board.usb_always_on,
            )
            .await?,
        ),
        BackendConfig::External { helper } => Box::new(
            external::ExternalBackend::open(helper.clone(), board.board.clone(), board.usb_always_on)
                .await?,
        ),
        BackendConfig::Conmux { .. } => unreachable!("handled above"),
    };

    let console_device = board
        .console
        .as_deref()
        .ok_or_else(|| BackendError::Open(format!("board {} has no console configured", board.board)))?;
    let console: Box<dyn ConsoleBackend> =
        Box::new(crate::backends::serial_console::SerialConsoleBackend::open(console_device)?);

    Ok((control, console))
}

/// `CDBA_USER`, then `USER`, then the literal `nobody`.
pub fn whoami() -> String {
    std::env::var("CDBA_USER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "nobody".to_string())
}
