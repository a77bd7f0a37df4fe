//! ftdi-gpio: bit-bang GPIO over an FTDI USB-serial bridge, grounded on
//! `drivers/ftdi-gpio.c`. Up to four named logical lines (power,
//! fastboot-key, power-key, usb-disconnect), each a single bit within one
//! byte of bit-bang output state, with per-line active-low inversion.
//!
//! Uses `rusb` (already a workspace dependency for the fastboot session) to
//! issue the FTDI vendor-specific `SIO_SET_BITMODE` control request and
//! then a bulk write per state change, rather than pulling in a dedicated
//! libftdi binding.

use async_trait::async_trait;
use tokio::time::{sleep, Duration};

use super::{ControlBackend, GpioLine, GpioLines, Key};
use crate::error::BackendError;

const FTDI_VENDOR_ID: u16 = 0x0403;
const FTDI_PRODUCT_ID: u16 = 0x6001;
const SIO_SET_BITMODE_REQUEST: u8 = 0x0b;
const BITMODE_BITBANG: u16 = 0x01;
const BULK_OUT_ENDPOINT: u8 = 0x02;

pub struct FtdiGpioBackend {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    bits: u8,
    lines: GpioLines,
}

impl FtdiGpioBackend {
    pub async fn open(lines: GpioLines, usb_always_on: bool) -> Result<Self, BackendError> {
        let handle = rusb::open_device_with_vid_pid(FTDI_VENDOR_ID, FTDI_PRODUCT_ID)
            .ok_or_else(|| BackendError::Open("no FTDI device found".into()))?;
        handle
            .claim_interface(0)
            .map_err(|e| BackendError::Open(e.to_string()))?;

        let mask_mode = ((0xffu16) << 8) | BITMODE_BITBANG;
        handle
            .write_control(0x40, SIO_SET_BITMODE_REQUEST, mask_mode, 0, &[], std::time::Duration::from_millis(100))
            .map_err(|e| BackendError::Open(e.to_string()))?;

        let mut backend = Self {
            handle,
            bits: 0,
            lines,
        };
        backend.flush().await?;
        backend.power(false).await?;
        backend.usb(usb_always_on).await?;
        sleep(Duration::from_millis(500)).await;
        Ok(backend)
    }

    fn set_bit(&mut self, line: &GpioLine, asserted: bool) {
        let mask = 1u8 << (line.offset & 0x7);
        let level = asserted ^ line.active_low;
        if level {
            self.bits |= mask;
        } else {
            self.bits &= !mask;
        }
    }

    async fn flush(&mut self) -> Result<(), BackendError> {
        let bits = self.bits;
        self.handle
            .write_bulk(BULK_OUT_ENDPOINT, &[bits], std::time::Duration::from_millis(100))
            .map_err(|e| BackendError::Protocol(format!("ftdi bulk write failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl ControlBackend for FtdiGpioBackend {
    fn has_power_key(&self) -> bool {
        self.lines.power_key.is_some()
    }

    async fn power(&mut self, on: bool) -> Result<(), BackendError> {
        if let Some(line) = self.lines.power.clone() {
            self.set_bit(&line, on);
            self.flush().await?;
        }
        Ok(())
    }

    async fn usb(&mut self, on: bool) -> Result<(), BackendError> {
        if let Some(line) = self.lines.usb_disconnect.clone() {
            self.set_bit(&line, !on);
            self.flush().await?;
        }
        Ok(())
    }

    async fn key(&mut self, key: Key, asserted: bool) -> Result<(), BackendError> {
        let line = match key {
            Key::Power => self.lines.power_key.clone(),
            Key::Fastboot => self.lines.fastboot_key.clone(),
        };
        if let Some(line) = line {
            self.set_bit(&line, asserted);
            self.flush().await?;
        }
        Ok(())
    }
}
