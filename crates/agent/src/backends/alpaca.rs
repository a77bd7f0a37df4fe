//! alpaca: line-oriented text commands over a raw serial adapter, grounded
//! on `drivers/alpaca.c`. Power key is GPIO bit 1, fastboot key is bit 2.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, Duration};
use tokio_serial::SerialPortBuilderExt;

use super::{ControlBackend, Key};
use crate::error::BackendError;

const BAUD: u32 = 115200;

pub struct AlpacaBackend {
    port: tokio_serial::SerialStream,
}

impl AlpacaBackend {
    pub async fn open(device: &str, usb_always_on: bool) -> Result<Self, BackendError> {
        let port = tokio_serial::new(device, BAUD)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .map_err(|e| BackendError::Open(e.to_string()))?;
        let mut backend = Self { port };
        backend.power(false).await?;
        backend.usb(usb_always_on).await?;
        sleep(Duration::from_millis(500)).await;
        Ok(backend)
    }

    async fn send(&mut self, line: &str) -> Result<(), BackendError> {
        self.port
            .write_all(line.as_bytes())
            .await
            .map_err(BackendError::Io)
    }

    async fn ttl_bit(&mut self, bit: u8, value: bool) -> Result<(), BackendError> {
        self.send(&format!("ttl outputBit {} {}\r", bit, value as u8))
            .await
    }
}

#[async_trait]
impl ControlBackend for AlpacaBackend {
    fn has_power_key(&self) -> bool {
        true
    }

    async fn power(&mut self, on: bool) -> Result<(), BackendError> {
        self.send(&format!("devicePower {}\r", on as u8)).await
    }

    async fn usb(&mut self, on: bool) -> Result<(), BackendError> {
        self.send(&format!("usbDevicePower {}\r", on as u8)).await
    }

    async fn key(&mut self, key: Key, asserted: bool) -> Result<(), BackendError> {
        let bit = match key {
            Key::Power => 1,
            Key::Fastboot => 2,
        };
        self.ttl_bit(bit, asserted).await
    }
}
