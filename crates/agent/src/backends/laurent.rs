//! laurent: an HTTP-controlled network relay board, grounded on
//! `drivers/laurent.c`. Each request is a bare HTTP/1.0 GET issued over a
//! fresh TCP connection (no keep-alive, no response body parsing beyond
//! checking the status line) — `GET /cmd.cgi?psw=<password>&cmd=REL,<relay>,<0|1> HTTP/1.0\r\n\r\n`.
//! An optional second relay switches USB power independently of board power.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::{ControlBackend, Key};
use crate::error::BackendError;

pub struct LaurentBackend {
    server: String,
    password: String,
    relay: u32,
    usb_relay: Option<u32>,
}

impl LaurentBackend {
    pub async fn open(
        server: String,
        password: String,
        relay: u32,
        usb_relay: Option<u32>,
        usb_always_on: bool,
    ) -> Result<Self, BackendError> {
        let mut backend = Self {
            server,
            password,
            relay,
            usb_relay,
        };
        backend.power(false).await?;
        backend.usb(usb_always_on).await?;
        Ok(backend)
    }

    async fn command(&self, relay: u32, on: bool) -> Result<(), BackendError> {
        let mut stream = TcpStream::connect((self.server.as_str(), 80))
            .await
            .map_err(BackendError::Io)?;
        let request = format!(
            "GET /cmd.cgi?psw={}&cmd=REL,{},{} HTTP/1.0\r\n\r\n",
            self.password,
            relay,
            on as u8
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(BackendError::Io)?;

        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader
            .read_line(&mut status_line)
            .await
            .map_err(BackendError::Io)?;
        if !status_line.contains("200") {
            return Err(BackendError::Protocol(format!(
                "laurent relay {relay} command rejected: {}",
                status_line.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ControlBackend for LaurentBackend {
    async fn power(&mut self, on: bool) -> Result<(), BackendError> {
        self.command(self.relay, on).await
    }

    async fn usb(&mut self, on: bool) -> Result<(), BackendError> {
        if let Some(usb_relay) = self.usb_relay {
            self.command(usb_relay, on).await?;
        }
        Ok(())
    }

    async fn key(&mut self, _key: Key, _asserted: bool) -> Result<(), BackendError> {
        Ok(())
    }
}
