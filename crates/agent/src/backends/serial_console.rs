//! The plain serial console used by every backend except conmux (which
//! carries console traffic over its own control socket instead). Grounded
//! on `cdba-server.c`'s generic console-fd handling: raw bytes in, raw
//! bytes out, with an optional break signal for boards that key off it.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt};

use super::{ConsoleBackend, ConsoleSink};
use crate::error::BackendError;

const BAUD: u32 = 115200;

/// Holds two independent handles onto the same serial line — `try_clone_native`
/// duplicates the underlying fd so the read side can sit in its own task
/// without holding a lock the write side would otherwise have to wait
/// behind for however long the board stays quiet.
pub struct SerialConsoleBackend {
    port: tokio_serial::SerialStream,
    reader: Option<tokio_serial::SerialStream>,
}

impl SerialConsoleBackend {
    pub fn open(device: &str) -> Result<Self, BackendError> {
        let port = tokio_serial::new(device, BAUD)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .map_err(|e| BackendError::Open(e.to_string()))?;
        let reader = port
            .try_clone_native()
            .map_err(|e| BackendError::Open(e.to_string()))?;
        Ok(Self {
            port,
            reader: Some(reader),
        })
    }
}

#[async_trait]
impl ConsoleBackend for SerialConsoleBackend {
    async fn write(&mut self, data: &[u8]) -> Result<(), BackendError> {
        self.port.write_all(data).await.map_err(BackendError::Io)
    }

    async fn send_break(&mut self) -> Result<(), BackendError> {
        self.port
            .set_break()
            .map_err(|e| BackendError::Protocol(format!("send break failed: {e}")))?;
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        self.port
            .clear_break()
            .map_err(|e| BackendError::Protocol(format!("clear break failed: {e}")))
    }

    fn spawn_reader(&mut self, sink: ConsoleSink) {
        let Some(mut reader) = self.reader.take() else {
            return;
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if sink.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}
