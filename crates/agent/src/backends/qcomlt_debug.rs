//! qcomlt-debug: a simpler serial debug-board backend, grounded on
//! `drivers/qcomlt_dbg.c`. Single-character commands: `p`/`P` power,
//! `u`/`U` VBUS, `r`/`R` fastboot key, `b`/`B` power key. Telemetry lines
//! look like `"<n>mV <n>mA"` and are decoded by the explicit 7-state
//! parser below, including a dedicated error-recovery state that discards
//! bytes until the next `A` rather than getting stuck.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;

use super::{ControlBackend, Key, StatusSink};
use crate::error::BackendError;
use crate::status::{status_line, StatusValue};

const BAUD: u32 = 115200;
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    pub millivolts: i64,
    pub milliamps: i64,
}

/// `STATE_`, `STATE_num`, `STATE_num_m`, `STATE_num_mV`,
/// `STATE_num_mV_num`, `STATE_num_mV_num_m`, `STATE_err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Num(i64),
    NumM(i64),
    NumMv(i64),
    NumMvNum(i64, i64),
    NumMvNumM(i64, i64),
    Err,
}

pub struct Parser {
    state: State,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    pub fn push(&mut self, byte: u8) -> Option<Reading> {
        let c = byte as char;
        let (next, reading) = match self.state {
            State::Idle => {
                if c.is_ascii_digit() {
                    (State::Num(digit(c)), None)
                } else {
                    (State::Idle, None)
                }
            }
            State::Num(n) => {
                if c.is_ascii_digit() {
                    (State::Num(n * 10 + digit(c)), None)
                } else if c == 'm' {
                    (State::NumM(n), None)
                } else {
                    (State::Err, None)
                }
            }
            State::NumM(n) => {
                if c == 'V' {
                    (State::NumMv(n), None)
                } else {
                    (State::Err, None)
                }
            }
            State::NumMv(n) => {
                if c == ' ' {
                    (State::NumMv(n), None)
                } else if c.is_ascii_digit() {
                    (State::NumMvNum(n, digit(c)), None)
                } else {
                    (State::Err, None)
                }
            }
            State::NumMvNum(n, m) => {
                if c.is_ascii_digit() {
                    (State::NumMvNum(n, m * 10 + digit(c)), None)
                } else if c == 'm' {
                    (State::NumMvNumM(n, m), None)
                } else {
                    (State::Err, None)
                }
            }
            State::NumMvNumM(n, m) => {
                if c == 'A' {
                    (
                        State::Idle,
                        Some(Reading {
                            millivolts: n,
                            milliamps: m,
                        }),
                    )
                } else {
                    (State::Err, None)
                }
            }
            State::Err => {
                if c == 'A' {
                    (State::Idle, None)
                } else {
                    (State::Err, None)
                }
            }
        };
        self.state = next;
        reading
    }
}

fn digit(c: char) -> i64 {
    c.to_digit(10).unwrap_or(0) as i64
}

#[derive(Default)]
struct Shared {
    last: Option<Reading>,
}

pub struct QcomltDebugBackend {
    writer: tokio_serial::SerialStream,
    shared: Arc<Mutex<Shared>>,
    reader_task: Option<JoinHandle<()>>,
    status_task: Option<JoinHandle<()>>,
}

impl QcomltDebugBackend {
    pub async fn open(device: &str) -> Result<Self, BackendError> {
        let port = tokio_serial::new(device, BAUD)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .map_err(|e| BackendError::Open(e.to_string()))?;

        let (mut reader, writer) = tokio::io::split(port);
        let shared = Arc::new(Mutex::new(Shared::default()));

        let reader_shared = Arc::clone(&shared);
        let reader_task = tokio::spawn(async move {
            let mut parser = Parser::new();
            let mut byte = [0u8; 1];
            loop {
                match reader.read(&mut byte).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if let Some(reading) = parser.push(byte[0]) {
                            reader_shared.lock().await.last = Some(reading);
                        }
                    }
                }
            }
        });

        let mut backend = Self {
            writer,
            shared,
            reader_task: Some(reader_task),
            status_task: None,
        };
        backend.write_raw(b"brpu").await?;
        Ok(backend)
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), BackendError> {
        self.writer.write_all(bytes).await.map_err(BackendError::Io)
    }
}

#[async_trait]
impl ControlBackend for QcomltDebugBackend {
    fn has_power_key(&self) -> bool {
        true
    }

    async fn power(&mut self, on: bool) -> Result<(), BackendError> {
        self.write_raw(if on { b"P" } else { b"p" }).await
    }

    async fn usb(&mut self, on: bool) -> Result<(), BackendError> {
        self.write_raw(if on { b"U" } else { b"u" }).await
    }

    async fn key(&mut self, key: Key, asserted: bool) -> Result<(), BackendError> {
        let byte: &[u8] = match (key, asserted) {
            (Key::Power, true) => b"B",
            (Key::Power, false) => b"b",
            (Key::Fastboot, true) => b"R",
            (Key::Fastboot, false) => b"r",
        };
        self.write_raw(byte).await
    }

    /// Self-rearming: reschedules itself every 200 ms for the life of the
    /// session, matching cdb-assist's own status poll cadence.
    async fn status_enable(&mut self, sink: StatusSink) -> Result<(), BackendError> {
        if self.status_task.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                let reading = shared.lock().await.last;
                if let Some(r) = reading {
                    let line = status_line(
                        "vbat",
                        &[StatusValue::Mv(r.millivolts), StatusValue::Ma(r.milliamps)],
                    );
                    if sink.send(line).is_err() {
                        break;
                    }
                }
            }
        });
        self.status_task = Some(task);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.status_task.take() {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_clean_reading() {
        let mut p = Parser::new();
        let mut last = None;
        for b in b"3700mV 120mA" {
            if let Some(r) = p.push(*b) {
                last = Some(r);
            }
        }
        assert_eq!(
            last,
            Some(Reading {
                millivolts: 3700,
                milliamps: 120
            })
        );
    }

    #[test]
    fn recovers_after_malformed_input_at_next_a() {
        let mut p = Parser::new();
        for b in b"37g0mV garbageA" {
            p.push(*b);
        }
        assert_eq!(p.state, State::Idle);
    }

    #[test]
    fn allows_multiple_spaces_between_numbers() {
        let mut p = Parser::new();
        let mut last = None;
        for b in b"1800mV   5mA" {
            if let Some(r) = p.push(*b) {
                last = Some(r);
            }
        }
        assert_eq!(
            last,
            Some(Reading {
                millivolts: 1800,
                milliamps: 5
            })
        );
    }
}
