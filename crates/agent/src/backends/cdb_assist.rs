//! cdb-assist: a serial-attached bit-bang power/voltage controller that
//! also streams telemetry on the same line (grounded on
//! `drivers/cdb_assist.c`).
//!
//! Commands are single characters: `p`/`P` power off/on, `v`/`V` VBUS,
//! `a`/`A` (POWER key alias), `b`/`B` (FASTBOOT key alias), `c`/`C` (spare
//! GPIO 2), and `u<mV>\r\n` to set the supply voltage. Telemetry arrives as
//! free-running ASCII interleaved with command echoes and is decoded with
//! the explicit 13-state parser in [`Parser`] rather than a regex, because
//! input arrives in arbitrary chunk sizes and must short-circuit cleanly on
//! malformed bytes.

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

/// One recognized telemetry event out of the 13-state parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEvent {
    /// `<set>mV/<actual>mV` or `<set>mA/<actual>mA`.
    Pair { milli_unit: MilliUnit, set: i64, actual: i64 },
    /// `key: on` / `key: off`.
    Bool { key: String, on: bool },
    /// `key=<n>mV`, e.g. the reference voltage line.
    KeyValue { key: String, millivolts: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MilliUnit {
    Volt,
    Amp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    /// `STATE_`: nothing recognized yet.
    Idle,
    /// `STATE_key`: accumulating an identifier's letters.
    Key(String),
    /// `STATE_key_bool`: saw `key:`, skipping the separating space.
    KeyBool(String),
    /// `STATE_key_o`: saw `key: o`, branches to "on" or "off".
    KeyO(String),
    /// `STATE_key_of`: saw `key: of`, needs a final `f`.
    KeyOf(String),
    /// `STATE_key_value`: saw `key=`, awaiting the first digit.
    KeyValue(String),
    /// `STATE_key_num`: accumulating digits after `key=`.
    KeyNum(String, i64),
    /// `STATE_key_num_m`: saw the `m` of `key=<n>m`, awaiting `V`.
    KeyNumM(String, i64),
    /// `STATE_num`: accumulating the first number's digits.
    Num(i64),
    /// `STATE_num_m`: saw `m`, awaiting the unit letter (`V` or `A`).
    NumM(i64),
    /// `STATE_num_mX`: unit letter consumed, awaiting `/`.
    NumMx(i64, MilliUnit),
    /// `STATE_num_mX_`: `/` consumed, awaiting the second number's first digit.
    NumMxSlash(i64, MilliUnit),
    /// `STATE_num_num_m`: accumulating the second number's digits, or
    /// having just seen its trailing `m` and awaiting the matching unit
    /// letter to confirm the pair.
    NumNumM(i64, MilliUnit, i64, bool),
}

/// Hand-written character-driven parser for the cdb-assist telemetry
/// stream. `push` feeds one byte and returns a completed event, if any,
/// matching the original's short-circuit-on-error behavior: any byte that
/// does not fit the current state resets to [`State::Idle`] rather than
/// raising an error.
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

    pub fn push(&mut self, byte: u8) -> Option<ParsedEvent> {
        let c = byte as char;
        let (next, event) = match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => self.from_idle(c),
            State::Key(mut key) => {
                if c == ':' {
                    (State::KeyBool(key), None)
                } else if c == '=' {
                    (State::KeyValue(key), None)
                } else if c.is_ascii_alphanumeric() || c == '_' {
                    key.push(c);
                    (State::Key(key), None)
                } else {
                    (State::Idle, None)
                }
            }
            State::KeyBool(key) => {
                if c == ' ' {
                    (State::KeyBool(key), None)
                } else if c == 'o' {
                    (State::KeyO(key), None)
                } else {
                    (State::Idle, None)
                }
            }
            State::KeyO(key) => match c {
                'n' => (State::Idle, Some(ParsedEvent::Bool { key, on: true })),
                'f' => (State::KeyOf(key), None),
                _ => (State::Idle, None),
            },
            State::KeyOf(key) => {
                if c == 'f' {
                    (State::Idle, Some(ParsedEvent::Bool { key, on: false }))
                } else {
                    (State::Idle, None)
                }
            }
            State::KeyValue(key) => {
                if c.is_ascii_digit() {
                    (State::KeyNum(key, digit(c) as i64), None)
                } else {
                    (State::Idle, None)
                }
            }
            State::KeyNum(key, n) => {
                if c.is_ascii_digit() {
                    (State::KeyNum(key, n * 10 + digit(c) as i64), None)
                } else if c == 'm' {
                    (State::KeyNumM(key, n), None)
                } else {
                    (State::Idle, None)
                }
            }
            State::KeyNumM(key, n) => {
                if c == 'V' {
                    (
                        State::Idle,
                        Some(ParsedEvent::KeyValue {
                            key,
                            millivolts: n,
                        }),
                    )
                } else {
                    (State::Idle, None)
                }
            }
            State::Num(n) => {
                if c.is_ascii_digit() {
                    (State::Num(n * 10 + digit(c) as i64), None)
                } else if c == 'm' {
                    (State::NumM(n), None)
                } else {
                    (State::Idle, None)
                }
            }
            State::NumM(n) => match c {
                'V' => (State::NumMx(n, MilliUnit::Volt), None),
                'A' => (State::NumMx(n, MilliUnit::Amp), None),
                _ => (State::Idle, None),
            },
            State::NumMx(n, unit) => {
                if c == '/' {
                    (State::NumMxSlash(n, unit), None)
                } else {
                    (State::Idle, None)
                }
            }
            State::NumMxSlash(n, unit) => {
                if c.is_ascii_digit() {
                    (State::NumNumM(n, unit, digit(c) as i64, false), None)
                } else {
                    (State::Idle, None)
                }
            }
            State::NumNumM(set, unit, actual, seen_m) => {
                if !seen_m && c.is_ascii_digit() {
                    (State::NumNumM(set, unit, actual * 10 + digit(c) as i64, false), None)
                } else if !seen_m && c == 'm' {
                    (State::NumNumM(set, unit, actual, true), None)
                } else if seen_m && matches!((unit, c), (MilliUnit::Volt, 'V') | (MilliUnit::Amp, 'A'))
                {
                    (
                        State::Idle,
                        Some(ParsedEvent::Pair {
                            milli_unit: unit,
                            set,
                            actual,
                        }),
                    )
                } else {
                    (State::Idle, None)
                }
            }
        };
        self.state = next;
        event
    }

    fn from_idle(&self, c: char) -> (State, Option<ParsedEvent>) {
        if c.is_ascii_digit() {
            (State::Num(digit(c) as i64), None)
        } else if c.is_ascii_alphabetic() {
            (State::Key(c.to_string()), None)
        } else {
            (State::Idle, None)
        }
    }
}

fn digit(c: char) -> u32 {
    c.to_digit(10).unwrap_or(0)
}

#[derive(Default)]
struct Shared {
    vbat_set_mv: i64,
    vbat_actual_mv: i64,
    vbat_ma: i64,
    vref_mv: i64,
}

pub struct CdbAssistBackend {
    writer: tokio_serial::SerialStream,
    shared: Arc<Mutex<Shared>>,
    reader_task: Option<JoinHandle<()>>,
    status_task: Option<JoinHandle<()>>,
    status_armed: bool,
    voltage_mv: u32,
}

impl CdbAssistBackend {
    pub async fn open(device: &str, voltage_mv: u32) -> Result<Self, BackendError> {
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
                        if let Some(event) = parser.push(byte[0]) {
                            let mut s = reader_shared.lock().await;
                            apply_event(&mut s, event);
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
            status_armed: false,
            voltage_mv,
        };
        backend.write_raw(b"vpabc").await?;
        backend.set_voltage(voltage_mv).await?;
        Ok(backend)
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), BackendError> {
        self.writer.write_all(bytes).await.map_err(BackendError::Io)
    }

    async fn set_voltage(&mut self, mv: u32) -> Result<(), BackendError> {
        self.write_raw(format!("u{}\r\n", mv).as_bytes()).await
    }
}

fn apply_event(shared: &mut Shared, event: ParsedEvent) {
    match event {
        ParsedEvent::Pair {
            milli_unit: MilliUnit::Volt,
            set,
            actual,
        } => {
            shared.vbat_set_mv = set;
            shared.vbat_actual_mv = actual;
        }
        ParsedEvent::Pair {
            milli_unit: MilliUnit::Amp,
            actual,
            ..
        } => {
            shared.vbat_ma = actual;
        }
        ParsedEvent::KeyValue { key, millivolts } if key == "vref" => {
            shared.vref_mv = millivolts;
        }
        _ => {}
    }
}

#[async_trait]
impl ControlBackend for CdbAssistBackend {
    async fn power(&mut self, on: bool) -> Result<(), BackendError> {
        self.write_raw(if on { b"P" } else { b"p" }).await
    }

    async fn usb(&mut self, on: bool) -> Result<(), BackendError> {
        self.write_raw(if on { b"V" } else { b"v" }).await
    }

    async fn key(&mut self, key: Key, asserted: bool) -> Result<(), BackendError> {
        let byte: &[u8] = match (key, asserted) {
            (Key::Power, true) => b"A",
            (Key::Power, false) => b"a",
            (Key::Fastboot, true) => b"B",
            (Key::Fastboot, false) => b"b",
        };
        self.write_raw(byte).await
    }

    /// Self-rearming, matching qcomlt-debug's own status poll: reschedules
    /// itself every second for the life of the session rather than firing
    /// once.
    async fn status_enable(&mut self, sink: StatusSink) -> Result<(), BackendError> {
        if self.status_armed {
            return Ok(());
        }
        self.status_armed = true;
        let shared = Arc::clone(&self.shared);
        let voltage_mv = self.voltage_mv;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(1000)).await;
                let s = shared.lock().await;
                let vbat = status_line(
                    "vbat",
                    &[
                        StatusValue::Mv(if s.vbat_set_mv != 0 {
                            s.vbat_set_mv
                        } else {
                            voltage_mv as i64
                        }),
                        StatusValue::Ma(s.vbat_ma),
                    ],
                );
                let vref = status_line("vref", &[StatusValue::Mv(s.vref_mv)]);
                drop(s);
                if sink.send(vbat).is_err() {
                    break;
                }
                if sink.send(vref).is_err() {
                    break;
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
    fn parses_mv_pair() {
        let mut p = Parser::new();
        let mut last = None;
        for b in b"3700mV/3698mV" {
            if let Some(e) = p.push(*b) {
                last = Some(e);
            }
        }
        assert!(matches!(
            last,
            Some(ParsedEvent::Pair {
                milli_unit: MilliUnit::Volt,
                set: 3700,
                ..
            })
        ));
    }

    #[test]
    fn parses_bool_on() {
        let mut p = Parser::new();
        let mut last = None;
        for b in b"vbus: on" {
            if let Some(e) = p.push(*b) {
                last = Some(e);
            }
        }
        assert_eq!(
            last,
            Some(ParsedEvent::Bool {
                key: "vbus".to_string(),
                on: true
            })
        );
    }

    #[test]
    fn parses_bool_off() {
        let mut p = Parser::new();
        let mut last = None;
        for b in b"btn1: off" {
            if let Some(e) = p.push(*b) {
                last = Some(e);
            }
        }
        assert_eq!(
            last,
            Some(ParsedEvent::Bool {
                key: "btn1".to_string(),
                on: false
            })
        );
    }

    #[test]
    fn parses_key_value() {
        let mut p = Parser::new();
        let mut last = None;
        for b in b"vref=1800mV" {
            if let Some(e) = p.push(*b) {
                last = Some(e);
            }
        }
        assert_eq!(
            last,
            Some(ParsedEvent::KeyValue {
                key: "vref".to_string(),
                millivolts: 1800
            })
        );
    }

    #[test]
    fn garbage_bytes_do_not_panic_and_reset_to_idle() {
        let mut p = Parser::new();
        for b in b"$$##&&**" {
            p.push(*b);
        }
        assert_eq!(p.state, State::Idle);
    }
}
