//! conmux: a TCP client to an external console multiplexer that doubles as
//! both control and console backend, grounded on `drivers/conmux.c`.
//!
//! Contacts a registry at `127.0.0.1:63000` with `LOOKUP service=<name>\n`,
//! parses a percent-decoded `key=value` response line, connects to the
//! resolved `host:port`, sends `CONNECT id=cdba:<user> to=console\n`, and
//! expects `status=OK`. The same socket then carries bidirectional console
//! traffic; power on/off are the literal strings `~$hardreset\n`/`~$off\n`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::{ConsoleBackend, ConsoleSink, ControlBackend};
use crate::error::BackendError;

const REGISTRY_ADDR: &str = "127.0.0.1:63000";

/// The handshake runs on the whole stream; once it's done the socket is
/// split so the console reader can sit in its own task without blocking
/// power/console writes behind however long the board stays quiet.
pub struct ConmuxBackend {
    write_half: OwnedWriteHalf,
    read_half: Option<OwnedReadHalf>,
}

impl ConmuxBackend {
    pub async fn open(service: &str, user: &str) -> Result<Self, BackendError> {
        let (host, port) = registry_lookup(service).await?;
        let mut stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(BackendError::Io)?;

        stream
            .write_all(format!("CONNECT id=cdba:{} to=console\n", user).as_bytes())
            .await
            .map_err(BackendError::Io)?;

        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.map_err(BackendError::Io)?;
        let fields = parse_kv_line(&line);
        if fields.get("status").map(String::as_str) != Some("OK") {
            return Err(BackendError::Protocol(format!(
                "conmux CONNECT rejected: {}",
                line.trim()
            )));
        }

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            write_half,
            read_half: Some(read_half),
        })
    }

    async fn send(&mut self, line: &str) -> Result<(), BackendError> {
        self.write_half
            .write_all(line.as_bytes())
            .await
            .map_err(BackendError::Io)
    }
}

/// `LOOKUP service=<name>\n` → `status=OK result=host:port`, percent-decoded.
async fn registry_lookup(service: &str) -> Result<(String, u16), BackendError> {
    let mut stream = TcpStream::connect(REGISTRY_ADDR)
        .await
        .map_err(BackendError::Io)?;
    stream
        .write_all(format!("LOOKUP service={}\n", service).as_bytes())
        .await
        .map_err(BackendError::Io)?;

    let mut reader = BufReader::new(&mut stream);
    let mut line = String::new();
    reader.read_line(&mut line).await.map_err(BackendError::Io)?;

    let fields = parse_kv_line(&line);
    if fields.get("status").map(String::as_str) != Some("OK") {
        return Err(BackendError::Protocol(format!(
            "conmux registry lookup failed: {}",
            line.trim()
        )));
    }
    let result = fields
        .get("result")
        .ok_or_else(|| BackendError::Protocol("conmux registry: missing result".into()))?;
    let (host, port) = result
        .rsplit_once(':')
        .ok_or_else(|| BackendError::Protocol(format!("conmux registry: bad endpoint {result}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| BackendError::Protocol(format!("conmux registry: bad port {port}")))?;
    Ok((host.to_string(), port))
}

/// Space-separated `key=value` pairs with percent-decoded values. Any
/// non-percent, non-printable byte ends the current value rather than
/// being escaped — the source's behavior here is undefined past that
/// point, so this treats it as "end of value".
fn parse_kv_line(line: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for token in line.trim_end().split_whitespace() {
        if let Some((key, raw_value)) = token.split_once('=') {
            out.insert(key.to_string(), percent_decode(raw_value));
        }
    }
    out
}

fn percent_decode(s: &str) -> String {
    let mut out = String::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(value) = u8::from_str_radix(hex, 16) {
                    out.push(value as char);
                    i += 3;
                    continue;
                }
            }
            break;
        } else if b.is_ascii_graphic() {
            out.push(b as char);
            i += 1;
        } else {
            break;
        }
    }
    out
}

#[async_trait]
impl ControlBackend for ConmuxBackend {
    async fn power(&mut self, on: bool) -> Result<(), BackendError> {
        self.send(if on { "~$hardreset\n" } else { "~$off\n" }).await
    }
}

#[async_trait]
impl ConsoleBackend for ConmuxBackend {
    async fn write(&mut self, data: &[u8]) -> Result<(), BackendError> {
        self.write_half.write_all(data).await.map_err(BackendError::Io)
    }

    fn spawn_reader(&mut self, sink: ConsoleSink) {
        let Some(mut reader) = self.read_half.take() else {
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

/// Since `Session` stores its control and console halves as two independent
/// trait objects, conmux (the one backend that is both over a single
/// socket) splits into two handles sharing the same instance behind an
/// `Arc<Mutex<_>>` rather than forcing `Session` to special-case it.
pub fn split(backend: ConmuxBackend) -> (ControlHandle, ConsoleHandle) {
    let shared = Arc::new(Mutex::new(backend));
    (ControlHandle(shared.clone()), ConsoleHandle(shared))
}

pub struct ControlHandle(Arc<Mutex<ConmuxBackend>>);

#[async_trait]
impl ControlBackend for ControlHandle {
    async fn power(&mut self, on: bool) -> Result<(), BackendError> {
        self.0.lock().await.power(on).await
    }
}

pub struct ConsoleHandle(Arc<Mutex<ConmuxBackend>>);

#[async_trait]
impl ConsoleBackend for ConsoleHandle {
    async fn write(&mut self, data: &[u8]) -> Result<(), BackendError> {
        self.0.lock().await.write(data).await
    }

    fn spawn_reader(&mut self, sink: ConsoleSink) {
        let shared = Arc::clone(&self.0);
        tokio::spawn(async move {
            shared.lock().await.spawn_reader(sink);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_kv_line() {
        let fields = parse_kv_line("status=OK result=127.0.0.1:4200\n");
        assert_eq!(fields.get("status").unwrap(), "OK");
        assert_eq!(fields.get("result").unwrap(), "127.0.0.1:4200");
    }

    #[test]
    fn percent_decodes_values() {
        assert_eq!(percent_decode("a%20b"), "a b");
    }

    #[test]
    fn stops_at_first_non_printable_non_percent_byte() {
        assert_eq!(percent_decode("abc\tdef"), "abc");
    }
}
