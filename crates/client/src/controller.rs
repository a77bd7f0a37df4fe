//! The controller-side session: spawns the remote agent over `ssh`, puts
//! the local terminal in raw mode, and runs the interactive/automation
//! loop described by `cdba_client_main()` in `cdba-client.c` plus the
//! fastboot-upload extension in `cdba.c`.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::Instant;
use tracing::{info, warn};

use cdba_protocol::{write_message, Codec, Message, MessageType, UPLOAD_CHUNK_SIZE};

use crate::cli::Cli;
use crate::terminal::RawGuard;

const SHUTDOWN_MARKER_RUN: u32 = 20;
const POWER_CYCLE_SETTLE: Duration = Duration::from_secs(2);

struct Upload {
    data: Vec<u8>,
    offset: usize,
}

pub struct Controller {
    child: Child,
    stdin_pipe: ChildStdin,
    stdout_pipe: ChildStdout,
    stderr_pipe: ChildStderr,
    codec: Codec,
    raw: RawGuard,

    board: String,
    image: Option<PathBuf>,
    repeat_uploads: bool,
    status_fifo: Option<tokio::fs::File>,

    timeout_inactivity: Option<Duration>,
    total_deadline: Instant,
    inactivity_deadline: Option<Instant>,
    power_cycles: Option<u32>,
    cycle_on_timeout: bool,

    auto_power_on: bool,
    received_power_off: bool,
    reached_timeout: bool,
    quit: bool,
    fastboot_done: bool,
    tilde_run: u32,
    escape_pending: bool,
    upload: Option<Upload>,
}

impl Controller {
    pub async fn spawn(cli: &Cli) -> anyhow::Result<Self> {
        let mut child = Command::new("ssh")
            .arg(&cli.host)
            .arg(&cli.server_bin)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;

        let stdin_pipe = child.stdin.take().expect("piped stdin");
        let stdout_pipe = child.stdout.take().expect("piped stdout");
        let stderr_pipe = child.stderr.take().expect("piped stderr");

        let status_fifo = match &cli.status_fifo {
            Some(path) => Some(tokio::fs::OpenOptions::new().write(true).open(path).await?),
            None => None,
        };

        let timeout_total = Duration::from_secs(cli.timeout_total);
        let timeout_inactivity = (cli.timeout_inactivity > 0)
            .then(|| Duration::from_secs(cli.timeout_inactivity));
        let now = Instant::now();

        Ok(Self {
            child,
            stdin_pipe,
            stdout_pipe,
            stderr_pipe,
            codec: Codec::new(),
            raw: RawGuard::engage(),

            board: cli.board.clone(),
            image: cli.image.clone(),
            repeat_uploads: cli.repeat_uploads(),
            status_fifo,

            timeout_inactivity,
            total_deadline: now + timeout_total,
            inactivity_deadline: timeout_inactivity.map(|d| now + d),
            power_cycles: cli.power_cycles,
            cycle_on_timeout: !cli.no_cycle_on_timeout,

            auto_power_on: false,
            received_power_off: false,
            reached_timeout: false,
            quit: false,
            fastboot_done: false,
            tilde_run: 0,
            escape_pending: false,
            upload: None,
        })
    }

    /// Drives the session to completion and returns the process exit code
    /// (0 clean quit, 1 transport loss, 2 timeout before upload, 110 timeout
    /// after upload).
    pub async fn run(mut self) -> i32 {
        if let Err(e) = self.send(Message::new(MessageType::SelectBoard, board_payload(&self.board))).await {
            warn!("failed to send SELECT_BOARD: {e}");
            return 1;
        }

        let mut stdin = tokio::io::stdin();
        let mut stdin_buf = [0u8; 256];
        let mut stderr_buf = [0u8; 256];

        while !self.quit {
            if self.received_power_off || self.reached_timeout {
                self.maybe_cycle().await;
                if self.quit {
                    break;
                }
            }

            if let Some(chunk) = self.next_upload_chunk() {
                if let Err(e) = self.send(Message::new(MessageType::FastbootDownload, chunk)).await {
                    warn!("fastboot upload write failed: {e}");
                    break;
                }
            }

            let deadline = self.next_deadline();

            tokio::select! {
                biased;

                _ = tokio::time::sleep_until(deadline) => {
                    if self.inactivity_fires_first() {
                        warn!("timeout due to inactivity");
                    } else {
                        warn!("timeout reached");
                    }
                    self.reached_timeout = true;
                }

                n = stdin.read(&mut stdin_buf), if self.raw.is_tty() => {
                    match n {
                        Ok(0) | Err(_) => {}
                        Ok(n) => {
                            if let Err(e) = self.handle_stdin_bytes(&stdin_buf[..n]).await {
                                warn!("writing to transport failed: {e}");
                                break;
                            }
                        }
                    }
                }

                n = self.stderr_pipe.read(&mut stderr_buf) => {
                    match n {
                        Ok(0) => {
                            info!("EOF on ssh stderr");
                            break;
                        }
                        Ok(n) => {
                            let mut out = std::io::stderr();
                            use std::io::Write;
                            let _ = out.write_all(b"\x1b[94m");
                            let _ = out.write_all(&stderr_buf[..n]);
                            let _ = out.write_all(b"\x1b[0m");
                        }
                        Err(_) => {}
                    }
                }

                filled = self.codec.fill(&mut self.stdout_pipe) => {
                    match filled {
                        Ok(true) => {
                            self.reset_inactivity();
                        }
                        Ok(false) => {
                            info!("transport closed");
                            break;
                        }
                        Err(e) => {
                            warn!("protocol fault: {e}");
                            break;
                        }
                    }
                    if let Err(e) = self.drain_messages().await {
                        warn!("{e}");
                        break;
                    }
                }
            }
        }

        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        drop(self.raw);

        if self.reached_timeout {
            if self.fastboot_done {
                110
            } else {
                2
            }
        } else if self.quit || self.received_power_off {
            0
        } else {
            1
        }
    }

    async fn send(&mut self, msg: Message) -> std::io::Result<()> {
        write_message(&mut self.stdin_pipe, &msg).await
    }

    fn next_deadline(&self) -> Instant {
        match self.inactivity_deadline {
            Some(d) if d < self.total_deadline => d,
            _ => self.total_deadline,
        }
    }

    fn inactivity_fires_first(&self) -> bool {
        matches!(self.inactivity_deadline, Some(d) if d < self.total_deadline)
    }

    fn reset_inactivity(&mut self) {
        if let Some(d) = self.timeout_inactivity {
            self.inactivity_deadline = Some(Instant::now() + d);
        }
    }

    /// Implements the marker/timeout-triggered power-cycle decision in
    /// `cdba_client_main()`'s main loop, run before the select on each
    /// iteration where either condition is pending.
    async fn maybe_cycle(&mut self) {
        if self.power_cycles == Some(0) {
            self.quit = true;
            return;
        }
        if self.reached_timeout && !self.cycle_on_timeout {
            self.quit = true;
            return;
        }

        if let Some(n) = self.power_cycles {
            println!("power cycle ({} left)", n - 1);
        } else {
            println!("power cycle");
        }

        self.auto_power_on = true;
        if let Some(n) = self.power_cycles.as_mut() {
            *n -= 1;
        }
        self.received_power_off = false;
        self.reached_timeout = false;
        self.reset_inactivity();

        if let Err(e) = self.send(Message::empty(MessageType::PowerOff)).await {
            warn!("failed to send POWER_OFF: {e}");
            self.quit = true;
        }
    }

    /// One byte at a time, matching `tty_callback()`'s escape-prefix state
    /// machine (prefix byte `0x01`).
    async fn handle_stdin_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        for &b in bytes {
            if b == 0x01 && !self.escape_pending {
                self.escape_pending = true;
                continue;
            }
            if self.escape_pending {
                self.escape_pending = false;
                match b {
                    b'q' => self.quit = true,
                    b'P' => self.send(Message::empty(MessageType::PowerOn)).await?,
                    b'p' => self.send(Message::empty(MessageType::PowerOff)).await?,
                    b's' => self.send(Message::empty(MessageType::StatusUpdate)).await?,
                    b'V' => self.send(Message::empty(MessageType::VbusOn)).await?,
                    b'v' => self.send(Message::empty(MessageType::VbusOff)).await?,
                    b'B' => self.send(Message::empty(MessageType::SendBreak)).await?,
                    b'a' => self.send(Message::new(MessageType::Console, vec![0x01])).await?,
                    b'I' => self.send(Message::empty(MessageType::CaptureImage)).await?,
                    _ => {}
                }
                continue;
            }
            self.send(Message::new(MessageType::Console, vec![b])).await?;
        }
        Ok(())
    }

    async fn drain_messages(&mut self) -> anyhow::Result<()> {
        loop {
            let Some(msg) = self.codec.next_message()? else {
                return Ok(());
            };
            self.handle_message(msg).await?;
        }
    }

    async fn handle_message(&mut self, msg: Message) -> anyhow::Result<()> {
        match msg.ty {
            MessageType::Console => {
                self.scan_for_marker(&msg.payload);
                use std::io::Write;
                let mut out = std::io::stdout();
                out.write_all(&msg.payload)?;
                out.flush()?;
            }
            MessageType::StatusUpdate => {
                if let Some(file) = self.status_fifo.as_mut() {
                    file.write_all(&msg.payload).await?;
                    file.write_all(b"\n").await?;
                } else {
                    use std::io::Write;
                    let mut out = std::io::stdout();
                    out.write_all(&msg.payload)?;
                    out.write_all(b"\n")?;
                }
            }
            MessageType::SelectBoard => {
                // initial ack: unconditionally power the board on
                self.send(Message::empty(MessageType::PowerOn)).await?;
            }
            MessageType::PowerOn => {}
            MessageType::PowerOff => {
                if std::mem::take(&mut self.auto_power_on) {
                    tokio::time::sleep(POWER_CYCLE_SETTLE).await;
                    self.send(Message::empty(MessageType::PowerOn)).await?;
                }
            }
            MessageType::FastbootPresent => {
                let present = msg.payload.first().copied().unwrap_or(0) != 0;
                if present {
                    if !self.fastboot_done || self.repeat_uploads {
                        self.start_upload().await;
                    } else {
                        self.quit = true;
                    }
                } else {
                    self.fastboot_done = true;
                }
            }
            MessageType::FastbootDownload => {}
            MessageType::FastbootBoot | MessageType::FastbootReboot => {}
            MessageType::HardReset => {}
            MessageType::ListDevices => {
                if msg.payload.is_empty() {
                    self.quit = true;
                } else {
                    println!("{}", String::from_utf8_lossy(&msg.payload));
                }
            }
            MessageType::BoardInfo => {
                println!("{}", String::from_utf8_lossy(&msg.payload));
                self.quit = true;
            }
            MessageType::SendBreak | MessageType::VbusOn | MessageType::VbusOff | MessageType::FastbootContinue | MessageType::CaptureImage => {
                // acks to requests this role only ever sends; nothing to do
            }
        }
        Ok(())
    }

    /// Twenty consecutive `~` bytes anywhere in the console stream, exactly
    /// as `handle_console()` counts them (regardless of chunk boundaries).
    fn scan_for_marker(&mut self, data: &[u8]) {
        for &b in data {
            if b == b'~' {
                self.tilde_run += 1;
                if self.tilde_run == SHUTDOWN_MARKER_RUN {
                    self.received_power_off = true;
                    self.tilde_run = 0;
                }
            } else {
                self.tilde_run = 0;
            }
        }
    }

    async fn start_upload(&mut self) {
        let Some(path) = self.image.clone() else {
            return;
        };
        match tokio::fs::read(&path).await {
            Ok(data) => self.upload = Some(Upload { data, offset: 0 }),
            Err(e) => warn!("failed to read image {}: {e}", path.display()),
        }
    }

    /// Pops one upload chunk per loop iteration, matching the original's
    /// "one work item per select cycle" pacing; the trailing empty chunk is
    /// the zero-length sentinel.
    fn next_upload_chunk(&mut self) -> Option<Vec<u8>> {
        let upload = self.upload.as_mut()?;
        let remaining = upload.data.len() - upload.offset;
        let take = remaining.min(UPLOAD_CHUNK_SIZE);
        let chunk = upload.data[upload.offset..upload.offset + take].to_vec();
        upload.offset += take;
        if take == 0 {
            self.upload = None;
        }
        Some(chunk)
    }
}

fn board_payload(board: &str) -> Vec<u8> {
    let mut payload = board.as_bytes().to_vec();
    payload.push(0);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a `Controller` around `cat` in place of `ssh <host> cdba-server`
    /// — a real child process with piped stdio, just not the one this
    /// session will actually talk to, so the transport-owning fields stay
    /// concrete types without reaching for a mock process.
    async fn fake_controller() -> Controller {
        let mut child = Command::new("cat")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .expect("spawn cat");
        let stdin_pipe = child.stdin.take().unwrap();
        let stdout_pipe = child.stdout.take().unwrap();
        let stderr_pipe = child.stderr.take().unwrap();
        let now = Instant::now();
        Controller {
            child,
            stdin_pipe,
            stdout_pipe,
            stderr_pipe,
            codec: Codec::new(),
            raw: RawGuard::engage(),

            board: "testboard".to_string(),
            image: None,
            repeat_uploads: false,
            status_fifo: None,

            timeout_inactivity: None,
            total_deadline: now + Duration::from_secs(600),
            inactivity_deadline: None,
            power_cycles: None,
            cycle_on_timeout: true,

            auto_power_on: false,
            received_power_off: false,
            reached_timeout: false,
            quit: false,
            fastboot_done: false,
            tilde_run: 0,
            escape_pending: false,
            upload: None,
        }
    }

    #[test]
    fn board_payload_nul_terminates() {
        assert_eq!(board_payload("abc"), b"abc\0".to_vec());
    }

    #[tokio::test]
    async fn scan_for_marker_needs_the_full_twenty_run() {
        let mut c = fake_controller().await;
        c.scan_for_marker(&vec![b'~'; 19]);
        assert!(!c.received_power_off);
        c.scan_for_marker(b"~");
        assert!(c.received_power_off);
        let _ = c.child.start_kill();
    }

    #[tokio::test]
    async fn scan_for_marker_resets_the_run_on_any_other_byte() {
        let mut c = fake_controller().await;
        c.scan_for_marker(&vec![b'~'; 10]);
        c.scan_for_marker(b"x");
        c.scan_for_marker(&vec![b'~'; 19]);
        assert!(!c.received_power_off);
        let _ = c.child.start_kill();
    }

    #[tokio::test]
    async fn upload_chunks_end_with_a_zero_length_sentinel() {
        let mut c = fake_controller().await;
        c.upload = Some(Upload {
            data: vec![1, 2, 3],
            offset: 0,
        });
        let chunk = c.next_upload_chunk().unwrap();
        assert_eq!(chunk, vec![1, 2, 3]);
        assert!(c.upload.is_some());
        let sentinel = c.next_upload_chunk().unwrap();
        assert!(sentinel.is_empty());
        assert!(c.upload.is_none());
        let _ = c.child.start_kill();
    }

    #[tokio::test]
    async fn maybe_cycle_decrements_the_remaining_count() {
        let mut c = fake_controller().await;
        c.power_cycles = Some(2);
        c.reached_timeout = true;
        c.maybe_cycle().await;
        assert_eq!(c.power_cycles, Some(1));
        assert!(c.auto_power_on);
        assert!(!c.reached_timeout);
        let _ = c.child.start_kill();
    }

    #[tokio::test]
    async fn maybe_cycle_quits_once_cycles_are_exhausted() {
        let mut c = fake_controller().await;
        c.power_cycles = Some(0);
        c.reached_timeout = true;
        c.maybe_cycle().await;
        assert!(!c.auto_power_on);
        assert!(c.quit);
        let _ = c.child.start_kill();
    }

    #[tokio::test]
    async fn maybe_cycle_quits_on_timeout_when_cycling_is_disabled() {
        let mut c = fake_controller().await;
        c.cycle_on_timeout = false;
        c.reached_timeout = true;
        c.maybe_cycle().await;
        assert!(!c.auto_power_on);
        assert!(c.quit);
        assert!(c.reached_timeout, "left set so the exit-code check still sees it");
        let _ = c.child.start_kill();
    }

    #[tokio::test]
    async fn select_board_ack_triggers_an_unconditional_power_on() {
        let mut c = fake_controller().await;
        c.handle_message(Message::empty(MessageType::SelectBoard))
            .await
            .unwrap();
        // Piped through `cat`, so the POWER_ON request we just sent comes
        // straight back on stdout.
        c.codec.fill(&mut c.stdout_pipe).await.unwrap();
        let echoed = c.codec.next_message().unwrap().unwrap();
        assert_eq!(echoed.ty, MessageType::PowerOn);
        let _ = c.child.start_kill();
    }

    #[tokio::test(start_paused = true)]
    async fn power_off_ack_repowers_during_an_automated_cycle() {
        let mut c = fake_controller().await;
        c.auto_power_on = true;
        c.handle_message(Message::empty(MessageType::PowerOff))
            .await
            .unwrap();
        c.codec.fill(&mut c.stdout_pipe).await.unwrap();
        let echoed = c.codec.next_message().unwrap().unwrap();
        assert_eq!(echoed.ty, MessageType::PowerOn);
        let _ = c.child.start_kill();
    }

    #[tokio::test(start_paused = true)]
    async fn auto_power_on_does_not_survive_a_later_manual_power_off() {
        let mut c = fake_controller().await;
        c.auto_power_on = true;
        c.handle_message(Message::empty(MessageType::PowerOff))
            .await
            .unwrap();
        c.codec.fill(&mut c.stdout_pipe).await.unwrap();
        let echoed = c.codec.next_message().unwrap().unwrap();
        assert_eq!(echoed.ty, MessageType::PowerOn);
        assert!(!c.auto_power_on);

        // A later, manual power-off (e.g. the `p` escape key) must not
        // trigger another automatic power-on.
        c.handle_message(Message::empty(MessageType::PowerOff))
            .await
            .unwrap();
        let fill = tokio::time::timeout(Duration::from_millis(10), c.codec.fill(&mut c.stdout_pipe)).await;
        assert!(fill.is_err(), "no further bytes should have been written");
        let _ = c.child.start_kill();
    }

    #[tokio::test]
    async fn empty_list_devices_frame_ends_the_session() {
        let mut c = fake_controller().await;
        c.handle_message(Message::empty(MessageType::ListDevices))
            .await
            .unwrap();
        assert!(c.quit);
        let _ = c.child.start_kill();
    }
}
