//! The agent-side protocol dispatcher, grounded on `handle_stdin()` in
//! `cdba-server.c`: one loop reads frames off the transport and drives
//! exactly the session state the original's big `switch` does, plus two
//! things that loop can't express directly in its own single-threaded
//! `select(2)` shape — status telemetry lines and fastboot hotplug
//! events — which arrive here over an internal channel instead.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cdba_protocol::{write_message, Codec, Message, MessageType};

use crate::device::{whoami, BoardConfig, Session};
use crate::fastboot::FastbootHandle;

/// Fed into the dispatch loop by tasks that can't borrow the owning
/// `Session` across an `.await` point of their own.
enum Event {
    Status(String),
    ConsoleData(Vec<u8>),
    FastbootAttached(FastbootHandle),
    FastbootDetached,
}

pub struct Agent<R, W> {
    reader: R,
    writer: W,
    boards: Vec<BoardConfig>,
    username: String,
    session: Option<Session>,
    transport_gone: CancellationToken,
    hotplug_cancel: CancellationToken,
    hotplug_task: Option<tokio::task::JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    fastboot_buf: Vec<u8>,
}

impl<R, W> Agent<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, boards: Vec<BoardConfig>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            reader,
            writer,
            boards,
            username: whoami(),
            session: None,
            transport_gone: CancellationToken::new(),
            hotplug_cancel: CancellationToken::new(),
            hotplug_task: None,
            events_tx,
            events_rx,
            fastboot_buf: Vec::new(),
        }
    }

    /// Runs until the transport closes or a protocol fault/unknown tag
    /// forces the process to end, matching `watch_run()` returning.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut codec = Codec::new();

        let outcome = loop {
            match codec.next_message() {
                Ok(Some(msg)) => {
                    if let Err(e) = self.dispatch(msg).await {
                        break Err(e);
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => break Err(e.into()),
            }

            tokio::select! {
                biased;
                Some(event) = self.events_rx.recv() => {
                    if let Err(e) = self.handle_event(event).await {
                        break Err(e);
                    }
                }
                filled = codec.fill(&mut self.reader) => {
                    match filled {
                        Ok(true) => {}
                        Ok(false) => {
                            info!("transport closed");
                            break Ok(());
                        }
                        Err(e) => break Err(e.into()),
                    }
                }
            }
        };

        self.transport_gone.cancel();
        self.hotplug_cancel.cancel();
        if let Some(task) = self.hotplug_task.take() {
            task.abort();
        }
        if let Some(mut session) = self.session.take() {
            let _ = session.close().await;
        }
        outcome
    }

    async fn send(&mut self, msg: Message) -> anyhow::Result<()> {
        write_message(&mut self.writer, &msg).await?;
        Ok(())
    }

    async fn handle_event(&mut self, event: Event) -> anyhow::Result<()> {
        match event {
            Event::Status(line) => {
                self.send(Message::new(MessageType::StatusUpdate, line.into_bytes()))
                    .await
            }
            Event::ConsoleData(data) => self.send(Message::new(MessageType::Console, data)).await,
            Event::FastbootAttached(handle) => {
                if let Some(session) = self.session.as_mut() {
                    session.set_fastboot(handle);
                }
                self.send(Message::new(MessageType::FastbootPresent, vec![1]))
                    .await
            }
            Event::FastbootDetached => {
                if let Some(session) = self.session.as_mut() {
                    session.clear_fastboot();
                }
                self.watch_fastboot();
                self.send(Message::new(MessageType::FastbootPresent, vec![0]))
                    .await
            }
        }
    }

    /// Spawns (or respawns) the background task that waits for the
    /// selected board's fastboot USB serial to appear, then polls for its
    /// disconnect, feeding both transitions back as [`Event`]s.
    fn watch_fastboot(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if let Some(task) = self.hotplug_task.take() {
            task.abort();
        }
        let Some(serial) = session.fastboot_serial().map(str::to_string) else {
            return;
        };
        self.hotplug_cancel = CancellationToken::new();
        let cancel = self.hotplug_cancel.clone();
        let tx = self.events_tx.clone();

        self.hotplug_task = Some(tokio::spawn(async move {
            loop {
                let Some(handle) = FastbootHandle::wait_for_device(serial.clone(), cancel.clone()).await
                else {
                    return; // cancelled
                };
                if tx.send(Event::FastbootAttached(handle.clone())).is_err() {
                    return;
                }

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {
                            if !handle.still_present().await {
                                if tx.send(Event::FastbootDetached).is_err() {
                                    return;
                                }
                                break;
                            }
                        }
                    }
                }
            }
        }));
    }

    async fn dispatch(&mut self, msg: Message) -> anyhow::Result<()> {
        match msg.ty {
            MessageType::SelectBoard => self.handle_select_board(&msg.payload).await?,
            MessageType::Console => {
                if let Some(session) = self.session.as_mut() {
                    if let Err(e) = session.write_console(&msg.payload).await {
                        warn!("console write failed: {e}");
                    }
                }
            }
            MessageType::HardReset => debug!("ignoring reserved HARDRESET tag"),
            MessageType::PowerOn => {
                if let Some(session) = self.session.as_mut() {
                    session.power_on().await;
                }
                self.send(Message::empty(MessageType::PowerOn)).await?;
            }
            MessageType::PowerOff => {
                if let Some(session) = self.session.as_mut() {
                    if let Err(e) = session.power_off().await {
                        warn!("power off failed: {e}");
                    }
                }
                self.send(Message::empty(MessageType::PowerOff)).await?;
            }
            MessageType::VbusOn => {
                if let Some(session) = self.session.as_mut() {
                    let _ = session.usb(true).await;
                }
            }
            MessageType::VbusOff => {
                if let Some(session) = self.session.as_mut() {
                    let _ = session.usb(false).await;
                }
            }
            MessageType::SendBreak => {
                if let Some(session) = self.session.as_mut() {
                    let _ = session.send_break().await;
                }
            }
            MessageType::StatusUpdate => {
                if let Some(session) = self.session.as_mut() {
                    if let Err(e) = session.status_enable(self.events_status_sink()).await {
                        warn!("enabling status telemetry failed: {e}");
                    }
                }
            }
            MessageType::FastbootDownload => self.handle_fastboot_download(msg.payload).await?,
            MessageType::FastbootContinue => {
                if let Some(session) = self.session.as_ref() {
                    if let Err(e) = session.fastboot_continue().await {
                        warn!("fastboot continue failed: {e}");
                    }
                }
                self.send(Message::empty(MessageType::FastbootContinue)).await?;
            }
            MessageType::ListDevices => self.handle_list_devices().await?,
            MessageType::BoardInfo => self.handle_board_info(&msg.payload).await?,
            // Never sent by a correctly behaving controller; reserved for
            // symmetry with the wire format's closed tag set.
            MessageType::FastbootPresent
            | MessageType::FastbootBoot
            | MessageType::FastbootReboot
            | MessageType::CaptureImage => {
                error!(tag = %msg.ty, "controller sent a controller-only tag");
                anyhow::bail!("unexpected tag {} received from controller", msg.ty);
            }
        }
        Ok(())
    }

    /// A sender that forwards status-cmd/backend telemetry lines into this
    /// agent's own event channel rather than straight onto the wire, so the
    /// dispatch loop stays the single writer of the transport.
    fn events_status_sink(&self) -> mpsc::UnboundedSender<String> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let forward = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if forward.send(Event::Status(line)).is_err() {
                    break;
                }
            }
        });
        tx
    }

    /// Same shape as [`Self::events_status_sink`], but for raw bytes read
    /// off the board's console.
    fn events_console_sink(&self) -> mpsc::UnboundedSender<Vec<u8>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let forward = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if forward.send(Event::ConsoleData(data)).is_err() {
                    break;
                }
            }
        });
        tx
    }

    async fn handle_select_board(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let name = String::from_utf8_lossy(payload).trim_matches('\0').to_string();
        let Some(board) = self.boards.iter().find(|b| b.board == name).cloned() else {
            error!(board = %name, "unknown board requested, quitting");
            anyhow::bail!("unknown board {name}");
        };

        match Session::open(board, Some(&self.username), &self.transport_gone).await {
            Ok(mut session) => {
                session.spawn_console_reader(self.events_console_sink());
                self.session = Some(session);
                self.send(Message::empty(MessageType::SelectBoard)).await?;
                self.watch_fastboot();
            }
            Err(e) => {
                error!(board = %name, "failed to open board: {e}");
                anyhow::bail!("failed to open board {name}: {e}");
            }
        }
        Ok(())
    }

    /// Accumulates chunks into one scratch buffer; a zero-length chunk is
    /// the sentinel that the whole image has arrived (`msg_fastboot_download`
    /// in `cdba-server.c`), at which point it's handed to `device_boot()`'s
    /// Rust counterpart and the buffer is cleared for the next upload.
    async fn handle_fastboot_download(&mut self, chunk: Vec<u8>) -> anyhow::Result<()> {
        if chunk.is_empty() {
            let image = std::mem::take(&mut self.fastboot_buf);
            if let Some(session) = self.session.as_mut() {
                if let Err(e) = session.boot_fastboot(image).await {
                    warn!("fastboot boot sequence failed: {e}");
                }
            }
            self.send(Message::empty(MessageType::FastbootDownload)).await?;
        } else {
            self.fastboot_buf.extend_from_slice(&chunk);
        }
        Ok(())
    }

    async fn handle_list_devices(&mut self) -> anyhow::Result<()> {
        let username = self.username.clone();
        for board in self.boards.clone() {
            if !board.user_allowed(Some(&username)) {
                continue;
            }
            let line = match &board.name {
                Some(name) => format!("{:<20} {}", board.board, name),
                None => board.board.clone(),
            };
            self.send(Message::new(MessageType::ListDevices, line.into_bytes()))
                .await?;
        }
        self.send(Message::empty(MessageType::ListDevices)).await
    }

    async fn handle_board_info(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let requested = String::from_utf8_lossy(payload).to_string();
        let username = self.username.clone();
        let description = self
            .boards
            .iter()
            .find(|b| b.board == requested && b.user_allowed(Some(&username)))
            .and_then(|b| b.description.clone())
            .unwrap_or_default();
        self.send(Message::new(MessageType::BoardInfo, description.into_bytes()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendConfig;
    use crate::device::BootStrategy;

    fn board(board: &str, users: Option<Vec<String>>, description: Option<&str>) -> BoardConfig {
        BoardConfig {
            board: board.to_string(),
            name: None,
            description: description.map(String::from),
            users,
            console: Some("/dev/null".to_string()),
            voltage_mv: None,
            fastboot_serial: Some(format!("{board}-serial")),
            fastboot_set_active: None,
            fastboot_key_timeout: None,
            boot_strategy: BootStrategy::Boot,
            usb_always_on: false,
            power_always_on: false,
            ppps_path: None,
            ppps3_path: None,
            status_cmd: None,
            video_device: None,
            backend: BackendConfig::External {
                helper: "/bin/true".to_string(),
            },
        }
    }

    /// Returns the agent plus the peer ends of its stdin/stdout duplex
    /// pipes — kept alive by the caller for the test's duration so writes
    /// to `agent.writer` don't see a dropped peer and fail as a broken pipe.
    fn agent_with(
        boards: Vec<BoardConfig>,
        username: &str,
    ) -> (
        Agent<tokio::io::DuplexStream, tokio::io::DuplexStream>,
        tokio::io::DuplexStream,
        tokio::io::DuplexStream,
    ) {
        let (reader, peer_in) = tokio::io::duplex(4096);
        let (peer_out, writer) = tokio::io::duplex(4096);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let agent = Agent {
            reader,
            writer,
            boards,
            username: username.to_string(),
            session: None,
            transport_gone: CancellationToken::new(),
            hotplug_cancel: CancellationToken::new(),
            hotplug_task: None,
            events_tx,
            events_rx,
            fastboot_buf: Vec::new(),
        };
        (agent, peer_in, peer_out)
    }

    #[tokio::test]
    async fn list_devices_filters_by_user_and_terminates_with_empty_frame() {
        let boards = vec![
            board("alpha", None, None),
            board("beta", Some(vec!["someone-else".to_string()]), None),
        ];
        let (mut agent, _peer_in, _peer_out) = agent_with(boards, "me");
        agent.handle_list_devices().await.unwrap();
    }

    #[tokio::test]
    async fn board_info_denies_access_with_empty_description() {
        let boards = vec![board(
            "alpha",
            Some(vec!["someone-else".to_string()]),
            Some("a board"),
        )];
        let (mut agent, _peer_in, _peer_out) = agent_with(boards, "me");
        agent.handle_board_info(b"alpha").await.unwrap();
    }

    #[tokio::test]
    async fn board_info_returns_description_for_allowed_user() {
        let boards = vec![board("alpha", None, Some("a board"))];
        let (mut agent, _peer_in, _peer_out) = agent_with(boards, "me");
        agent.handle_board_info(b"alpha").await.unwrap();
    }

    #[tokio::test]
    async fn select_board_rejects_unknown_name() {
        let boards = vec![board("alpha", None, None)];
        let (mut agent, _peer_in, _peer_out) = agent_with(boards, "me");
        let err = agent.handle_select_board(b"nonexistent").await.unwrap_err();
        assert!(err.to_string().contains("unknown board"));
        assert!(agent.session.is_none());
    }

    #[tokio::test]
    async fn hardreset_is_a_silent_no_op() {
        let (mut agent, _peer_in, _peer_out) = agent_with(vec![], "me");
        agent
            .dispatch(Message::empty(MessageType::HardReset))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn controller_only_tags_are_rejected_as_protocol_faults() {
        let (mut agent, _peer_in, _peer_out) = agent_with(vec![], "me");
        let err = agent
            .dispatch(Message::empty(MessageType::FastbootPresent))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unexpected tag"));
    }

    #[tokio::test]
    async fn console_without_a_selected_board_is_dropped_silently() {
        let (mut agent, _peer_in, _peer_out) = agent_with(vec![], "me");
        agent
            .dispatch(Message::new(MessageType::Console, b"hello".to_vec()))
            .await
            .unwrap();
    }
}
