//! Error kinds for the agent side, grouped by the subsystem that raises
//! them. Leaf errors are concrete `thiserror` enums so callers can match on
//! them; they are composed into `anyhow::Result` at task boundaries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("no inventory file found at ./.cdba or /etc/cdba")]
    NotFound,
    #[error("failed to read inventory file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse inventory YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("board \"{board}\" is insufficiently defined: missing {field}")]
    IncompleteBoard { board: String, field: &'static str },
    #[error("board \"{board}\" selects no control backend")]
    NoBackend { board: String },
    #[error("board \"{board}\" selects more than one control backend")]
    MultipleBackends { board: String },
    #[error("unknown device inventory key \"{0}\"")]
    UnknownKey(String),
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to open backend: {0}")]
    Open(String),
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend protocol error: {0}")]
    Protocol(String),
    #[error("lock contention exceeded for board {0}")]
    LockTimeout(String),
}

#[derive(Debug, Error)]
pub enum FastbootError {
    #[error("usb error: {0}")]
    Usb(#[from] rusb::Error),
    #[error("malformed USB descriptor: {0}")]
    MalformedDescriptor(String),
    #[error("no matching fastboot interface found")]
    NoInterface,
    #[error("fastboot command failed: {0}")]
    Fail(String),
    #[error("unexpected fastboot response: {0:?}")]
    UnexpectedResponse(Vec<u8>),
    #[error("fastboot transfer timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum ProtocolFault {
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error(transparent)]
    Codec(#[from] cdba_protocol::CodecError),
}
