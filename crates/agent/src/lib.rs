//! Board-farm control agent library.
//!
//! Runs on the host wired to a board's hardware, one process per client
//! connection (its stdio pair is conventionally the far end of a client's
//! `ssh` session). Exposes the board registry, control/console backend
//! abstraction, the power-up state machine, the fastboot USB session, and
//! the protocol dispatcher that ties them together.

pub mod backends;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod fastboot;
pub mod status;
