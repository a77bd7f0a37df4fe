//! Raw-mode terminal handling for standard input, grounded on
//! `tty_unbuffer()`/`tty_reset()` in `cdba-client.c`.

use std::os::unix::io::BorrowedFd;

use nix::sys::termios::{self, LocalFlags, InputFlags, SetArg, SpecialCharacterIndices, Termios};
use nix::unistd::isatty;

/// Puts stdin into raw mode for the lifetime of the guard, restoring the
/// original settings on drop. `None` when stdin isn't a terminal (piped
/// input), in which case the controller simply never reads escape bytes.
pub struct RawGuard {
    original: Option<Termios>,
}

impl RawGuard {
    pub fn engage() -> Self {
        let stdin = std::io::stdin();
        let fd = unsafe { BorrowedFd::borrow_raw(0) };
        if !isatty(&stdin).unwrap_or(false) {
            return Self { original: None };
        }

        let Ok(original) = termios::tcgetattr(fd) else {
            return Self { original: None };
        };

        let mut raw = original.clone();
        raw.local_flags
            .remove(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG);
        raw.input_flags.remove(
            InputFlags::ISTRIP
                | InputFlags::IGNCR
                | InputFlags::ICRNL
                | InputFlags::INLCR
                | InputFlags::IXOFF
                | InputFlags::IXON,
        );
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;

        if termios::tcsetattr(fd, SetArg::TCSANOW, &raw).is_err() {
            return Self { original: None };
        }

        Self {
            original: Some(original),
        }
    }

    pub fn is_tty(&self) -> bool {
        self.original.is_some()
    }
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            let fd = unsafe { BorrowedFd::borrow_raw(0) };
            let _ = termios::tcflush(fd, termios::FlushArg::TCIFLUSH);
            let _ = termios::tcsetattr(fd, SetArg::TCSANOW, &original);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test runs have stdin redirected to something that isn't a terminal,
    /// so `engage()` must no-op rather than fail.
    #[test]
    fn engage_is_a_no_op_when_stdin_is_not_a_tty() {
        let guard = RawGuard::engage();
        assert!(!guard.is_tty());
    }

    #[test]
    fn drop_on_a_non_tty_guard_does_not_panic() {
        drop(RawGuard::engage());
    }
}
