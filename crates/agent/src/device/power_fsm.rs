//! The timed power-up sequence, grounded on `device_tick()` in `device.c`.
//!
//! START → CONNECT → (PRESS → RELEASE_PWR)? → RELEASE_FASTBOOT? → RUNNING.
//! The original drives this with one-shot timers re-arming themselves from
//! a single callback; here it is a straight-line async function with a
//! `sleep` between each step, which reads the same way and composes with
//! cancellation far more simply than re-deriving a callback chain.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backends::{ControlBackend, Key};
use crate::error::BackendError;

use super::ppps;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Start,
    Connect,
    Press,
    ReleasePwr,
    ReleaseFastboot,
    Running,
}

/// Runs the power-up sequence against `backend`, energizing USB in lockstep
/// with power in the CONNECT step (`device_tick`'s
/// `device_impl_power(true); device_usb(true);`), honoring `device_usb`'s
/// routing: a ppps-equipped board drives its port over sysfs, otherwise the
/// control backend's own `usb()` is used.
///
/// Returns the state reached when `cancel` fires (a concurrent POWER_OFF
/// preempts the sequence, cancelling any pending timer)
/// or `Running` on normal completion.
pub async fn run_power_up(
    backend: &mut dyn ControlBackend,
    has_power_key: bool,
    fastboot_key_timeout: Option<Duration>,
    ppps_path: Option<&str>,
    ppps3_path: Option<&str>,
    cancel: &CancellationToken,
) -> Result<PowerState, BackendError> {
    let mut state = PowerState::Start;
    loop {
        debug!(?state, "power-up fsm");
        let delay = match state {
            PowerState::Start => {
                if fastboot_key_timeout.is_some() {
                    backend.key(Key::Fastboot, true).await?;
                }
                if has_power_key {
                    backend.key(Key::Power, false).await?;
                }
                state = PowerState::Connect;
                Duration::from_millis(10)
            }
            PowerState::Connect => {
                backend.power(true).await?;
                if let Some(path) = ppps_path {
                    ppps::power(path, ppps3_path, true).await;
                } else {
                    backend.usb(true).await?;
                }
                if has_power_key {
                    state = PowerState::Press;
                    Duration::from_millis(250)
                } else if let Some(timeout) = fastboot_key_timeout {
                    state = PowerState::ReleaseFastboot;
                    timeout
                } else {
                    state = PowerState::Running;
                    Duration::ZERO
                }
            }
            PowerState::Press => {
                backend.key(Key::Power, true).await?;
                state = PowerState::ReleasePwr;
                Duration::from_millis(100)
            }
            PowerState::ReleasePwr => {
                backend.key(Key::Power, false).await?;
                if let Some(timeout) = fastboot_key_timeout {
                    state = PowerState::ReleaseFastboot;
                    timeout
                } else {
                    state = PowerState::Running;
                    Duration::ZERO
                }
            }
            PowerState::ReleaseFastboot => {
                backend.key(Key::Fastboot, false).await?;
                state = PowerState::Running;
                Duration::ZERO
            }
            PowerState::Running => return Ok(state),
        };

        if delay.is_zero() {
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Ok(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingBackend {
        calls: Arc<Mutex<Vec<String>>>,
        has_power_key: bool,
    }

    #[async_trait]
    impl ControlBackend for RecordingBackend {
        fn has_power_key(&self) -> bool {
            self.has_power_key
        }

        async fn power(&mut self, on: bool) -> Result<(), BackendError> {
            self.calls.lock().unwrap().push(format!("power({on})"));
            Ok(())
        }

        async fn usb(&mut self, on: bool) -> Result<(), BackendError> {
            self.calls.lock().unwrap().push(format!("usb({on})"));
            Ok(())
        }

        async fn key(&mut self, key: Key, asserted: bool) -> Result<(), BackendError> {
            self.calls.lock().unwrap().push(format!("key({key:?}, {asserted})"));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn visits_every_state_once_with_power_key_and_no_fastboot_timeout() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut backend = RecordingBackend {
            calls: calls.clone(),
            has_power_key: true,
        };
        let cancel = CancellationToken::new();
        let state = run_power_up(&mut backend, true, None, None, None, &cancel)
            .await
            .unwrap();
        assert_eq!(state, PowerState::Running);
        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                "key(Power, false)",
                "power(true)",
                "usb(true)",
                "key(Power, true)",
                "key(Power, false)",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_ppps_board_energizes_usb_through_the_backend_at_connect() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut backend = RecordingBackend {
            calls: calls.clone(),
            has_power_key: false,
        };
        let cancel = CancellationToken::new();
        run_power_up(&mut backend, false, None, None, None, &cancel)
            .await
            .unwrap();
        assert!(calls.lock().unwrap().contains(&"usb(true)".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_sequence_before_running() {
        let mut backend = RecordingBackend::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let state = run_power_up(&mut backend, true, None, None, None, &cancel)
            .await
            .unwrap();
        assert_ne!(state, PowerState::Running);
    }
}
