//! The fastboot USB bulk session, grounded on `fastboot.c`.
//!
//! Hotplug detection by USB serial number, a descriptor walk to find the
//! vendor-specific bulk interface (class 0xff, subclass 0x42, protocol
//! 0x03), and the INFO/OKAY/FAIL/DATA response protocol over raw bulk
//! transfers. `rusb` has no native async binding and no hotplug event
//! stream usable from a single-threaded tokio runtime without its own
//! thread, so both device discovery and each transfer run inside
//! `tokio::task::spawn_blocking`, the same shape the agent already uses to
//! isolate a blocking child-process read loop.

use std::sync::Arc;
use std::time::Duration;

use rusb::{Device, DeviceHandle, GlobalContext};
use tokio::task;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::FastbootError;

const MAX_BULK_CHUNK: usize = 16 * 1024;
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(1);
const HOTPLUG_POLL_INTERVAL: Duration = Duration::from_millis(200);
const CLASS_FASTBOOT: u8 = 0xff;
const SUBCLASS_FASTBOOT: u8 = 0x42;
const PROTOCOL_FASTBOOT: u8 = 0x03;

/// One matched and claimed fastboot USB interface. Cheaply `Clone`: the
/// underlying `DeviceHandle` is reference-counted, which lets the
/// dispatcher's disconnect-polling task keep its own handle to the same
/// claimed interface that `Session` uses for uploads.
#[derive(Clone)]
pub struct FastbootHandle {
    handle: Arc<DeviceHandle<GlobalContext>>,
    ep_in: u8,
    ep_out: u8,
    serial: String,
}

enum Response {
    Okay(Vec<u8>),
    Data(usize),
}

fn find_bulk_interface(
    device: &Device<GlobalContext>,
) -> Result<Option<(u8, u8, u8)>, FastbootError> {
    let config = device
        .active_config_descriptor()
        .map_err(FastbootError::Usb)?;

    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            if descriptor.class_code() != CLASS_FASTBOOT
                || descriptor.sub_class_code() != SUBCLASS_FASTBOOT
                || descriptor.protocol_code() != PROTOCOL_FASTBOOT
            {
                continue;
            }

            let mut ep_in = None;
            let mut ep_out = None;
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() != rusb::TransferType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    rusb::Direction::In => ep_in = Some(endpoint.address()),
                    rusb::Direction::Out => ep_out = Some(endpoint.address()),
                }
            }

            if let (Some(ep_in), Some(ep_out)) = (ep_in, ep_out) {
                return Ok(Some((descriptor.interface_number(), ep_in, ep_out)));
            }
        }
    }

    Ok(None)
}

fn try_open(serial: &str) -> Result<Option<FastbootHandle>, FastbootError> {
    let devices = rusb::devices().map_err(FastbootError::Usb)?;

    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };
        let Ok(handle) = device.open() else {
            continue;
        };
        let device_serial = match handle.read_serial_number_string_ascii(&descriptor, TRANSFER_TIMEOUT) {
            Ok(s) => s,
            Err(_) => continue,
        };
        if device_serial != serial {
            continue;
        }

        let Some((iface, ep_in, ep_out)) = find_bulk_interface(&device)? else {
            continue;
        };
        handle
            .claim_interface(iface)
            .map_err(FastbootError::Usb)?;

        return Ok(Some(FastbootHandle {
            handle: Arc::new(handle),
            ep_in,
            ep_out,
            serial: serial.to_string(),
        }));
    }

    Ok(None)
}

impl FastbootHandle {
    /// Polls for a USB device with the given serial number until it
    /// appears or `cancel` fires, mirroring the original's udev
    /// enumerate-then-monitor sequence with a periodic re-scan instead of
    /// a native hotplug event subscription.
    pub async fn wait_for_device(serial: String, cancel: CancellationToken) -> Option<Self> {
        loop {
            let probe_serial = serial.clone();
            let found = task::spawn_blocking(move || try_open(&probe_serial))
                .await
                .ok()
                .and_then(|r| r.ok())
                .flatten();

            if let Some(handle) = found {
                info!(serial = %handle.serial, "fastboot device attached");
                return Some(handle);
            }

            tokio::select! {
                _ = sleep(HOTPLUG_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Re-enumerates USB devices looking for this handle's serial number,
    /// used to detect disconnect since `rusb` surfaces no
    /// per-handle "still attached" signal on its own.
    pub async fn still_present(&self) -> bool {
        let serial = self.serial.clone();
        task::spawn_blocking(move || {
            rusb::devices().map(|devices| {
                devices.iter().any(|device| {
                    device
                        .device_descriptor()
                        .ok()
                        .and_then(|descriptor| {
                            device
                                .open()
                                .ok()?
                                .read_serial_number_string_ascii(&descriptor, TRANSFER_TIMEOUT)
                                .ok()
                        })
                        .as_deref()
                        == Some(serial.as_str())
                })
            })
        })
        .await
        .unwrap_or(Ok(false))
        .unwrap_or(false)
    }

    async fn write_bulk(&self, ep: u8, data: Vec<u8>) -> Result<usize, FastbootError> {
        // rusb's blocking I/O wrapped per-call; transfers are short-lived
        // (bounded by `TRANSFER_TIMEOUT`) so this never stalls the single
        // tokio worker thread for long.
        let handle = Arc::clone(&self.handle);
        task::spawn_blocking(move || handle.write_bulk(ep, &data, TRANSFER_TIMEOUT))
            .await
            .map_err(|_| FastbootError::Timeout)?
            .map_err(FastbootError::Usb)
    }

    async fn read_bulk(&self, ep: u8) -> Result<Vec<u8>, FastbootError> {
        let handle = Arc::clone(&self.handle);
        let buf = task::spawn_blocking(move || {
            let mut buf = vec![0u8; 64];
            let n = handle.read_bulk(ep, &mut buf, TRANSFER_TIMEOUT)?;
            buf.truncate(n);
            Ok::<_, rusb::Error>(buf)
        })
        .await
        .map_err(|_| FastbootError::Timeout)?
        .map_err(FastbootError::Usb)?;
        Ok(buf)
    }

    async fn read_response(&self, out: &mut Vec<u8>) -> Result<Response, FastbootError> {
        loop {
            let raw = self.read_bulk(self.ep_in).await?;
            if raw.len() < 4 {
                return Err(FastbootError::UnexpectedResponse(raw));
            }
            let (tag, body) = raw.split_at(4);
            match tag {
                b"INFO" => {
                    debug!(info = %String::from_utf8_lossy(body), "fastboot info");
                    continue;
                }
                b"OKAY" => return Ok(Response::Okay(body.to_vec())),
                b"FAIL" => {
                    return Err(FastbootError::Fail(String::from_utf8_lossy(body).to_string()))
                }
                b"DATA" => {
                    let len = usize::from_str_radix(&String::from_utf8_lossy(body), 16)
                        .map_err(|_| FastbootError::UnexpectedResponse(raw.clone()))?;
                    out.clear();
                    return Ok(Response::Data(len));
                }
                _ => return Err(FastbootError::UnexpectedResponse(raw)),
            }
        }
    }

    async fn command(&self, cmd: &str) -> Result<Vec<u8>, FastbootError> {
        self.write_bulk(self.ep_out, cmd.as_bytes().to_vec()).await?;
        let mut scratch = Vec::new();
        match self.read_response(&mut scratch).await? {
            Response::Okay(payload) => Ok(payload),
            Response::Data(_) => Ok(Vec::new()),
        }
    }

    pub async fn getvar(&self, var: &str) -> Result<String, FastbootError> {
        let payload = self.command(&format!("getvar:{var}")).await?;
        Ok(String::from_utf8_lossy(&payload).to_string())
    }

    /// Uploads `data` via `download:<len-in-hex>` followed by the raw bytes
    /// in ≤16 KiB chunks, matching `MAX_USBFS_BULK_SIZE`.
    pub async fn download(&self, data: &[u8]) -> Result<(), FastbootError> {
        self.write_bulk(self.ep_out, format!("download:{:08x}", data.len()).into_bytes())
            .await?;

        let mut scratch = Vec::new();
        match self.read_response(&mut scratch).await? {
            Response::Data(len) if len == data.len() => {}
            Response::Data(len) => {
                return Err(FastbootError::Fail(format!(
                    "remote requested {len} bytes, expected {}",
                    data.len()
                )))
            }
            _ => return Err(FastbootError::Fail("remote rejected download request".into())),
        }

        for chunk in data.chunks(MAX_BULK_CHUNK) {
            self.write_bulk(self.ep_out, chunk.to_vec()).await?;
        }

        match self.read_response(&mut scratch).await? {
            Response::Okay(_) => Ok(()),
            _ => Err(FastbootError::Fail("download not acknowledged".into())),
        }
    }

    pub async fn boot(&self) -> Result<(), FastbootError> {
        self.command("boot").await.map(|_| ())
    }

    pub async fn continue_boot(&self) -> Result<(), FastbootError> {
        self.command("continue").await.map(|_| ())
    }

    pub async fn set_active(&self, slot: &str) -> Result<(), FastbootError> {
        self.command(&format!("set_active:{slot}")).await.map(|_| ())
    }

    pub async fn flash(&self, partition: &str) -> Result<(), FastbootError> {
        self.command(&format!("flash:{partition}")).await.map(|_| ())
    }

    pub async fn erase(&self, partition: &str) -> Result<(), FastbootError> {
        self.command(&format!("erase:{partition}")).await.map(|_| ())
    }

    pub async fn reboot(&self) -> Result<(), FastbootError> {
        self.command("reboot").await.map(|_| ())
    }
}
