//! Host-side per-port USB power switching, grounded on `ppps.c`.
//!
//! Writes `0`/`1` (inverted: `0` means the port stays enabled) to
//! `/sys/bus/usb/devices/<path>/disable`. A relative `ppps_path` is
//! expanded against the sysfs base the first time it's used; an absolute
//! path (starting with `/`) is used as-is.

use tracing::warn;

const PPPS_BASE: &str = "/sys/bus/usb/devices";

fn resolve(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{PPPS_BASE}/{path}/disable")
    }
}

async fn write_one(path: &str, on: bool) {
    let resolved = resolve(path);
    let value = if on { "0" } else { "1" };
    if let Err(e) = tokio::fs::write(&resolved, value).await {
        warn!("failed to write {resolved}: {e}");
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("check that the agent has write permission on {resolved}");
        }
    }
}

/// Drives `ppps_path` (and `ppps3_path`, if present, in lockstep).
pub async fn power(ppps_path: &str, ppps3_path: Option<&str>, on: bool) {
    write_one(ppps_path, on).await;
    if let Some(path) = ppps3_path {
        write_one(path, on).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_paths_pass_through() {
        assert_eq!(resolve("/sys/bus/usb/devices/2-2/disable"), "/sys/bus/usb/devices/2-2/disable");
    }

    #[test]
    fn relative_paths_are_expanded() {
        assert_eq!(
            resolve("2-2:1.0/2-2-port2"),
            "/sys/bus/usb/devices/2-2:1.0/2-2-port2/disable"
        );
    }
}
