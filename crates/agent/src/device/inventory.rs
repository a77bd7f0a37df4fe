//! YAML device inventory loader, grounded on `device_parser.c`.
//!
//! The original walks a hand-rolled YAML event stream; `serde_yaml` gives
//! us a tree instead, so this loader takes a two-pass approach: deserialize
//! once into an untyped `serde_yaml::Value`, then manually dispatch per
//! board on whichever recognized backend key is present, since YAML
//! expresses that choice as "whichever one of these mutually exclusive
//! keys exists" rather than an explicit tag.

use std::path::{Path, PathBuf};

use serde_yaml::Value;

use crate::backends::{BackendConfig, GpioLine, GpioLines};
use crate::error::InventoryError;

use super::{BoardConfig, BootStrategy};

const CONTROL_BACKEND_KEYS: &[&str] = &[
    "alpaca",
    "cdba",
    "conmux",
    "external",
    "ftdi_gpio",
    "laurent",
    "local_gpio",
    "qcomlt_debug_board",
];

/// Locates and parses the inventory, checking `./.cdba` then `/etc/cdba`.
pub fn load_inventory() -> Result<Vec<BoardConfig>, InventoryError> {
    let path = locate_inventory().ok_or(InventoryError::NotFound)?;
    load_inventory_from(&path)
}

fn locate_inventory() -> Option<PathBuf> {
    for candidate in [PathBuf::from("./.cdba"), PathBuf::from("/etc/cdba")] {
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

pub fn load_inventory_from(path: &Path) -> Result<Vec<BoardConfig>, InventoryError> {
    let text = std::fs::read_to_string(path).map_err(|source| InventoryError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_inventory(&text)
}

pub fn parse_inventory(text: &str) -> Result<Vec<BoardConfig>, InventoryError> {
    let root: Value = serde_yaml::from_str(text)?;
    let mapping = root.as_mapping().ok_or_else(|| {
        InventoryError::Parse(serde::de::Error::custom("inventory root is not a mapping"))
    })?;

    let Some((_key, boards)) = mapping.iter().next() else {
        return Ok(Vec::new());
    };
    let boards = boards
        .as_sequence()
        .ok_or_else(|| InventoryError::Parse(serde::de::Error::custom("inventory value is not a sequence")))?;

    boards.iter().map(parse_board).collect()
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_true(value: &Value) -> bool {
    scalar(value).as_deref() == Some("true")
}

fn users_from(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Sequence(seq) => Some(seq.iter().filter_map(scalar).collect()),
        Value::String(s) => Some(vec![s.clone()]),
        _ => None,
    }
}

fn parse_gpio_line(value: &Value) -> Option<GpioLine> {
    let mapping = value.as_mapping()?;
    let chip = mapping.get("chip").and_then(scalar)?;
    let offset: u32 = mapping.get("offset").and_then(scalar)?.parse().ok()?;
    let active_low = mapping.get("active_low").map(is_true).unwrap_or(false);
    Some(GpioLine {
        chip,
        offset,
        active_low,
    })
}

fn parse_gpio_lines(value: &Value) -> GpioLines {
    let Some(mapping) = value.as_mapping() else {
        return GpioLines::default();
    };
    GpioLines {
        power: mapping.get("power").and_then(parse_gpio_line),
        fastboot_key: mapping.get("fastboot_key").and_then(parse_gpio_line),
        power_key: mapping.get("power_key").and_then(parse_gpio_line),
        usb_disconnect: mapping.get("usb_disconnect").and_then(parse_gpio_line),
    }
}

fn parse_laurent(value: &Value) -> BackendConfig {
    let mapping = value.as_mapping();
    let get = |key: &str| mapping.and_then(|m| m.get(key)).and_then(scalar);
    BackendConfig::Laurent {
        server: get("server").unwrap_or_default(),
        password: get("password").unwrap_or_else(|| "Laurent".to_string()),
        relay: get("relay").and_then(|v| v.parse().ok()).unwrap_or(0),
        usb_relay: get("usb_relay").and_then(|v| v.parse().ok()),
    }
}

fn parse_board(value: &Value) -> Result<BoardConfig, InventoryError> {
    let mapping = value
        .as_mapping()
        .ok_or_else(|| InventoryError::Parse(serde::de::Error::custom("board entry is not a mapping")))?;

    let mut board = None;
    let mut name = None;
    let mut description = None;
    let mut users = None;
    let mut console = None;
    let mut voltage_mv = None;
    let mut fastboot_serial = None;
    let mut fastboot_set_active = None;
    let mut fastboot_key_timeout = None;
    let mut boot_strategy = BootStrategy::Boot;
    let mut usb_always_on = false;
    let mut power_always_on = false;
    let mut ppps_path = None;
    let mut ppps3_path = None;
    let mut status_cmd = None;
    let mut video_device = None;
    let mut backend: Option<BackendConfig> = None;
    let mut backend_console: Option<String> = None;

    for (key, val) in mapping {
        let key = scalar(key).unwrap_or_default();
        if CONTROL_BACKEND_KEYS.contains(&key.as_str()) && backend.is_some() {
            let board_id = board.clone().unwrap_or_else(|| "<unnamed>".to_string());
            return Err(InventoryError::MultipleBackends { board: board_id });
        }
        match key.as_str() {
            "users" => users = users_from(val),
            "board" => board = scalar(val),
            "name" => name = scalar(val),
            "description" => description = scalar(val),
            "console" => console = scalar(val),
            "voltage" => voltage_mv = scalar(val).and_then(|v| v.parse().ok()),
            "fastboot" => fastboot_serial = scalar(val),
            "fastboot_set_active" => {
                fastboot_set_active = scalar(val).map(|v| if v == "true" { "a".to_string() } else { v })
            }
            "fastboot_key_timeout" => fastboot_key_timeout = scalar(val).and_then(|v| v.parse().ok()),
            "broken_fastboot_boot" => {
                if is_true(val) {
                    boot_strategy = BootStrategy::FlashReboot;
                }
            }
            "usb_always_on" => usb_always_on = is_true(val),
            "power_always_on" => power_always_on = is_true(val),
            "ppps_path" => ppps_path = scalar(val),
            "ppps3_path" => ppps3_path = scalar(val),
            "status-cmd" => status_cmd = scalar(val),
            "video_device" => video_device = scalar(val),

            "cdba" => {
                backend = Some(BackendConfig::CdbAssist {
                    device: scalar(val).unwrap_or_default(),
                })
            }
            "alpaca" => {
                backend = Some(BackendConfig::Alpaca {
                    device: scalar(val).unwrap_or_default(),
                })
            }
            "qcomlt_debug_board" => {
                backend = Some(BackendConfig::QcomltDebug {
                    device: scalar(val).unwrap_or_default(),
                })
            }
            "external" => {
                backend = Some(BackendConfig::External {
                    helper: scalar(val).unwrap_or_default(),
                })
            }
            "conmux" => {
                let name = scalar(val).unwrap_or_default();
                backend_console = Some(name.clone());
                backend = Some(BackendConfig::Conmux { name });
            }
            "local_gpio" => backend = Some(BackendConfig::LocalGpio { lines: parse_gpio_lines(val) }),
            "ftdi_gpio" => backend = Some(BackendConfig::FtdiGpio { lines: parse_gpio_lines(val) }),
            "laurent" => backend = Some(parse_laurent(val)),

            other => return Err(InventoryError::UnknownKey(other.to_string())),
        }
    }

    let board_id = board.ok_or_else(|| InventoryError::IncompleteBoard {
        board: "<unnamed>".to_string(),
        field: "board",
    })?;
    let console = console.or(backend_console);
    if console.is_none() {
        return Err(InventoryError::IncompleteBoard {
            board: board_id,
            field: "console",
        });
    }
    let backend = match backend {
        None => return Err(InventoryError::NoBackend { board: board_id }),
        Some(b) => b,
    };

    Ok(BoardConfig {
        board: board_id,
        name,
        description,
        users,
        console,
        voltage_mv,
        fastboot_serial,
        fastboot_set_active,
        fastboot_key_timeout,
        boot_strategy,
        usb_always_on,
        power_always_on,
        ppps_path,
        ppps3_path,
        status_cmd,
        video_device,
        backend,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
devices:
  - board: db410c
    name: 96boards DB410C
    console: /dev/ttyUSB0
    fastboot: 0123456789abcdef
    fastboot_key_timeout: 15
    usb_always_on: true
    local_gpio:
      power:
        chip: gpiochip0
        offset: 12
      fastboot_key:
        chip: gpiochip0
        offset: 13
        active_low: true
  - board: rb1
    conmux: rb1-console
    fastboot: fedcba9876543210
    users:
      - alice
      - bob
"#;

    #[test]
    fn parses_two_boards_with_distinct_backends() {
        let boards = parse_inventory(SAMPLE).unwrap();
        assert_eq!(boards.len(), 2);

        let db410c = &boards[0];
        assert_eq!(db410c.board, "db410c");
        assert_eq!(db410c.console.as_deref(), Some("/dev/ttyUSB0"));
        assert!(db410c.usb_always_on);
        assert_eq!(db410c.fastboot_key_timeout, Some(15));
        assert!(matches!(db410c.backend, BackendConfig::LocalGpio { .. }));

        let rb1 = &boards[1];
        assert_eq!(rb1.console.as_deref(), Some("rb1-console"));
        assert!(matches!(rb1.backend, BackendConfig::Conmux { .. }));
        assert_eq!(rb1.users.as_deref(), Some(&["alice".to_string(), "bob".to_string()][..]));
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = parse_inventory("devices:\n  - board: x\n    bogus_key: 1\n");
        assert!(matches!(err, Err(InventoryError::UnknownKey(_))));
    }

    #[test]
    fn console_only_board_with_no_fastboot_serial_is_accepted() {
        let text = "devices:\n  - board: x\n    console: /dev/ttyUSB0\n    alpaca: /dev/ttyUSB1\n";
        let boards = parse_inventory(text).unwrap();
        assert_eq!(boards[0].fastboot_serial, None);
    }

    #[test]
    fn rejects_board_with_two_control_backend_keys() {
        let text = "devices:\n  - board: x\n    console: /dev/ttyUSB0\n    fastboot: abc\n    alpaca: /dev/ttyUSB1\n    cdba: /dev/ttyUSB2\n";
        let err = parse_inventory(text);
        assert!(matches!(
            err,
            Err(InventoryError::MultipleBackends { board }) if board == "x"
        ));
    }
}
