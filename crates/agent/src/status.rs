//! STATUS_UPDATE JSON line construction, grounded on `status.c`.
//!
//! Each call builds one line `{"ts": <sec.ms>, "<group>": { "<unit>": <n>, ... } }`.
//! `ts` is monotonic seconds-with-millisecond-precision since the agent's
//! own start, latched lazily on first use exactly like the original's `t0`.

use once_cell::sync::OnceCell;
use std::time::Instant;

static START: OnceCell<Instant> = OnceCell::new();

fn elapsed_ts() -> f64 {
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_secs_f64()
}

/// One named value within a status group: millivolts, milliamps, or a raw
/// gpio level.
#[derive(Debug, Clone, Copy)]
pub enum StatusValue {
    Mv(i64),
    Ma(i64),
    Gpio(i64),
}

impl StatusValue {
    fn unit(&self) -> &'static str {
        match self {
            StatusValue::Mv(_) => "mv",
            StatusValue::Ma(_) => "ma",
            StatusValue::Gpio(_) => "gpio",
        }
    }

    fn value(&self) -> i64 {
        match self {
            StatusValue::Mv(v) | StatusValue::Ma(v) | StatusValue::Gpio(v) => *v,
        }
    }
}

/// Build one STATUS_UPDATE payload — a single JSON line, with no trailing
/// newline of its own; that's added once, by whoever frames it for display
/// (the controller, when it writes a line to stdout or a status fifo).
pub fn status_line(group: &str, values: &[StatusValue]) -> String {
    let mut fields = String::new();
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            fields.push_str(", ");
        }
        fields.push_str(&format!("\"{}\": {}", v.unit(), v.value()));
    }
    format!("{{\"ts\": {:.3}, \"{}\": {{ {} }} }}", elapsed_ts(), group, fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_a_single_group() {
        let line = status_line("vbat", &[StatusValue::Mv(3700), StatusValue::Ma(120)]);
        assert!(line.contains("\"vbat\""));
        assert!(line.contains("\"mv\": 3700"));
        assert!(line.contains("\"ma\": 120"));
        assert!(!line.ends_with('\n'));
    }

    #[test]
    fn renders_a_single_value_group() {
        let line = status_line("vref", &[StatusValue::Mv(1800)]);
        assert!(line.contains("\"vref\""));
        assert!(line.contains("\"mv\": 1800"));
    }
}
