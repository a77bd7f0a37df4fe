//! Command-line surface, grounded on `cdba-client.c`'s `getopt` string
//! (`b:c:C:h:ilt:S:T:`) and `cdba.c`'s `-R` extension, exposed declaratively
//! via `clap derive` in place of the original's hand-rolled `getopt` loop.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "cdba-client", about = "Board-farm controller CLI")]
pub struct Cli {
    /// Board identifier to select on the agent.
    #[arg(short = 'b', long)]
    pub board: String,

    /// Host to reach the agent on, passed through to `ssh`.
    #[arg(short = 'h', long)]
    pub host: String,

    /// Total session timeout in seconds.
    #[arg(short = 't', long = "timeout", default_value_t = 600)]
    pub timeout_total: u64,

    /// Inactivity timeout in seconds; 0 disables it.
    #[arg(short = 'T', long = "inactivity-timeout", default_value_t = 0)]
    pub timeout_inactivity: u64,

    /// Number of automatic power cycles to allow; unset means unlimited.
    #[arg(short = 'c', long = "power-cycles")]
    pub power_cycles: Option<u32>,

    /// Disable power-cycling when the timeout (rather than a shutdown
    /// marker) is what triggers it.
    #[arg(short = 'C', long = "no-cycle-on-timeout")]
    pub no_cycle_on_timeout: bool,

    /// Remote binary to run over ssh in place of the agent.
    #[arg(short = 'S', long = "server-bin", default_value = "cdba-server")]
    pub server_bin: String,

    /// Image to upload via fastboot once the board enumerates.
    #[arg(short = 'i', long)]
    pub image: Option<PathBuf>,

    /// Re-upload the image on every FASTBOOT_PRESENT=1, not just the first.
    #[arg(short = 'l', long)]
    pub repeat: bool,

    /// Synonym of `--repeat`, retained from `cdba.c`'s historical `-R` flag.
    #[arg(short = 'R', long = "fastboot-repeat")]
    pub fastboot_repeat: bool,

    /// Forward STATUS_UPDATE lines verbatim to this file/fifo.
    #[arg(short = 's', long = "status-fifo")]
    pub status_fifo: Option<PathBuf>,
}

impl Cli {
    pub fn repeat_uploads(&self) -> bool {
        self.repeat || self.fastboot_repeat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_flags_parse_with_defaults() {
        let cli = Cli::parse_from(["cdba-client", "-b", "sdm845", "-h", "farm-1"]);
        assert_eq!(cli.board, "sdm845");
        assert_eq!(cli.host, "farm-1");
        assert_eq!(cli.timeout_total, 600);
        assert_eq!(cli.timeout_inactivity, 0);
        assert_eq!(cli.power_cycles, None);
        assert!(!cli.no_cycle_on_timeout);
        assert_eq!(cli.server_bin, "cdba-server");
        assert!(!cli.repeat_uploads());
    }

    #[test]
    fn repeat_uploads_is_true_from_either_flag() {
        let long = Cli::parse_from(["cdba-client", "-b", "b", "-h", "h", "-l"]);
        assert!(long.repeat_uploads());

        let short = Cli::parse_from(["cdba-client", "-b", "b", "-h", "h", "-R"]);
        assert!(short.repeat_uploads());

        let neither = Cli::parse_from(["cdba-client", "-b", "b", "-h", "h"]);
        assert!(!neither.repeat_uploads());
    }

    #[test]
    fn missing_required_flags_is_an_error() {
        assert!(Cli::try_parse_from(["cdba-client"]).is_err());
    }

    #[test]
    fn power_cycles_and_image_path_parse() {
        let cli = Cli::parse_from([
            "cdba-client",
            "-b",
            "b",
            "-h",
            "h",
            "-c",
            "3",
            "-i",
            "/tmp/boot.img",
            "-s",
            "/tmp/status.fifo",
        ]);
        assert_eq!(cli.power_cycles, Some(3));
        assert_eq!(cli.image, Some(PathBuf::from("/tmp/boot.img")));
        assert_eq!(cli.status_fifo, Some(PathBuf::from("/tmp/status.fifo")));
    }
}
