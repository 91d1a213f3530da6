//! CLI definition and argument parsing for opsipxeconfd.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use opsipxeconfd::DEFAULT_CONFIG_FILE;

#[derive(Parser, Debug)]
#[command(
    name = "opsipxeconfd",
    about = "opsi PXE configuration daemon",
    disable_version_flag = true
)]
pub struct Cli {
    /// Do not fork to background.
    #[arg(short = 'F', long = "no-fork")]
    pub no_fork: bool,

    /// Path to config file.
    #[arg(short = 'c', long = "conffile", default_value = DEFAULT_CONFIG_FILE)]
    pub conffile: PathBuf,

    /// Set the general log level (0: nothing .. 9: secrets).
    #[arg(short = 'l', long = "loglevel", value_parser = clap::value_parser!(u8).range(0..=9))]
    pub log_level: Option<u8>,

    /// Show version information and exit.
    #[arg(short = 'v', long = "version")]
    pub version: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show version information and exit.
    Version,

    /// Start the daemon.
    Start,

    /// Stop the running daemon.
    Stop,

    /// Print status information of the running daemon.
    Status,

    /// Update the boot configuration of a client.
    Update {
        /// Fully qualified id of the client.
        client_id: String,
        /// Optional alternate template source (update from cache file).
        cache_path: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_with_options() {
        let cli = Cli::parse_from(["opsipxeconfd", "-F", "-l", "7", "start"]);
        assert!(cli.no_fork);
        assert_eq!(cli.log_level, Some(7));
        assert!(matches!(cli.command, Some(Command::Start)));
    }

    #[test]
    fn test_parse_update_with_cache_path() {
        let cli = Cli::parse_from([
            "opsipxeconfd",
            "update",
            "h1.example.org",
            "/var/cache/boot.conf",
        ]);
        match cli.command {
            Some(Command::Update {
                client_id,
                cache_path,
            }) => {
                assert_eq!(client_id, "h1.example.org");
                assert_eq!(cache_path, Some(PathBuf::from("/var/cache/boot.conf")));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_loglevel_range_is_enforced() {
        assert!(Cli::try_parse_from(["opsipxeconfd", "-l", "12", "status"]).is_err());
    }

    #[test]
    fn test_version_flag() {
        let cli = Cli::parse_from(["opsipxeconfd", "-v"]);
        assert!(cli.version);
        assert!(cli.command.is_none());
    }
}
