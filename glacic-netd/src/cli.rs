use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub const ENV_VAR_CONFIG_PATH: &str = "GLACIC_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/glacic/glacic.toml";

pub const ENV_VAR_LOG_FILE: &str = "GLACIC_LOG_FILE";
pub const ENV_VAR_FIREWALL_BACKEND: &str = "GLACIC_FIREWALL_BACKEND";

/// glacic network control plane daemon
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Uplink group configuration file
    #[arg(short, long, env = ENV_VAR_CONFIG_PATH, default_value = DEFAULT_CONFIG_PATH)]
    pub config_path: PathBuf,

    /// Write logs to this file instead of stdout
    #[arg(long, env = ENV_VAR_LOG_FILE)]
    pub log_file: Option<PathBuf>,

    /// Firewall backend to use for mark/NAT rule programming
    #[arg(long, env = ENV_VAR_FIREWALL_BACKEND, value_enum, default_value = "native")]
    pub firewall_backend: FirewallBackendKind,

    /// Record the kernel operations that would be issued without executing
    /// them (uses the dry-run netlink/firewall backends instead).
    #[arg(long)]
    pub dry_run: bool,

    /// Interval between health-supervisor ticks
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2s")]
    pub health_tick_interval: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum FirewallBackendKind {
    /// Native nftnl+mnl batch programming.
    Native,
    /// `nft`/`ip` CLI argv fallback via the command executor.
    Shell,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cli_with_minimum_arguments() {
        let args = Cli::try_parse_from(["glacic-netd"]).expect("default args should parse");
        assert_eq!(args.config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(args.log_file.is_none());
        assert_eq!(args.firewall_backend, FirewallBackendKind::Native);
        assert!(!args.dry_run);
    }

    #[test]
    fn parses_dry_run_and_custom_tick_interval() {
        let args = Cli::try_parse_from(["glacic-netd", "--dry-run", "--health-tick-interval", "500ms"]).unwrap();
        assert!(args.dry_run);
        assert_eq!(args.health_tick_interval, Duration::from_millis(500));
    }
}
