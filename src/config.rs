//! Process Configuration
//!
//! Defaults, overlaid by a YAML file (default path `config.yaml`),
//! overlaid by command-line flags. Durations accept `Ns`, `Nm`, `Nh`
//! (and `Nms`) units. Validation failures are fatal at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::Error;

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level: debug, info, warn, error
    pub log_level: String,
    /// SQLite database path
    pub db_path: String,
    /// API server listen address
    pub api_listen: String,
    /// Kernel ruleset update interval
    pub update_interval: Duration,
    /// Health check dial timeout
    pub health_timeout: Duration,
    /// Health check interval
    pub health_interval: Duration,
    /// nftables table name
    pub nft_table: String,
    /// nftables chain name
    pub nft_chain: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            db_path: "ingressd.db".to_string(),
            api_listen: "0.0.0.0:8080".to_string(),
            update_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            health_interval: Duration::from_secs(60),
            nft_table: "nat".to_string(),
            nft_chain: "prerouting".to_string(),
        }
    }
}

/// YAML file shape; every key optional.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    log_level: Option<String>,
    db_path: Option<String>,
    api_listen: Option<String>,
    update_interval: Option<String>,
    health_timeout: Option<String>,
    health_interval: Option<String>,
    nft_table: Option<String>,
    nft_chain: Option<String>,
}

/// Command-line flags; every option overrides the file.
#[derive(Debug, Parser)]
#[command(name = "ingressd", about = "nftables-based ingress manager")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Log level (debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// SQLite database path
    #[arg(long)]
    pub db_path: Option<String>,

    /// API server listen address
    #[arg(long)]
    pub api_listen: Option<String>,

    /// Kernel ruleset update interval (e.g. 30s, 5m, 1h)
    #[arg(long)]
    pub update_interval: Option<String>,

    /// Health check dial timeout
    #[arg(long)]
    pub health_timeout: Option<String>,

    /// Health check interval
    #[arg(long)]
    pub health_interval: Option<String>,

    /// nftables table name
    #[arg(long)]
    pub nft_table: Option<String>,

    /// nftables chain name
    #[arg(long)]
    pub nft_chain: Option<String>,
}

/// Parse a duration with a single `ms`, `s`, `m`, or `h` unit suffix.
pub fn parse_duration(s: &str) -> Result<Duration, Error> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| Error::Validation(format!("duration {} is missing a unit", s)))?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| Error::Validation(format!("invalid duration: {}", s)))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(Error::Validation(format!(
            "unknown duration unit: {}",
            other
        ))),
    }
}

fn apply_file(config: &mut Config, file: FileConfig) -> Result<(), Error> {
    if let Some(v) = file.log_level {
        config.log_level = v;
    }
    if let Some(v) = file.db_path {
        config.db_path = v;
    }
    if let Some(v) = file.api_listen {
        config.api_listen = v;
    }
    if let Some(v) = file.update_interval {
        config.update_interval = parse_duration(&v)?;
    }
    if let Some(v) = file.health_timeout {
        config.health_timeout = parse_duration(&v)?;
    }
    if let Some(v) = file.health_interval {
        config.health_interval = parse_duration(&v)?;
    }
    if let Some(v) = file.nft_table {
        config.nft_table = v;
    }
    if let Some(v) = file.nft_chain {
        config.nft_chain = v;
    }
    Ok(())
}

fn apply_cli(config: &mut Config, cli: &Cli) -> Result<(), Error> {
    if let Some(v) = &cli.log_level {
        config.log_level = v.clone();
    }
    if let Some(v) = &cli.db_path {
        config.db_path = v.clone();
    }
    if let Some(v) = &cli.api_listen {
        config.api_listen = v.clone();
    }
    if let Some(v) = &cli.update_interval {
        config.update_interval = parse_duration(v)?;
    }
    if let Some(v) = &cli.health_timeout {
        config.health_timeout = parse_duration(v)?;
    }
    if let Some(v) = &cli.health_interval {
        config.health_interval = parse_duration(v)?;
    }
    if let Some(v) = &cli.nft_table {
        config.nft_table = v.clone();
    }
    if let Some(v) = &cli.nft_chain {
        config.nft_chain = v.clone();
    }
    Ok(())
}

fn validate(config: &Config) -> Result<(), Error> {
    if !matches!(config.log_level.as_str(), "debug" | "info" | "warn" | "error") {
        return Err(Error::Validation(format!(
            "unknown log level: {}",
            config.log_level
        )));
    }
    if config.db_path.is_empty() {
        return Err(Error::validation("missing required parameter: db_path"));
    }
    if config.api_listen.is_empty() {
        return Err(Error::validation("missing required parameter: api_listen"));
    }
    if config.nft_table.is_empty() {
        return Err(Error::validation("missing required parameter: nft_table"));
    }
    if config.nft_chain.is_empty() {
        return Err(Error::validation("missing required parameter: nft_chain"));
    }
    if config.update_interval.is_zero() {
        return Err(Error::validation("update_interval must be positive"));
    }
    if config.health_timeout.is_zero() {
        return Err(Error::validation("health_timeout must be positive"));
    }
    if config.health_interval.is_zero() {
        return Err(Error::validation("health_interval must be positive"));
    }
    Ok(())
}

/// Load the configuration: defaults, then the YAML file, then flags.
pub fn load_config(cli: &Cli) -> Result<Config, Error> {
    let mut config = Config::default();

    if cli.config.exists() {
        let raw = std::fs::read_to_string(&cli.config)?;
        let file: FileConfig = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Validation(format!("invalid configuration file: {}", e)))?;
        apply_file(&mut config, file)?;
    } else if cli.config != Path::new("config.yaml") {
        // only complain when the operator named a file explicitly
        eprintln!(
            "warning: configuration file {} not found",
            cli.config.display()
        );
    }

    apply_cli(&mut config, cli)?;
    validate(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli_with_args(args: &[&str]) -> Cli {
        let mut full = vec!["ingressd"];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.api_listen, "0.0.0.0:8080");
        assert_eq!(cfg.update_interval, Duration::from_secs(30));
        assert_eq!(cfg.health_timeout, Duration::from_secs(5));
        assert_eq!(cfg.health_interval, Duration::from_secs(60));
        assert_eq!(cfg.nft_table, "nat");
        assert_eq!(cfg.nft_chain, "prerouting");
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("ten seconds").is_err());
    }

    #[test]
    fn test_load_config_defaults_without_file() {
        let cli = cli_with_args(&[]);
        let cfg = load_config(&cli).unwrap();
        assert_eq!(cfg.db_path, "ingressd.db");
        assert_eq!(cfg.nft_table, "nat");
    }

    #[test]
    fn test_cli_overrides() {
        let cli = cli_with_args(&[
            "--log-level",
            "debug",
            "--api-listen",
            "127.0.0.1:9090",
            "--update-interval",
            "10s",
            "--nft-table",
            "ingress",
        ]);
        let cfg = load_config(&cli).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.api_listen, "127.0.0.1:9090");
        assert_eq!(cfg.update_interval, Duration::from_secs(10));
        assert_eq!(cfg.nft_table, "ingress");
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let cli = cli_with_args(&["--log-level", "loud"]);
        assert!(load_config(&cli).is_err());
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let cli = cli_with_args(&["--health-timeout", "fast"]);
        assert!(load_config(&cli).is_err());
    }

    #[test]
    fn test_yaml_file_overlay_and_cli_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "log_level: warn\nupdate_interval: 2m\nnft_chain: dnat-in\n",
        )
        .unwrap();

        let cli = cli_with_args(&[
            "--config",
            path.to_str().unwrap(),
            "--log-level",
            "error",
        ]);
        let cfg = load_config(&cli).unwrap();
        // flag wins over file
        assert_eq!(cfg.log_level, "error");
        // file wins over default
        assert_eq!(cfg.update_interval, Duration::from_secs(120));
        assert_eq!(cfg.nft_chain, "dnat-in");
        // untouched values keep defaults
        assert_eq!(cfg.nft_table, "nat");
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "update_interval: [not, a, duration]\n").unwrap();

        let cli = cli_with_args(&["--config", path.to_str().unwrap()]);
        assert!(load_config(&cli).is_err());
    }
}
