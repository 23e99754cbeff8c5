use std::time::Duration;

use clap::Parser;
use log::LevelFilter;

use crate::error::{ConductorError, ConductorResult};

/// How often the supervisor re-lists services from the registry.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Wait time handed to registry blocking queries.
pub const WATCH_WAIT_TIME: Duration = Duration::from_secs(30);

/// Command line configuration.
///
/// Environment variables override flags; apply [`Config::apply_env_overrides`]
/// after parsing.
#[derive(Debug, Clone, Parser)]
#[command(name = "conductor", disable_version_flag = true)]
pub struct Config {
    /// The Consul host to connect to
    #[arg(long = "consul", default_value = "localhost:8500")]
    pub consul_host: String,

    /// The Consul datacenter to use
    #[arg(long = "datacenter", default_value = "dc1")]
    pub consul_datacenter: String,

    /// The loadbalancer algorithm
    #[arg(long = "loadbalancer", default_value = "naive_round_robin")]
    pub load_balancer: String,

    /// The key-value prefix in Consul to search for services under
    #[arg(long = "kv-prefix", default_value = "conductor/services")]
    pub kv_prefix: String,

    /// Listen on this port
    #[arg(long = "port", default_value_t = 8888)]
    pub port: u16,

    /// Log level to use (debug, info, warn, error, fatal, or panic)
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Format logs in this format (either 'json' or 'lsmet')
    #[arg(long = "log-format", default_value = "lsmet")]
    pub log_format: String,

    /// Print version and exit
    #[arg(long = "version")]
    pub version: bool,
}

impl Config {
    /// Parses the command line and applies environment overrides.
    pub fn load() -> Self {
        let mut config = Self::parse();
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Applies environment variables on top of flag values.
    ///
    /// Environment takes precedence over flags. The lookup is injected so
    /// tests do not touch the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CONSUL_HOST") {
            self.consul_host = v;
        }
        if let Some(v) = lookup("CONSUL_DATACENTER") {
            self.consul_datacenter = v;
        }
        if let Some(v) = lookup("CONSUL_KV_PREFIX") {
            self.kv_prefix = v;
        }
        if let Some(v) = lookup("LOADBALANCER") {
            self.load_balancer = v;
        }
        if let Some(v) = lookup("LOG_FORMAT") {
            self.log_format = v;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log_level = v;
        }
    }

    /// Maps the configured log level name onto a `log` filter.
    ///
    /// `fatal` and `panic` have no `log` crate counterpart and collapse to
    /// `error`, matching how those levels are actually emitted.
    pub fn level_filter(&self) -> LevelFilter {
        match self.log_level.as_str() {
            "debug" => LevelFilter::Debug,
            "info" => LevelFilter::Info,
            "warn" => LevelFilter::Warn,
            "error" | "fatal" | "panic" => LevelFilter::Error,
            _ => LevelFilter::Info,
        }
    }

    pub fn log_format(&self) -> ConductorResult<LogFormat> {
        match self.log_format.as_str() {
            "lsmet" => Ok(LogFormat::Lsmet),
            "json" => Ok(LogFormat::Json),
            other => Err(ConductorError::Config(format!(
                "unknown log format '{other}' (expected 'lsmet' or 'json')"
            ))),
        }
    }
}

/// Output format for the logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// `key=value` text lines.
    Lsmet,
    /// One JSON object per line.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("conductor").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.consul_host, "localhost:8500");
        assert_eq!(config.consul_datacenter, "dc1");
        assert_eq!(config.load_balancer, "naive_round_robin");
        assert_eq!(config.kv_prefix, "conductor/services");
        assert_eq!(config.port, 8888);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, "lsmet");
        assert!(!config.version);
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = parse(&[
            "--consul",
            "consul.internal:8500",
            "--kv-prefix",
            "proxy/services",
            "--port",
            "9000",
        ]);
        assert_eq!(config.consul_host, "consul.internal:8500");
        assert_eq!(config.kv_prefix, "proxy/services");
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn test_env_overrides_flags() {
        let mut config = parse(&["--consul", "from-flag:8500", "--log-level", "debug"]);
        config.apply_env_overrides(|name| match name {
            "CONSUL_HOST" => Some("from-env:8500".to_string()),
            "LOG_FORMAT" => Some("json".to_string()),
            _ => None,
        });
        assert_eq!(config.consul_host, "from-env:8500");
        assert_eq!(config.log_format, "json");
        // untouched by the environment: flag value survives
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_level_filter_mapping() {
        let mut config = parse(&[]);
        for (name, expected) in [
            ("debug", LevelFilter::Debug),
            ("info", LevelFilter::Info),
            ("warn", LevelFilter::Warn),
            ("error", LevelFilter::Error),
            ("fatal", LevelFilter::Error),
            ("panic", LevelFilter::Error),
            ("nonsense", LevelFilter::Info),
        ] {
            config.log_level = name.to_string();
            assert_eq!(config.level_filter(), expected, "level {name}");
        }
    }

    #[test]
    fn test_log_format_parse() {
        let mut config = parse(&[]);
        assert_eq!(config.log_format().unwrap(), LogFormat::Lsmet);
        config.log_format = "json".to_string();
        assert_eq!(config.log_format().unwrap(), LogFormat::Json);
        config.log_format = "xml".to_string();
        assert!(config.log_format().is_err());
    }
}
