use std::{env, fs, path::Path, time::Duration};

use eyre::{bail, eyre};
use serde::Deserialize;

use crate::{
    probe::ProbeSettings,
    processing::BatchConfig,
    protocols::{ProbeTimeouts, rcon::DEFAULT_RCON_PORT},
    scanner::PipelineConfig,
};

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Something like `sqlite://results.db`. Read from the `DATABASE_URL`
    /// environment variable if it's not set here.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Where to write log files. Nothing is logged to files if this isn't set.
    #[serde(default)]
    pub logging_dir: Option<String>,

    /// Print every server we find.
    #[serde(default)]
    pub verbose: bool,
    /// Stop printing servers after this many have been found.
    #[serde(default)]
    pub verbose_limit: Option<usize>,

    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub pipeline: PipelineSection,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ScannerConfig {
    /// The range passed to masscan, like `1.1.1.0/24`.
    #[serde(default)]
    pub range: Option<String>,
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    /// Packets per second.
    #[serde(default = "default_rate")]
    pub rate: u64,
    #[serde(default)]
    pub exclude_file: Option<String>,
    #[serde(default = "default_masscan_path")]
    pub masscan_path: String,
    /// Read saved `masscan -oJ` output instead of running masscan.
    #[serde(default)]
    pub input_file: Option<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            range: None,
            ports: default_ports(),
            rate: default_rate(),
            exclude_file: None,
            masscan_path: default_masscan_path(),
            input_file: None,
        }
    }
}

fn default_ports() -> Vec<u16> {
    vec![25565]
}
fn default_rate() -> u64 {
    1000
}
fn default_masscan_path() -> String {
    "masscan".to_string()
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    /// The protocol version we send in the status handshake.
    pub protocol_version: i32,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub query_timeout_secs: u64,
    /// Candidates on this port are only checked for RCON.
    pub rcon_port: u16,
    /// Try logging in to find out if there's a whitelist.
    pub login: bool,
    /// Ask for plugins and software over UDP query.
    pub query: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            protocol_version: 763,
            connect_timeout_secs: 4,
            read_timeout_secs: 4,
            query_timeout_secs: 2,
            rcon_port: DEFAULT_RCON_PORT,
            login: true,
            query: true,
        }
    }
}

impl ProbeConfig {
    pub fn settings(&self) -> ProbeSettings {
        ProbeSettings {
            protocol_version: self.protocol_version,
            timeouts: ProbeTimeouts {
                connect: Duration::from_secs(self.connect_timeout_secs),
                read: Duration::from_secs(self.read_timeout_secs),
                query: Duration::from_secs(self.query_timeout_secs),
            },
            rcon_port: self.rcon_port,
            login: self.login,
            query: self.query,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSection {
    pub workers: usize,
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_secs: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            workers: 1000,
            inbound_capacity: 10_000,
            outbound_capacity: 1000,
            batch_size: 500,
            flush_interval_secs: 5,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let input = fs::read_to_string(path)
            .map_err(|err| eyre!("couldn't read config at {}: {err}", path.display()))?;
        Self::parse(&input)
    }

    pub fn parse(input: &str) -> eyre::Result<Self> {
        let mut config: Config = toml::from_str(input)?;
        if config.database_url.is_none() {
            config.database_url = env::var("DATABASE_URL").ok();
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> eyre::Result<()> {
        if self.scanner.range.is_none() && self.scanner.input_file.is_none() {
            bail!("scanner.range or scanner.input_file must be set");
        }
        if self.scanner.ports.is_empty() {
            bail!("scanner.ports can't be empty");
        }
        if self.pipeline.workers == 0 {
            bail!("pipeline.workers must be at least 1");
        }
        if self.pipeline.batch_size == 0 {
            bail!("pipeline.batch_size must be at least 1");
        }
        if self.pipeline.flush_interval_secs == 0 {
            bail!("pipeline.flush_interval_secs must be at least 1");
        }
        Ok(())
    }

    pub fn database_url(&self) -> eyre::Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| eyre!("database_url must be set in the config or as DATABASE_URL"))
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            workers: self.pipeline.workers,
            inbound_capacity: self.pipeline.inbound_capacity,
            outbound_capacity: self.pipeline.outbound_capacity,
            batch: BatchConfig {
                batch_size: self.pipeline.batch_size,
                flush_interval: Duration::from_secs(self.pipeline.flush_interval_secs),
            },
            verbose: self.verbose,
            verbose_limit: self.verbose_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config = Config::parse(
            r#"
            database_url = "sqlite::memory:"
            [scanner]
            range = "1.1.1.0/24"
            "#,
        )
        .unwrap();
        assert_eq!(config.database_url().unwrap(), "sqlite::memory:");
        assert_eq!(config.scanner.ports, vec![25565]);
        assert_eq!(config.scanner.rate, 1000);
        assert_eq!(config.scanner.masscan_path, "masscan");

        let settings = config.probe.settings();
        assert_eq!(settings.protocol_version, 763);
        assert_eq!(settings.timeouts.connect, Duration::from_secs(4));
        assert_eq!(settings.timeouts.query, Duration::from_secs(2));
        assert_eq!(settings.rcon_port, 25575);
        assert!(settings.login && settings.query);

        let pipeline = config.pipeline();
        assert_eq!(pipeline.workers, 1000);
        assert_eq!(pipeline.inbound_capacity, 10_000);
        assert_eq!(pipeline.batch.batch_size, 500);
        assert_eq!(pipeline.batch.flush_interval, Duration::from_secs(5));
        assert!(!pipeline.verbose);
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            database_url = "sqlite://results.db"
            logging_dir = "logs"
            verbose = true
            verbose_limit = 10

            [scanner]
            input_file = "scan.json"
            ports = [25565, 25575]
            exclude_file = "exclude.conf"

            [probe]
            protocol_version = 765
            query = false

            [pipeline]
            workers = 50
            batch_size = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.logging_dir.as_deref(), Some("logs"));
        assert_eq!(config.scanner.input_file.as_deref(), Some("scan.json"));
        assert_eq!(config.scanner.ports, vec![25565, 25575]);
        assert_eq!(config.probe.protocol_version, 765);
        assert!(!config.probe.query);
        assert!(config.probe.login);
        let pipeline = config.pipeline();
        assert_eq!(pipeline.workers, 50);
        assert_eq!(pipeline.batch.batch_size, 10);
        assert_eq!(pipeline.outbound_capacity, 1000);
        assert_eq!(pipeline.verbose_limit, Some(10));
    }

    #[test]
    fn test_bad_configs() {
        // no candidate source
        assert!(Config::parse("database_url = \"sqlite::memory:\"").is_err());
        // typo
        assert!(Config::parse("[scanner]\nrange = \"1.1.1.1\"\nrate_limit = 5").is_err());
        assert!(Config::parse("[scanner]\nrange = \"1.1.1.1\"\n[pipeline]\nworkers = 0").is_err());
        assert!(Config::parse("[scanner]\nrange = \"1.1.1.1\"\nports = []").is_err());
    }
}
