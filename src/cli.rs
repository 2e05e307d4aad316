use crate::config::HaConfig;
use crate::config_parser::parse_config_file;
use crate::error::Result;
use clap::Parser;

use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "sockudo-sentinel-watch")]
#[command(author = "Sockudo Team")]
#[command(version = "1.0.0")]
#[command(about = "Follow a sentinel-monitored master group and log every failover", long_about = None)]
pub struct Cli {
    /// Configuration file path (sentinel-client.conf format)
    #[arg(short, long, value_name = "CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Sentinel address (host[:port]); repeat for several. Replaces the file's list.
    #[arg(long = "sentinel", value_name = "HOST")]
    pub sentinels: Vec<String>,

    /// Monitored master group name (default: mymaster)
    #[arg(long)]
    pub master_name: Option<String>,

    /// Log level (debug, verbose, notice, warning, nothing)
    #[arg(long)]
    pub loglevel: Option<String>,

    /// Log file path
    #[arg(long)]
    pub logfile: Option<String>,

    /// Use TLS for every connection
    #[arg(long)]
    pub tls: bool,

    /// Channel to follow on the current master; repeat for several.
    /// Uses the file's heartbeat and restart settings.
    #[arg(long = "channel", value_name = "CHANNEL")]
    pub channels: Vec<String>,

    /// Seconds between topology/stats reports
    #[arg(long, default_value_t = 30)]
    pub report_interval: u64,
}

impl Cli {
    /// Parse the process arguments and build the effective configuration
    pub fn load_config() -> Result<(Cli, HaConfig)> {
        let cli = Cli::parse();
        let config = cli.to_config()?;
        Ok((cli, config))
    }

    /// Config file (if any) with command line overrides applied
    pub fn to_config(&self) -> Result<HaConfig> {
        let mut config = match &self.config {
            Some(path) => parse_config_file(path)?,
            None => HaConfig::default(),
        };

        if !self.sentinels.is_empty() {
            config.sentinel.sentinel_hosts = self.sentinels.clone();
        }
        if let Some(name) = &self.master_name {
            config.sentinel.master_name = name.clone();
        }
        if let Some(level) = &self.loglevel {
            config.log.loglevel = level.to_lowercase();
        }
        if let Some(file) = &self.logfile {
            config.log.logfile = file.clone();
        }
        if self.tls {
            config.tls.enabled = true;
        }
        Ok(config)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval.max(1))
    }
}
