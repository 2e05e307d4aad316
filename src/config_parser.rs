//! `sentinel-client.conf` parser
//!
//! Line-oriented `directive arg...` format; `#` starts a comment line.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::HaConfig;
use crate::error::{Error, Result};

/// Parse a configuration file
pub fn parse_config_file(path: &Path) -> Result<HaConfig> {
    let content = fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("failed to read config file {}: {}", path.display(), e))
    })?;
    parse_config_str(&content)
}

/// Parse configuration text; the first bad line aborts with its line number
pub fn parse_config_str(content: &str) -> Result<HaConfig> {
    let mut config = HaConfig::default();

    for (line_num, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        parse_line(line, &mut config)
            .map_err(|e| Error::Config(format!("line {}: {}", line_num + 1, e)))?;
    }

    Ok(config)
}

/// Apply one directive
fn parse_line(line: &str, config: &mut HaConfig) -> std::result::Result<(), String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(directive) = parts.first().map(|d| d.to_lowercase()) else {
        return Ok(());
    };
    let args = &parts[1..];
    let sentinel = &mut config.sentinel;

    match directive.as_str() {
        "sentinel" => {
            if args.is_empty() {
                return Err("sentinel requires at least one host".to_string());
            }
            sentinel
                .sentinel_hosts
                .extend(args.iter().map(|s| s.to_string()));
        }
        "master-name" => sentinel.master_name = single(args, &directive)?.to_string(),
        "scan-for-other-sentinels" => {
            sentinel.scan_for_other_sentinels = parse_bool(single(args, &directive)?)?
        }
        "refresh-sentinel-hosts-after" => {
            sentinel.refresh_sentinel_hosts_after = parse_ms(single(args, &directive)?)?
        }
        "reset-when-sdown" => {
            sentinel.reset_when_subjectively_down = parse_bool(single(args, &directive)?)?
        }
        "reset-when-odown" => {
            sentinel.reset_when_objectively_down = parse_bool(single(args, &directive)?)?
        }
        "wait-between-failed-hosts" => {
            sentinel.wait_between_failed_hosts = parse_ms(single(args, &directive)?)?
        }
        "max-wait-between-failed-hosts" => {
            sentinel.max_wait_between_failed_hosts = parse_ms(single(args, &directive)?)?
        }
        "wait-before-forcing-master-failover" => {
            sentinel.wait_before_forcing_master_failover = parse_ms(single(args, &directive)?)?
        }
        "verify-master-connections" => {
            sentinel.verify_master_connections = parse_bool(single(args, &directive)?)?
        }
        "sentinel-worker-timeout" => {
            sentinel.sentinel_worker_timeout = parse_ms(single(args, &directive)?)?
        }
        "host-lookup-timeout" => {
            sentinel.host_lookup_timeout = parse_ms(single(args, &directive)?)?
        }
        "ip-map" => {
            if args.len() != 2 {
                return Err("ip-map requires <reported-ip> <client-ip>".to_string());
            }
            sentinel
                .ip_address_map
                .insert(args[0].to_string(), args[1].to_string());
        }
        "heartbeat-interval" => {
            config.pubsub.heartbeat_interval = parse_optional_ms(single(args, &directive)?)?
        }
        "heartbeat-timeout" => {
            config.pubsub.heartbeat_timeout = parse_optional_ms(single(args, &directive)?)?
        }
        "auto-restart" => config.pubsub.auto_restart = parse_bool(single(args, &directive)?)?,
        "wait-before-next-restart" => {
            config.pubsub.wait_before_next_restart =
                parse_optional_ms(single(args, &directive)?)?
        }
        "tls" => config.tls.enabled = parse_bool(single(args, &directive)?)?,
        "tls-ca-cert-file" => {
            config.tls.ca_cert_file = Some(PathBuf::from(single(args, &directive)?))
        }
        "tls-cert-file" => config.tls.cert_file = Some(PathBuf::from(single(args, &directive)?)),
        "tls-key-file" => config.tls.key_file = Some(PathBuf::from(single(args, &directive)?)),
        "loglevel" => config.log.loglevel = single(args, &directive)?.to_lowercase(),
        "logfile" => {
            // logfile "" means stderr
            config.log.logfile = single(args, &directive)?.trim_matches('"').to_string()
        }
        "hide-user-data-from-log" => {
            config.log.hide_user_data_from_log = parse_bool(single(args, &directive)?)?
        }
        other => return Err(format!("unknown directive '{}'", other)),
    }

    Ok(())
}

fn single<'a>(args: &[&'a str], directive: &str) -> std::result::Result<&'a str, String> {
    match args {
        [value] => Ok(*value),
        [] => Err(format!("{} requires a value", directive)),
        _ => Err(format!("{} takes exactly one value", directive)),
    }
}

/// Parse boolean values (yes/no, true/false, 1/0)
fn parse_bool(s: &str) -> std::result::Result<bool, String> {
    match s.to_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(format!("invalid boolean value: {}", s)),
    }
}

fn parse_ms(s: &str) -> std::result::Result<Duration, String> {
    s.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| format!("invalid milliseconds value: {}", s))
}

fn parse_optional_ms(s: &str) -> std::result::Result<Option<Duration>, String> {
    if s.eq_ignore_ascii_case("none") || s == "0" {
        Ok(None)
    } else {
        parse_ms(s).map(Some)
    }
}
