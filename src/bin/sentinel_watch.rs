//! Sockudo HA sentinel watcher
//!
//! Connects to a sentinel group, logs the current topology, and keeps logging
//! until Ctrl-C: every failover, plus a periodic topology and stats report.
//! With `--channel`, messages published on the master are logged as well.

use std::sync::Arc;

use sockudo_ha::cli::Cli;
use sockudo_ha::client::TcpConnector;
use sockudo_ha::logging::init_logging;
use sockudo_ha::pubsub::PubSubCallbacks;
use sockudo_ha::sentinel::{Sentinel, SentinelCallbacks};
use sockudo_ha::stats::AtomicStats;
use sockudo_ha::tls::load_client_tls_config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (cli, config) = Cli::load_config()?;
    init_logging(&config.log)?;

    let connector = if config.tls.is_configured() {
        let tls = load_client_tls_config(
            config.tls.ca_cert_file.as_deref(),
            config.tls.cert_file.as_deref(),
            config.tls.key_file.as_deref(),
        )?;
        TcpConnector::with_tls(tls, config.tls.enabled)
    } else {
        TcpConnector::new()
    };

    let stats = Arc::new(AtomicStats::new());
    let callbacks = SentinelCallbacks::default()
        .on_failover(|info| log::warn!("Failover complete: {}", info))
        .on_worker_error(|e| log::warn!("Sentinel error: {}", e))
        .on_sentinel_message_received(|channel, message| log::debug!("{} {}", channel, message));

    let sentinel = Sentinel::builder(config.sentinel.clone(), Arc::new(connector))
        .stats(stats.clone())
        .callbacks(callbacks)
        .build()?;

    log::info!(
        "Watching '{}' through {} sentinel(s)",
        sentinel.master_name(),
        sentinel.sentinel_endpoints().len()
    );
    let manager = sentinel.start().await?;

    match manager.resolver().create_master_client(0).await {
        Ok(client) => {
            log::info!("Master {} verified", client.endpoint());
            client.close().await;
        }
        Err(e) => log::warn!("Master verification failed: {}", e),
    }

    let listener = if cli.channels.is_empty() {
        None
    } else {
        let service = config
            .pubsub_service(manager.resolver(), cli.channels.clone())
            .callbacks(
                PubSubCallbacks::default()
                    .on_message(|channel, message| log::info!("{}: {}", channel, message))
                    .on_error(|e| log::warn!("Channel subscription failed: {}", e)),
            )
            .build();
        service.start().await?;
        Some(service)
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut report = tokio::time::interval(cli.report_interval());

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = report.tick() => {
                match sentinel.get_sentinel_info().await {
                    Ok(info) => log::info!("Topology: {}", info),
                    Err(e) => log::warn!("Topology lookup failed: {}", e),
                }
                let counters = stats
                    .snapshot()
                    .into_iter()
                    .filter(|(_, n)| *n > 0)
                    .map(|(name, n)| format!("{}={}", name, n))
                    .collect::<Vec<_>>()
                    .join(" ");
                if !counters.is_empty() {
                    log::info!("Stats: {}", counters);
                }
                if let Some(service) = &listener {
                    log::debug!("{}", service.stats_description());
                }
            }
        }
    }

    log::info!("Shutting down");
    if let Some(service) = &listener {
        service.dispose().await;
    }
    sentinel.dispose().await;
    Ok(())
}
