//! mnode: VPN node agent
//!
//! Loads the configuration, installs the firewall (kill switch chain,
//! optional provider-side incoming firewall), punches the configured
//! exceptions and keeps everything in place until Ctrl-C.
//!
//! ```text
//! mnode [config.toml|config.json]
//! ```

mod config;

use anyhow::{Context, Result};
use config::NodeConfig;
use mnode_firewall::{
    incoming_firewall, outgoing_firewall, IncomingTrafficFirewall, OutgoingTrafficFirewall,
    RuleRemover, Scope,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => NodeConfig::load(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => NodeConfig::default(),
    };

    init_logging(&config.log.level);
    info!("mnode starting...");

    let charge = config
        .payments
        .charge_settings()
        .context("invalid payments configuration")?;
    info!(
        charge_period = ?charge.charge_period,
        promise_wait_timeout = ?charge.promise_wait_timeout,
        max_missed_promises = charge.max_missed_promises(),
        price_per_minute = config.payments.price_per_minute,
        "payment settings"
    );

    let outgoing = outgoing_firewall(&config.firewall);
    let incoming = incoming_firewall(&config.firewall);

    let result = serve(&config, outgoing.as_ref(), incoming.as_ref()).await;

    incoming.teardown();
    outgoing.teardown();
    info!("mnode shutting down");
    result
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// Install the firewall state and hold it until the shutdown signal
async fn serve(
    config: &NodeConfig,
    outgoing: &dyn OutgoingTrafficFirewall,
    incoming: &dyn IncomingTrafficFirewall,
) -> Result<()> {
    outgoing.setup().context("kill switch setup failed")?;
    incoming.setup().context("incoming firewall setup failed")?;

    let mut holds: Vec<RuleRemover> = Vec::new();
    let granted = grant(config, outgoing, &mut holds);

    let result = match granted {
        Ok(()) => {
            info!("mnode running, press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")
        }
        Err(err) => Err(err),
    };

    for hold in holds.iter().rev() {
        hold.remove();
    }
    result
}

fn grant(
    config: &NodeConfig,
    outgoing: &dyn OutgoingTrafficFirewall,
    holds: &mut Vec<RuleRemover>,
) -> Result<()> {
    let urls: Vec<&str> = config.firewall.allow_urls.iter().map(String::as_str).collect();
    if !urls.is_empty() {
        holds.push(
            outgoing
                .allow_url_access(&urls)
                .context("allowing configured URLs")?,
        );
        info!(count = urls.len(), "allowed configured URLs");
    }

    if config.firewall.kill_switch {
        holds.push(
            outgoing
                .block_outgoing_traffic(Scope::Global, &config.firewall.outbound_ip)
                .context("enabling kill switch")?,
        );
        info!(outbound_ip = %config.firewall.outbound_ip, "kill switch enabled");
    }
    Ok(())
}
