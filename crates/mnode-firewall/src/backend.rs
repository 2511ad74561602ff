//! Backend selection
//!
//! Picks the firewall implementation once at startup from configuration
//! and platform, so the rest of the node only sees the capability traits.

use crate::exec::{CommandExecutor, RuleExecutor, IPSET_PATH, IPTABLES_PATH};
use crate::incoming::{IncomingTrafficFirewall, IptablesIncomingFirewall, NoopIncomingFirewall};
use crate::outgoing::{
    IptablesOutgoingFirewall, NoopOutgoingFirewall, OutgoingTrafficFirewall, KILL_SWITCH_CHAIN,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Firewall section of the node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Use the packet filter at all; false selects the no-op backends
    pub enabled: bool,
    /// Hold a Global block for the whole lifetime of the node
    pub kill_switch: bool,
    /// Source address whose traffic the kill switch captures
    pub outbound_ip: String,
    /// Kill switch chain name
    pub chain: String,
    /// Reject only new connections instead of every packet
    pub reject_new_only: bool,
    pub iptables_path: PathBuf,
    pub ipset_path: PathBuf,
    /// Prefix every invocation with sudo
    pub use_sudo: bool,
    /// Enable the provider side incoming firewall
    pub incoming: bool,
    /// Exceptions punched right after setup
    pub allow_urls: Vec<String>,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kill_switch: false,
            outbound_ip: "0.0.0.0/0".to_string(),
            chain: KILL_SWITCH_CHAIN.to_string(),
            reject_new_only: true,
            iptables_path: PathBuf::from(IPTABLES_PATH),
            ipset_path: PathBuf::from(IPSET_PATH),
            use_sudo: true,
            incoming: false,
            allow_urls: Vec::new(),
        }
    }
}

/// Whether the iptables backends can run on this platform
pub fn iptables_supported() -> bool {
    cfg!(target_os = "linux")
}

fn use_iptables(config: &FirewallConfig) -> bool {
    if !config.enabled {
        return false;
    }
    if !iptables_supported() {
        warn!("packet filter backend not supported on this platform, firewall disabled");
        return false;
    }
    true
}

/// Build the outgoing (kill switch) firewall described by `config`
pub fn outgoing_firewall(config: &FirewallConfig) -> Arc<dyn OutgoingTrafficFirewall> {
    if !use_iptables(config) {
        info!("using no-op outgoing firewall");
        return Arc::new(NoopOutgoingFirewall);
    }

    let executor: Arc<dyn RuleExecutor> =
        Arc::new(CommandExecutor::new(&config.iptables_path, config.use_sudo));
    info!(chain = %config.chain, "using iptables outgoing firewall");
    Arc::new(
        IptablesOutgoingFirewall::new(executor)
            .with_chain(config.chain.clone())
            .with_reject_new_only(config.reject_new_only),
    )
}

/// Build the provider side incoming firewall described by `config`
pub fn incoming_firewall(config: &FirewallConfig) -> Arc<dyn IncomingTrafficFirewall> {
    if !config.incoming || !use_iptables(config) {
        return Arc::new(NoopIncomingFirewall);
    }

    let iptables: Arc<dyn RuleExecutor> =
        Arc::new(CommandExecutor::new(&config.iptables_path, config.use_sudo));
    let ipset: Arc<dyn RuleExecutor> =
        Arc::new(CommandExecutor::new(&config.ipset_path, config.use_sudo));
    info!("using iptables incoming firewall");
    Arc::new(IptablesIncomingFirewall::new(iptables, ipset))
}
