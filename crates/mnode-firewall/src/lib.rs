//! mnode firewall
//!
//! Packet filter plumbing for the node: a kill switch that keeps traffic
//! from leaking around the tunnel, and a provider side firewall limiting
//! where forwarded consumer traffic may go.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  connection lifecycle / DNS whitelist / HTTP allow-list   │
//! └───────────────┬─────────────────────────┬────────────────┘
//!                 │ block_outgoing_traffic   │ allow_ip / allow_url
//!                 ▼                          ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │           OutgoingTrafficFirewall (scope + refs)          │
//! │                ref-counted apply / undo                   │
//! └───────────────────────────┬──────────────────────────────┘
//!                             │ argument lists
//!                             ▼
//!                ┌──────────────────────────┐
//!                │ RuleExecutor (sudo tool) │
//!                └──────────────────────────┘
//! ```
//!
//! Every allow/block call returns a [`RuleRemover`]. The underlying rule
//! is installed for the first holder and removed after the last one.

mod backend;
mod error;
mod exec;
mod hosts;
mod incoming;
mod outgoing;
mod rule;
mod tracker;

pub use backend::{incoming_firewall, iptables_supported, outgoing_firewall, FirewallConfig};
pub use error::FirewallError;
pub use exec::{CommandExecutor, ExecError, RuleExecutor, IPSET_PATH, IPTABLES_PATH};
pub use incoming::{
    IncomingTrafficFirewall, IptablesIncomingFirewall, NoopIncomingFirewall,
    PROVIDER_FIREWALL_CHAIN, PROVIDER_WHITELIST_SET,
};
pub use outgoing::{
    IptablesOutgoingFirewall, NoopOutgoingFirewall, OutgoingTrafficFirewall, Scope,
    KILL_SWITCH_CHAIN,
};
pub use rule::{add_rule_with_removal, Rule};
pub use tracker::{RefCounts, RuleRemover, RuleTracker, Undo};
