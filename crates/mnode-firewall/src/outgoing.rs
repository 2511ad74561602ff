//! Outgoing Firewall (Kill Switch)
//!
//! Blocks every outgoing packet from the node's outbound address except
//! the ones explicitly allowed, so nothing leaks while a tunnel is being
//! (re)established or after it drops.
//!
//! # Chain layout
//!
//! ```text
//! OUTPUT
//!   -s <outbound ip> -j MYST_CONSUMER_KILL_SWITCH      (while blocked)
//!
//! MYST_CONSUMER_KILL_SWITCH
//!   1. -d <allowed host> -j ACCEPT                      (per exception)
//!   2. -p tcp --dport 53 -j ACCEPT
//!   3. -p udp --dport 53 -j ACCEPT
//!   4. -m conntrack --ctstate NEW -j REJECT
//! ```
//!
//! # Scopes
//!
//! A block is either [`Scope::Session`] (lives as long as one connection)
//! or [`Scope::Global`] (user asked for a permanent kill switch). Global
//! always wins: while it is active, Session requests are accepted but do
//! nothing, and so do their removers. Releasing the Global hold falls back
//! to Session if Session holders remain. Requests for [`Scope::None`] are
//! no-ops.

use crate::error::FirewallError;
use crate::exec::{args, RuleExecutor};
use crate::hosts::allow_hosts;
use crate::rule::{
    add_rule_with_removal, delete_args_for_listed, Rule, DELETE_CHAIN, FLUSH_CHAIN, LIST_RULES,
    NEW_CHAIN, VERSION,
};
use crate::tracker::{lock, RefCounts, RuleRemover};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Default name of the kill switch chain
pub const KILL_SWITCH_CHAIN: &str = "MYST_CONSUMER_KILL_SWITCH";

const OUTPUT_CHAIN: &str = "OUTPUT";
const BLOCK_TRAFFIC_REF: &str = "block-traffic";

/// Lifetime class of a traffic block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// No block is active
    #[default]
    None,
    /// Block tied to a single service connection
    Session,
    /// Block for the whole lifetime of the node
    Global,
}

/// Outgoing traffic firewall capability
pub trait OutgoingTrafficFirewall: Send + Sync {
    /// Prepare chains, repairing anything left over by a previous run
    fn setup(&self) -> Result<(), FirewallError>;

    /// Remove everything `setup` created. Best effort, errors are logged.
    fn teardown(&self);

    /// Block all outgoing traffic from `outbound_ip` with the given scope
    fn block_outgoing_traffic(
        &self,
        scope: Scope,
        outbound_ip: &str,
    ) -> Result<RuleRemover, FirewallError>;

    /// Allow traffic to `ip` (or hostname) through an active block
    fn allow_ip_access(&self, ip: &str) -> Result<RuleRemover, FirewallError>;

    /// Allow traffic to the hosts of `urls`. All or nothing.
    fn allow_url_access(&self, urls: &[&str]) -> Result<RuleRemover, FirewallError> {
        allow_hosts(urls, |host| self.allow_ip_access(host))
    }
}

/// Backend used where no packet filter is available or wanted
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopOutgoingFirewall;

impl OutgoingTrafficFirewall for NoopOutgoingFirewall {
    fn setup(&self) -> Result<(), FirewallError> {
        debug!("no-op firewall: setup");
        Ok(())
    }

    fn teardown(&self) {}

    fn block_outgoing_traffic(
        &self,
        _scope: Scope,
        _outbound_ip: &str,
    ) -> Result<RuleRemover, FirewallError> {
        Ok(RuleRemover::noop())
    }

    fn allow_ip_access(&self, _ip: &str) -> Result<RuleRemover, FirewallError> {
        Ok(RuleRemover::noop())
    }
}

/// Scope and exception holds, changed together under one lock so a Global
/// check and the registration of a new hold cannot interleave.
#[derive(Debug, Default)]
struct TrafficState {
    scope: Scope,
    global: bool,
    refs: RefCounts,
}

impl TrafficState {
    fn release_block(&mut self, global: bool) {
        if global {
            self.global = false;
        }
        let last = self.refs.release(BLOCK_TRAFFIC_REF);
        if last {
            self.scope = Scope::None;
            info!("outgoing traffic unblocked");
        } else if global {
            self.scope = Scope::Session;
            info!("global block released, session blocks remain");
        }
    }
}

/// iptables backed kill switch
pub struct IptablesOutgoingFirewall {
    executor: Arc<dyn RuleExecutor>,
    chain: String,
    reject_new_only: bool,
    state: Arc<Mutex<TrafficState>>,
}

impl IptablesOutgoingFirewall {
    /// Create a kill switch driving `executor`
    pub fn new(executor: Arc<dyn RuleExecutor>) -> Self {
        Self {
            executor,
            chain: KILL_SWITCH_CHAIN.to_string(),
            reject_new_only: true,
            state: Arc::new(Mutex::new(TrafficState::default())),
        }
    }

    /// Use a different chain name
    pub fn with_chain(mut self, chain: impl Into<String>) -> Self {
        self.chain = chain.into();
        self
    }

    /// Reject only new connections (default) or every packet
    pub fn with_reject_new_only(mut self, reject_new_only: bool) -> Self {
        self.reject_new_only = reject_new_only;
        self
    }

    /// Name of the kill switch chain
    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// Currently active block scope
    pub fn scope(&self) -> Scope {
        lock(&self.state).scope
    }

    /// Active holders of a tracked reference
    pub fn ref_count(&self, key: &str) -> usize {
        lock(&self.state).refs.count(key)
    }

    fn exec(&self, items: &[&str]) -> Result<Vec<String>, FirewallError> {
        Ok(self.executor.exec(&args(items))?)
    }

    fn check_version(&self) -> Result<(), FirewallError> {
        for line in self.exec(&[VERSION])? {
            info!("[version check] {}", line);
        }
        Ok(())
    }

    fn setup_chain(&self) -> Result<(), FirewallError> {
        let chain = self.chain.as_str();
        self.exec(&[NEW_CHAIN, chain])?;

        // everything reaching the chain is rejected unless allowed above
        if self.reject_new_only {
            self.exec(&["-A", chain, "-m", "conntrack", "--ctstate", "NEW", "-j", "REJECT"])?;
        } else {
            self.exec(&["-A", chain, "-j", "REJECT"])?;
        }

        // name resolution keeps working while blocked
        self.exec(&["-I", chain, "1", "-p", "udp", "--dport", "53", "-j", "ACCEPT"])?;
        self.exec(&["-I", chain, "1", "-p", "tcp", "--dport", "53", "-j", "ACCEPT"])?;
        Ok(())
    }

    fn cleanup_stale_rules(&self) -> Result<(), FirewallError> {
        let jump = format!("-j {}", self.chain);
        for rule in self.exec(&[LIST_RULES, OUTPUT_CHAIN])? {
            if rule.ends_with(&jump) {
                debug!(rule = %rule, "removing stale kill switch reference");
                self.executor.exec(&delete_args_for_listed(&rule))?;
            }
        }

        if let Err(err) = self.exec(&[LIST_RULES, self.chain.as_str()]) {
            // no such chain, nothing left to clean
            info!(%err, "[setup] kill switch chain not listed, probably nothing to worry about");
            return Ok(());
        }

        self.exec(&[FLUSH_CHAIN, self.chain.as_str()])?;
        self.exec(&[DELETE_CHAIN, self.chain.as_str()])?;
        Ok(())
    }
}

impl OutgoingTrafficFirewall for IptablesOutgoingFirewall {
    fn setup(&self) -> Result<(), FirewallError> {
        self.check_version()?;
        self.cleanup_stale_rules()?;
        self.setup_chain()?;
        info!(chain = %self.chain, "kill switch chain ready");
        Ok(())
    }

    fn teardown(&self) {
        if let Err(err) = self.cleanup_stale_rules() {
            warn!(%err, "error cleaning up iptables rules, you might want to do it yourself");
        }
    }

    fn block_outgoing_traffic(
        &self,
        scope: Scope,
        outbound_ip: &str,
    ) -> Result<RuleRemover, FirewallError> {
        if scope == Scope::None {
            debug!("block requested without scope, ignoring");
            return Ok(RuleRemover::noop());
        }

        let mut state = lock(&self.state);
        if state.global {
            debug!(requested = ?scope, "global block active, ignoring block request");
            return Ok(RuleRemover::noop());
        }

        let rule = Rule::append_to(OUTPUT_CHAIN).spec(["-s", outbound_ip, "-j", self.chain.as_str()]);
        state
            .refs
            .acquire(BLOCK_TRAFFIC_REF, || add_rule_with_removal(&self.executor, rule))?;
        let global = scope == Scope::Global;
        state.global = global;
        state.scope = scope;
        info!(scope = ?scope, outbound_ip, "outgoing traffic blocked");

        let shared = Arc::clone(&self.state);
        Ok(RuleRemover::new(move || lock(&shared).release_block(global)))
    }

    fn allow_ip_access(&self, ip: &str) -> Result<RuleRemover, FirewallError> {
        let key = format!("allow:{ip}");
        let rule = Rule::insert_at(self.chain.as_str(), 1).spec(["-d", ip, "-j", "ACCEPT"]);

        lock(&self.state)
            .refs
            .acquire(&key, || add_rule_with_removal(&self.executor, rule))?;
        debug!(ip, "outgoing access allowed");

        let shared = Arc::clone(&self.state);
        Ok(RuleRemover::new(move || {
            lock(&shared).refs.release(&key);
        }))
    }
}
