//! Incoming Firewall (provider side)
//!
//! Restricts where traffic forwarded for consumers may go. Forwarded
//! packets from a consumer network jump into the provider chain, which
//! accepts destinations found in an ipset whitelist and rejects the rest.
//!
//! ```text
//! FORWARD
//!   -s <consumer network> -j MYST_PROVIDER_FIREWALL
//!
//! MYST_PROVIDER_FIREWALL
//!   1. -d <allowed host> -j ACCEPT
//!   2. -m set --match-set myst-provider-dst-whitelist dst -j ACCEPT
//!   3. -j REJECT
//! ```

use crate::error::FirewallError;
use crate::exec::{args, RuleExecutor};
use crate::hosts::allow_hosts;
use crate::rule::{
    add_rule_with_removal, delete_args_for_listed, Rule, DELETE_CHAIN, FLUSH_CHAIN, LIST_RULES,
    NEW_CHAIN,
};
use crate::tracker::{RuleRemover, RuleTracker, Undo};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default name of the provider chain
pub const PROVIDER_FIREWALL_CHAIN: &str = "MYST_PROVIDER_FIREWALL";

/// Default name of the destination whitelist set
pub const PROVIDER_WHITELIST_SET: &str = "myst-provider-dst-whitelist";

const FORWARD_CHAIN: &str = "FORWARD";

/// Whitelisted entries expire after a day unless re-added
const WHITELIST_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Incoming (forwarded) traffic firewall capability
pub trait IncomingTrafficFirewall: Send + Sync {
    /// Prepare chain and whitelist, repairing leftovers of a previous run
    fn setup(&self) -> Result<(), FirewallError>;

    /// Remove chain and whitelist. Best effort, errors are logged.
    fn teardown(&self);

    /// Send everything forwarded from `network` (CIDR) through the firewall
    fn block_incoming_traffic(&self, network: &str) -> Result<RuleRemover, FirewallError>;

    /// Whitelist destination `ip`
    fn allow_ip_access(&self, ip: IpAddr) -> Result<RuleRemover, FirewallError>;

    /// Accept traffic to the hosts of `urls`. All or nothing.
    fn allow_url_access(&self, urls: &[&str]) -> Result<RuleRemover, FirewallError>;
}

/// Backend used where no packet filter is available or wanted
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopIncomingFirewall;

impl IncomingTrafficFirewall for NoopIncomingFirewall {
    fn setup(&self) -> Result<(), FirewallError> {
        Ok(())
    }

    fn teardown(&self) {}

    fn block_incoming_traffic(&self, _network: &str) -> Result<RuleRemover, FirewallError> {
        Ok(RuleRemover::noop())
    }

    fn allow_ip_access(&self, _ip: IpAddr) -> Result<RuleRemover, FirewallError> {
        Ok(RuleRemover::noop())
    }

    fn allow_url_access(&self, urls: &[&str]) -> Result<RuleRemover, FirewallError> {
        allow_hosts(urls, |_| Ok(RuleRemover::noop()))
    }
}

/// iptables + ipset backed provider firewall
pub struct IptablesIncomingFirewall {
    iptables: Arc<dyn RuleExecutor>,
    ipset: Arc<dyn RuleExecutor>,
    chain: String,
    set: String,
    tracker: RuleTracker,
}

impl IptablesIncomingFirewall {
    pub fn new(iptables: Arc<dyn RuleExecutor>, ipset: Arc<dyn RuleExecutor>) -> Self {
        Self {
            iptables,
            ipset,
            chain: PROVIDER_FIREWALL_CHAIN.to_string(),
            set: PROVIDER_WHITELIST_SET.to_string(),
            tracker: RuleTracker::new(),
        }
    }

    /// Active holders of a tracked reference
    pub fn ref_count(&self, key: &str) -> usize {
        self.tracker.count(key)
    }

    fn iptables(&self, items: &[&str]) -> Result<Vec<String>, FirewallError> {
        Ok(self.iptables.exec(&args(items))?)
    }

    fn ipset(&self, items: &[&str]) -> Result<Vec<String>, FirewallError> {
        Ok(self.ipset.exec(&args(items))?)
    }

    fn check_ipset_version(&self) -> Result<(), FirewallError> {
        for line in self.ipset(&["version"])? {
            info!("[version check] {}", line);
        }
        Ok(())
    }

    fn create_whitelist(&self) -> Result<(), FirewallError> {
        let timeout = WHITELIST_TIMEOUT.as_secs().to_string();
        self.ipset(&["create", self.set.as_str(), "hash:ip", "timeout", timeout.as_str()])?;
        Ok(())
    }

    fn destroy_whitelist(&self) -> Result<(), FirewallError> {
        self.ipset(&["destroy", self.set.as_str()])?;
        Ok(())
    }

    fn setup_chain(&self) -> Result<(), FirewallError> {
        let chain = self.chain.as_str();
        self.iptables(&[NEW_CHAIN, chain])?;
        // whitelisted destinations pass
        self.iptables(&[
            "-A", chain, "-m", "set", "--match-set", self.set.as_str(), "dst", "-j", "ACCEPT",
        ])?;
        self.iptables(&["-A", chain, "-j", "REJECT"])?;
        Ok(())
    }

    fn cleanup_stale_rules(&self) -> Result<(), FirewallError> {
        let jump = format!("-j {}", self.chain);
        for rule in self.iptables(&[LIST_RULES, FORWARD_CHAIN])? {
            if rule.ends_with(&jump) {
                debug!(rule = %rule, "removing stale provider firewall reference");
                self.iptables.exec(&delete_args_for_listed(&rule))?;
            }
        }

        if let Err(err) = self.iptables(&[LIST_RULES, self.chain.as_str()]) {
            info!(%err, "[setup] provider firewall chain not listed, probably nothing to worry about");
            return Ok(());
        }

        self.iptables(&[FLUSH_CHAIN, self.chain.as_str()])?;
        self.iptables(&[DELETE_CHAIN, self.chain.as_str()])?;
        Ok(())
    }
}

impl IncomingTrafficFirewall for IptablesIncomingFirewall {
    fn setup(&self) -> Result<(), FirewallError> {
        self.check_ipset_version()?;
        self.cleanup_stale_rules()?;
        if let Err(err) = self.destroy_whitelist() {
            debug!(%err, "no stale whitelist set");
        }
        self.create_whitelist()?;
        self.setup_chain()?;
        info!(chain = %self.chain, set = %self.set, "provider firewall ready");
        Ok(())
    }

    fn teardown(&self) {
        if let Err(err) = self.cleanup_stale_rules() {
            warn!(%err, "error cleaning up iptables rules, you might want to do it yourself");
        }
        if let Err(err) = self.destroy_whitelist() {
            warn!(%err, "error deleting ipset table");
        }
    }

    fn block_incoming_traffic(&self, network: &str) -> Result<RuleRemover, FirewallError> {
        let rule = Rule::append_to(FORWARD_CHAIN).spec(["-s", network, "-j", self.chain.as_str()]);
        self.tracker
            .tracking_call(&format!("block:{network}"), || {
                add_rule_with_removal(&self.iptables, rule).map_err(FirewallError::from)
            })
    }

    fn allow_ip_access(&self, ip: IpAddr) -> Result<RuleRemover, FirewallError> {
        self.tracker.tracking_call(&format!("allow-ip:{ip}"), || {
            let ip = ip.to_string();
            self.ipset(&["add", self.set.as_str(), ip.as_str(), "-exist"])?;

            let ipset = Arc::clone(&self.ipset);
            let remove = args(&["del", self.set.as_str(), ip.as_str()]);
            Ok(Box::new(move || {
                if let Err(err) = ipset.exec(&remove) {
                    warn!(%err, args = ?remove, "error removing whitelisted ip");
                }
            }) as Undo)
        })
    }

    fn allow_url_access(&self, urls: &[&str]) -> Result<RuleRemover, FirewallError> {
        allow_hosts(urls, |host| {
            let rule = Rule::insert_at(self.chain.as_str(), 1).spec(["-d", host, "-j", "ACCEPT"]);
            self.tracker.tracking_call(&format!("allow:{host}"), || {
                add_rule_with_removal(&self.iptables, rule).map_err(FirewallError::from)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::RecordingExecutor;

    const CHAIN: &str = PROVIDER_FIREWALL_CHAIN;
    const SET: &str = PROVIDER_WHITELIST_SET;

    struct Fixture {
        iptables: Arc<RecordingExecutor>,
        ipset: Arc<RecordingExecutor>,
        fw: IptablesIncomingFirewall,
    }

    fn fixture(iptables: RecordingExecutor, ipset: RecordingExecutor) -> Fixture {
        let iptables = Arc::new(iptables);
        let ipset = Arc::new(ipset);
        let ipt: Arc<dyn RuleExecutor> = iptables.clone();
        let ips: Arc<dyn RuleExecutor> = ipset.clone();
        Fixture {
            iptables,
            ipset,
            fw: IptablesIncomingFirewall::new(ipt, ips),
        }
    }

    #[test]
    fn test_setup_after_crashed_run() {
        let f = fixture(
            RecordingExecutor::new().with_output(
                "-S FORWARD",
                &["-P FORWARD ACCEPT", "-A FORWARD -s 10.8.0.0/24 -j MYST_PROVIDER_FIREWALL"],
            ),
            RecordingExecutor::new().with_output("version", &["ipset v7.1, protocol version: 7"]),
        );

        f.fw.setup().unwrap();
        assert!(f.iptables.called_with(&["-D", "FORWARD", "-s", "10.8.0.0/24", "-j", CHAIN]));
        assert!(f.iptables.called_with(&["-F", CHAIN]));
        assert!(f.iptables.called_with(&["-X", CHAIN]));
        assert!(f.ipset.called_with(&["destroy", SET]));
        assert!(f.ipset.called_with(&["create", SET, "hash:ip", "timeout", "86400"]));
        assert!(f.iptables.called_with(&["-N", CHAIN]));
        assert!(f.iptables.called_with(&["-A", CHAIN, "-m", "set", "--match-set", SET, "dst", "-j", "ACCEPT"]));
        assert!(f.iptables.called_with(&["-A", CHAIN, "-j", "REJECT"]));
    }

    #[test]
    fn test_setup_tolerates_missing_set() {
        let f = fixture(
            RecordingExecutor::new().failing(&format!("-S {CHAIN}")),
            RecordingExecutor::new().failing(&format!("destroy {SET}")),
        );

        f.fw.setup().unwrap();
        assert!(!f.iptables.called_with(&["-X", CHAIN]));
        assert!(f.ipset.called_with(&["create", SET, "hash:ip", "timeout", "86400"]));
    }

    #[test]
    fn test_setup_requires_ipset() {
        let f = fixture(RecordingExecutor::new(), RecordingExecutor::new().failing("version"));
        assert!(f.fw.setup().is_err());
        assert!(f.iptables.calls().is_empty());
    }

    #[test]
    fn test_block_incoming_traffic() {
        let f = fixture(RecordingExecutor::new(), RecordingExecutor::new());

        let remove = f.fw.block_incoming_traffic("10.8.0.0/24").unwrap();
        assert!(f.iptables.called_with(&["-A", "FORWARD", "-s", "10.8.0.0/24", "-j", CHAIN]));
        remove.remove();
        assert!(f.iptables.called_with(&["-D", "FORWARD", "-s", "10.8.0.0/24", "-j", CHAIN]));
    }

    #[test]
    fn test_allow_ip_is_ref_counted() {
        let f = fixture(RecordingExecutor::new(), RecordingExecutor::new());
        let ip: IpAddr = "8.8.8.8".parse().unwrap();

        let first = f.fw.allow_ip_access(ip).unwrap();
        let second = f.fw.allow_ip_access(ip).unwrap();
        assert_eq!(f.ipset.times_called(&["add", SET, "8.8.8.8", "-exist"]), 1);

        first.remove();
        assert!(!f.ipset.called_with(&["del", SET, "8.8.8.8"]));
        second.remove();
        assert!(f.ipset.called_with(&["del", SET, "8.8.8.8"]));
        assert_eq!(f.fw.ref_count("allow-ip:8.8.8.8"), 0);
    }

    #[test]
    fn test_allow_url_access_rolls_back() {
        let f = fixture(RecordingExecutor::new(), RecordingExecutor::new());

        assert!(f.fw.allow_url_access(&["https://host1/api", "not a url"]).is_err());
        assert!(f.iptables.called_with(&["-I", CHAIN, "1", "-d", "host1", "-j", "ACCEPT"]));
        assert!(f.iptables.called_with(&["-D", CHAIN, "-d", "host1", "-j", "ACCEPT"]));
        assert_eq!(f.fw.ref_count("allow:host1"), 0);
    }

    #[test]
    fn test_teardown() {
        let f = fixture(RecordingExecutor::new(), RecordingExecutor::new().failing(&format!("destroy {SET}")));
        f.fw.teardown();
        assert!(f.iptables.called_with(&["-F", CHAIN]));
        assert!(f.iptables.called_with(&["-X", CHAIN]));
        assert!(f.ipset.called_with(&["destroy", SET]));
    }
}
