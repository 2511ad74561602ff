//! URL based exceptions
//!
//! Allowing a URL means allowing its host. A multi-URL request is
//! all-or-nothing: if any URL fails, the holds already granted for the
//! earlier ones are released before the error is returned.

use crate::error::FirewallError;
use crate::tracker::RuleRemover;
use url::{Host, Url};

/// Host part of `raw`, without IPv6 brackets
pub(crate) fn host_of(raw: &str) -> Result<String, FirewallError> {
    let parsed = Url::parse(raw).map_err(|source| FirewallError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;

    match parsed.host() {
        Some(Host::Ipv6(addr)) => Ok(addr.to_string()),
        Some(host) => Ok(host.to_string()),
        None => Err(FirewallError::MissingHost(raw.to_string())),
    }
}

pub(crate) fn allow_hosts<F>(urls: &[&str], mut grant: F) -> Result<RuleRemover, FirewallError>
where
    F: FnMut(&str) -> Result<RuleRemover, FirewallError>,
{
    let mut granted = Vec::with_capacity(urls.len());
    for raw in urls {
        match host_of(raw).and_then(|host| grant(&host)) {
            Ok(remover) => granted.push(remover),
            Err(err) => {
                for remover in &granted {
                    remover.remove();
                }
                return Err(err);
            }
        }
    }
    Ok(RuleRemover::combine(granted))
}
