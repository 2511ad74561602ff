use crate::exec::ExecError;

/// Errors surfaced by the firewall engines
#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error("packet filter command failed: {0}")]
    Exec(#[from] ExecError),

    #[error("invalid URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("URL {0:?} has no host")]
    MissingHost(String),
}
