//! Promise issuing and validation boundaries
//!
//! Signing and signature verification live in the identity subsystem;
//! the payment loops only see these traits.

use crate::messages::PromiseMessage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Account address of a session party
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Addresses compare case-insensitively, so they are kept lowercase
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().to_lowercase())
    }

    pub fn address(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everyone involved in one paid session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParties {
    /// Who consumes the service and signs promises
    pub consumer: Identity,
    /// Who gets paid
    pub receiver: Identity,
    /// Whose key issues the promises
    pub issuer: Identity,
}

/// Unsigned promise payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promise {
    pub consumer: Identity,
    pub receiver: Identity,
    pub amount: u64,
    pub seq_no: u64,
}

/// Promise together with the issuer's signature over it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedPromise {
    pub promise: Promise,
    pub issuer_signature: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to issue promise: {0}")]
pub struct IssueError(pub String);

/// Signs promise payloads
pub trait Issuer: Send + Sync {
    fn issue(&self, promise: Promise) -> Result<IssuedPromise, IssueError>;
}

impl<F> Issuer for F
where
    F: Fn(Promise) -> Result<IssuedPromise, IssueError> + Send + Sync,
{
    fn issue(&self, promise: Promise) -> Result<IssuedPromise, IssueError> {
        self(promise)
    }
}

/// Checks a received promise against the expected issuer
pub trait PromiseValidator: Send + Sync {
    fn validate(&self, promise: &PromiseMessage) -> bool;
}

impl<F> PromiseValidator for F
where
    F: Fn(&PromiseMessage) -> bool + Send + Sync,
{
    fn validate(&self, promise: &PromiseMessage) -> bool {
        self(promise)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_lowercase() {
        let id = Identity::new("0xAbCd");
        assert_eq!(id.address(), "0xabcd");
        assert_eq!(id, Identity::new("0xABCD"));
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"0xabcd\"");
    }

    #[test]
    fn test_closure_issuer() {
        let issuer = |promise: Promise| -> Result<IssuedPromise, IssueError> {
            Ok(IssuedPromise {
                promise,
                issuer_signature: vec![1, 2],
            })
        };
        let issued = issuer
            .issue(Promise {
                consumer: Identity::new("c"),
                receiver: Identity::new("r"),
                amount: 5,
                seq_no: 1,
            })
            .unwrap();
        assert_eq!(issued.issuer_signature, vec![1, 2]);
    }
}
