//! Payment errors

use crate::issuer::IssueError;
use crate::messages::DialogError;
use crate::storage::StorageError;

/// Everything a payment loop can surface on its error channel.
///
/// The protocol violations are distinct variants so callers can tell a
/// slow peer ([`PromiseWaitTimeout`](PaymentError::PromiseWaitTimeout))
/// from a cheating one.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("unexpected promise amount: expected {expected}, provider reported {actual}")]
    UnexpectedAmount { expected: u64, actual: u64 },

    #[error("promise validation failed")]
    PromiseValidationFailed,

    #[error("did not get a new promise")]
    PromiseWaitTimeout,

    #[error("stale promise for sequence {sequence_id} with amount {amount}")]
    StalePromise { sequence_id: u64, amount: u64 },

    #[error("unconsumed amount is 0, while balance is {balance}")]
    BalanceInvariant { balance: u64 },

    #[error("promise amount overflow")]
    AmountOverflow,

    #[error("message channel closed")]
    ChannelClosed,

    #[error("promise storage: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Dialog(#[from] DialogError),

    #[error(transparent)]
    Issue(#[from] IssueError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            PaymentError::BalanceInvariant { balance: 42 }.to_string(),
            "unconsumed amount is 0, while balance is 42"
        );
        assert_eq!(
            PaymentError::PromiseWaitTimeout.to_string(),
            "did not get a new promise"
        );
    }
}
