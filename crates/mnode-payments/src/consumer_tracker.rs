//! Consumer Promise Tracker
//!
//! Keeps the consumer's view of `{seq, amount}` in step with what the
//! provider reports and issues promises on top of it.
//!
//! # Alignment rules
//!
//! - provider `seq` ahead of ours: a new promise epoch. Adopt the
//!   sequence and restart the amount at 0, whatever the provider claims.
//! - otherwise the provider's amount must equal ours exactly. Both over
//!   and under reporting are rejected.
//!
//! Issuing never mutates the state; it moves only when the provider
//! reports it on the next balance message.

use crate::error::PaymentError;
use crate::issuer::{Identity, IssuedPromise, Issuer, Promise};
use std::sync::Arc;
use tracing::{debug, info};

/// Consumer-local promise state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromiseState {
    pub seq: u64,
    pub amount: u64,
}

/// Tracks promises issued by one consumer to one receiver
pub struct ConsumerTracker {
    current: PromiseState,
    consumer: Identity,
    receiver: Identity,
    issuer: Arc<dyn Issuer>,
}

impl ConsumerTracker {
    pub fn new(
        initial: PromiseState,
        consumer: Identity,
        receiver: Identity,
        issuer: Arc<dyn Issuer>,
    ) -> Self {
        Self {
            current: initial,
            consumer,
            receiver,
            issuer,
        }
    }

    /// Current local state
    pub fn state(&self) -> PromiseState {
        self.current
    }

    /// Reconcile local state with the provider's report
    pub fn align_state_with_provider(&mut self, provider: PromiseState) -> Result<(), PaymentError> {
        if provider.seq > self.current.seq {
            info!(
                from = self.current.seq,
                to = provider.seq,
                "provider started a new promise sequence"
            );
            self.current = PromiseState {
                seq: provider.seq,
                amount: 0,
            };
            return Ok(());
        }

        if provider.amount != self.current.amount {
            return Err(PaymentError::UnexpectedAmount {
                expected: self.current.amount,
                actual: provider.amount,
            });
        }
        Ok(())
    }

    /// Sign a promise for the current amount plus `amount_to_add`
    pub fn issue_promise_with_added_amount(
        &self,
        amount_to_add: u64,
    ) -> Result<IssuedPromise, PaymentError> {
        let amount = self
            .current
            .amount
            .checked_add(amount_to_add)
            .ok_or(PaymentError::AmountOverflow)?;

        let promise = Promise {
            consumer: self.consumer.clone(),
            receiver: self.receiver.clone(),
            amount,
            seq_no: self.current.seq,
        };
        debug!(amount, seq = promise.seq_no, "issuing promise");
        Ok(self.issuer.issue(promise)?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::issuer::IssueError;

    /// Issuer that "signs" with a fixed byte string
    pub fn fixed_issuer(signature: &[u8]) -> Arc<dyn Issuer> {
        let signature = signature.to_vec();
        Arc::new(move |promise: Promise| -> Result<IssuedPromise, IssueError> {
            Ok(IssuedPromise {
                promise,
                issuer_signature: signature.clone(),
            })
        })
    }

    pub fn failing_issuer() -> Arc<dyn Issuer> {
        Arc::new(|_: Promise| -> Result<IssuedPromise, IssueError> {
            Err(IssueError("keystore locked".to_string()))
        })
    }
}
