//! Consumer Payment Orchestrator
//!
//! Answers every balance message with a promise:
//! align with the provider's state, issue `current + balance`, send it.
//! Every failure ends the loop.

use crate::consumer_tracker::{ConsumerTracker, PromiseState};
use crate::error::PaymentError;
use crate::handle::{stopped, ErrorSink, PaymentLoop, StopSignal};
use crate::messages::{BalanceMessage, Dialog, DialogError, MessageListener, PeerSender, PromiseMessage};
use std::sync::Arc;
use tracing::{debug, error};

/// Consumer side of the balance/promise ping-pong for one session
pub struct ConsumerPaymentOrchestrator {
    balances: MessageListener<BalanceMessage>,
    promise_sender: PeerSender<PromiseMessage>,
    tracker: ConsumerTracker,
}

impl ConsumerPaymentOrchestrator {
    /// Register for balance messages on `dialog`
    pub fn new(dialog: Arc<dyn Dialog>, tracker: ConsumerTracker) -> Result<Self, DialogError> {
        let balances = MessageListener::listen(dialog.as_ref())?;
        Ok(Self {
            balances,
            promise_sender: PeerSender::new(dialog),
            tracker,
        })
    }

    /// Spawn the loop. Must be called inside a tokio runtime.
    pub fn start(self) -> PaymentLoop {
        PaymentLoop::spawn(|stop, errors| self.run(stop, errors))
    }

    async fn run(mut self, mut stop: StopSignal, errors: ErrorSink) {
        loop {
            let received = tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                balance = self.balances.recv() => balance,
            };

            let result = match received {
                Some(balance) => self.pay(balance),
                None => Err(PaymentError::ChannelClosed),
            };
            if let Err(err) = result {
                error!(%err, "consumer payments failed");
                errors.fatal(err).await;
                return;
            }
        }
        debug!("consumer payments stopped");
    }

    fn pay(&mut self, balance: BalanceMessage) -> Result<(), PaymentError> {
        debug!(seq = balance.sequence_id, balance = balance.balance, "balance received");
        self.tracker.align_state_with_provider(PromiseState {
            seq: balance.sequence_id,
            amount: balance.balance,
        })?;

        let issued = self.tracker.issue_promise_with_added_amount(balance.balance)?;
        self.promise_sender.send(&PromiseMessage::from_issued(&issued))?;
        Ok(())
    }
}
