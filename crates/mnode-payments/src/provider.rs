//! Provider Payment Orchestrator
//!
//! Charges the consumer once per charge period:
//!
//! ```text
//!        ┌────────────── charge period ───────────────┐
//!        ▼                                             │
//!  check invariant ─▶ persist balance ─▶ send balance ─▶ wait promise
//!        │ violated: report, skip cycle                 │   │    │
//!        └──────────────────────────────────────────────┘   │    └─ timeout: count miss,
//!                                                            │       fatal at the limit
//!                                         valid: credit + store
//!                                         invalid / stale: fatal
//! ```
//!
//! A failed balance send is reported but the cycle goes on: the balance
//! is recomputed from scratch every period anyway.

use crate::balance_tracker::BalanceTracker;
use crate::error::PaymentError;
use crate::handle::{stopped, ErrorSink, PaymentLoop, StopSignal};
use crate::issuer::{PromiseValidator, SessionParties};
use crate::messages::{BalanceMessage, Dialog, DialogError, MessageListener, PeerSender, PromiseMessage};
use crate::settings::ChargeSettings;
use crate::storage::{PromiseStorage, StorageError, StoredPromise};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

enum Flow {
    Continue,
    Stop,
}

enum Wait {
    Stopped,
    Promise(Option<PromiseMessage>),
    TimedOut,
}

/// Provider side of the balance/promise ping-pong for one session
pub struct ProviderPaymentOrchestrator {
    settings: ChargeSettings,
    balance_sender: PeerSender<BalanceMessage>,
    promises: MessageListener<PromiseMessage>,
    tracker: Box<dyn BalanceTracker>,
    validator: Arc<dyn PromiseValidator>,
    storage: Arc<dyn PromiseStorage>,
    parties: SessionParties,
    sequence_id: u64,
    missed_promises: u32,
}

impl ProviderPaymentOrchestrator {
    /// Register for promises on `dialog` and prepare the loop
    pub fn new(
        dialog: Arc<dyn Dialog>,
        tracker: Box<dyn BalanceTracker>,
        validator: Arc<dyn PromiseValidator>,
        storage: Arc<dyn PromiseStorage>,
        parties: SessionParties,
        settings: ChargeSettings,
    ) -> Result<Self, DialogError> {
        let promises = MessageListener::listen(dialog.as_ref())?;
        Ok(Self {
            settings,
            balance_sender: PeerSender::new(dialog),
            promises,
            tracker,
            validator,
            storage,
            parties,
            sequence_id: 0,
            missed_promises: 0,
        })
    }

    /// Spawn the loop. Must be called inside a tokio runtime.
    pub fn start(self) -> PaymentLoop {
        PaymentLoop::spawn(|stop, errors| self.run(stop, errors))
    }

    async fn run(mut self, mut stop: StopSignal, errors: ErrorSink) {
        if let Err(err) = self.load_initial_state() {
            error!(%err, consumer = %self.parties.consumer, "failed to load promise state");
            errors.fatal(err).await;
            return;
        }

        let mut delay = self.settings.first_charge_delay;
        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                _ = sleep(delay) => {}
            }
            delay = self.settings.charge_period;

            match self.charge(&mut stop, &errors).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(err) => {
                    error!(%err, consumer = %self.parties.consumer, "provider payments failed");
                    errors.fatal(err).await;
                    return;
                }
            }
        }
        debug!(consumer = %self.parties.consumer, "provider payments stopped");
    }

    /// Resume the consumer's open sequence, or open a new one
    fn load_initial_state(&mut self) -> Result<(), PaymentError> {
        let SessionParties {
            consumer,
            receiver,
            issuer,
        } = &self.parties;

        let stored = match self.storage.find_promise_for_consumer(issuer, consumer) {
            Ok(stored) => stored,
            Err(StorageError::NotFound | StorageError::NoPromiseForConsumer) => {
                let id = self
                    .storage
                    .get_new_seq_id_for_issuer(consumer, receiver, issuer)?;
                StoredPromise::new(id, consumer.clone(), receiver.clone())
            }
            Err(err) => return Err(err.into()),
        };

        info!(
            seq = stored.sequence_id,
            unconsumed = stored.unconsumed_amount,
            %consumer,
            "starting provider payments"
        );
        self.sequence_id = stored.sequence_id;
        self.tracker.add(stored.unconsumed_amount);
        self.tracker.start();
        Ok(())
    }

    async fn charge(&mut self, stop: &mut StopSignal, errors: &ErrorSink) -> Result<Flow, PaymentError> {
        let balance = self.tracker.balance();
        match self.persist_balance(balance) {
            Ok(()) => {}
            Err(err @ PaymentError::BalanceInvariant { .. }) => {
                warn!(%err, "skipping charge cycle");
                errors.report(err, stop).await;
                return Ok(Flow::Continue);
            }
            Err(err) => return Err(err),
        }

        let message = BalanceMessage {
            sequence_id: self.sequence_id,
            balance,
        };
        if let Err(err) = self.balance_sender.send(&message) {
            warn!(%err, "failed to send balance");
            errors.report(err.into(), stop).await;
        }

        let wait = tokio::select! {
            biased;
            _ = stopped(stop) => Wait::Stopped,
            promise = self.promises.recv() => Wait::Promise(promise),
            _ = sleep(self.settings.promise_wait_timeout) => Wait::TimedOut,
        };

        match wait {
            Wait::Stopped => Ok(Flow::Stop),
            Wait::Promise(Some(promise)) => {
                self.accept_promise(promise)?;
                Ok(Flow::Continue)
            }
            Wait::Promise(None) => Err(PaymentError::ChannelClosed),
            Wait::TimedOut => {
                self.promise_missed()?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Record the current balance as the unconsumed amount of the sequence
    fn persist_balance(&self, balance: u64) -> Result<(), PaymentError> {
        let mut stored = self
            .storage
            .get_promise(&self.parties.issuer, self.sequence_id)?;

        if stored.unconsumed_amount == 0 && balance != 0 {
            return Err(PaymentError::BalanceInvariant { balance });
        }

        stored.unconsumed_amount = balance;
        self.storage.update(&self.parties.issuer, stored)?;
        Ok(())
    }

    fn accept_promise(&mut self, promise: PromiseMessage) -> Result<(), PaymentError> {
        debug!(amount = promise.amount, seq = promise.sequence_id, "promise received");
        if !self.validator.validate(&promise) {
            return Err(PaymentError::PromiseValidationFailed);
        }

        let mut stored = self
            .storage
            .get_promise(&self.parties.issuer, self.sequence_id)?;
        let previous = stored.message.as_ref().map_or(0, |m| m.amount);

        let stale = PaymentError::StalePromise {
            sequence_id: promise.sequence_id,
            amount: promise.amount,
        };
        if promise.sequence_id != self.sequence_id {
            return Err(stale);
        }
        let added = promise.amount.checked_sub(previous).ok_or(stale)?;

        stored.unconsumed_amount = stored
            .unconsumed_amount
            .checked_add(added)
            .ok_or(PaymentError::AmountOverflow)?;
        stored.message = Some(promise);

        self.tracker.add(added);
        self.storage.update(&self.parties.issuer, stored)?;
        self.missed_promises = 0;
        Ok(())
    }

    fn promise_missed(&mut self) -> Result<(), PaymentError> {
        self.missed_promises += 1;
        let limit = self.settings.max_missed_promises();
        if self.missed_promises >= limit {
            return Err(PaymentError::PromiseWaitTimeout);
        }
        warn!(missed = self.missed_promises, limit, "failed to receive promise");
        Ok(())
    }
}
