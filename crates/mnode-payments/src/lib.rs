//! mnode payments
//!
//! Per-session payment ping-pong between consumer and provider.
//!
//! # Protocol
//!
//! ```text
//!  provider                                        consumer
//!     │  BalanceMessage { sequenceID, balance }       │
//!     │ ─────────────────────────────────────────────▶│ align state
//!     │                                               │ issue current + balance
//!     │  PromiseMessage { amount, sequenceID, sig }   │
//!     │◀───────────────────────────────────────────── │
//!  validate, credit, store                            │
//!     │            ... every charge period ...        │
//! ```
//!
//! Both sides run as a tokio task behind a [`PaymentLoop`] handle. Any
//! protocol violation ends the loop and is reported on its error channel;
//! the channel closing means the loop is gone.

mod balance_tracker;
mod consumer;
mod consumer_tracker;
mod error;
mod handle;
mod issuer;
mod messages;
mod provider;
mod settings;
mod storage;

pub use balance_tracker::{
    AmountCalculator, BalanceTracker, ElapsedTimeKeeper, PerTimeAmountCalculator,
    ProviderBalanceTracker, TimeKeeper,
};
pub use consumer::ConsumerPaymentOrchestrator;
pub use consumer_tracker::{ConsumerTracker, PromiseState};
pub use error::PaymentError;
pub use handle::PaymentLoop;
pub use issuer::{
    Identity, IssueError, IssuedPromise, Issuer, Promise, PromiseValidator, SessionParties,
};
pub use messages::{
    BalanceMessage, ChannelDialog, Dialog, DialogError, MessageListener, PaymentMessage,
    PeerSender, PromiseMessage, BALANCE_ENDPOINT, PROMISE_ENDPOINT,
};
pub use provider::ProviderPaymentOrchestrator;
pub use settings::{ChargeSettings, PaymentsConfig, SettingsError};
pub use storage::{MemoryPromiseStorage, PromiseStorage, StorageError, StoredPromise};
