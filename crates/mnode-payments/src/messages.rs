//! Balance / Promise Messaging
//!
//! Typed wrappers around the session dialog the two peers talk over.
//!
//! ```text
//!  provider                                   consumer
//!  ────────                                   ────────
//!  PeerSender<BalanceMessage> ─ session-balance ─▶ MessageListener<BalanceMessage>
//!  MessageListener<PromiseMessage> ◀─ session-promise ─ PeerSender<PromiseMessage>
//! ```
//!
//! On the wire every message is wrapped in a single-field JSON object,
//! `{"balanceMessage": {...}}` or `{"promiseMessage": {...}}`.

use crate::issuer::IssuedPromise;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Endpoint balance messages travel on
pub const BALANCE_ENDPOINT: &str = "session-balance";

/// Endpoint promise messages travel on
pub const PROMISE_ENDPOINT: &str = "session-promise";

/// Payloads buffered per listener before the dialog starts rejecting
const LISTENER_BUFFER: usize = 16;

/// "As of sequence N, your unconsumed balance is X"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceMessage {
    #[serde(rename = "sequenceID")]
    pub sequence_id: u64,
    pub balance: u64,
}

/// Signed commitment to pay `amount` as of `sequence_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseMessage {
    pub amount: u64,
    #[serde(rename = "sequenceID")]
    pub sequence_id: u64,
    /// `0x` prefixed hex of the issuer signature
    pub signature: String,
}

impl PromiseMessage {
    /// Message carrying an issued promise
    pub fn from_issued(issued: &IssuedPromise) -> Self {
        Self {
            amount: issued.promise.amount,
            sequence_id: issued.promise.seq_no,
            signature: format!("0x{}", hex::encode(&issued.issuer_signature)),
        }
    }
}

/// A message type with a fixed endpoint and wire wrapper field
pub trait PaymentMessage: Serialize + DeserializeOwned + Send + 'static {
    const ENDPOINT: &'static str;
    const FIELD: &'static str;
}

impl PaymentMessage for BalanceMessage {
    const ENDPOINT: &'static str = BALANCE_ENDPOINT;
    const FIELD: &'static str = "balanceMessage";
}

impl PaymentMessage for PromiseMessage {
    const ENDPOINT: &'static str = PROMISE_ENDPOINT;
    const FIELD: &'static str = "promiseMessage";
}

/// Messaging errors
#[derive(Debug, thiserror::Error)]
pub enum DialogError {
    #[error("sending to {endpoint} failed: {reason}")]
    Send { endpoint: String, reason: String },

    #[error("malformed {endpoint} payload: {source}")]
    Codec {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} listener is not keeping up")]
    QueueFull(String),

    #[error("{0} listener is closed")]
    Closed(String),
}

/// Bidirectional session dialog between the two peers
pub trait Dialog: Send + Sync {
    /// Deliver `payload` to the peer on `endpoint`
    fn send(&self, endpoint: &str, payload: Value) -> Result<(), DialogError>;

    /// Route every payload the peer sends on `endpoint` into `sink`
    fn receive(&self, endpoint: &str, sink: mpsc::Sender<Value>) -> Result<(), DialogError>;
}

pub(crate) fn encode<M: PaymentMessage>(message: &M) -> Result<Value, DialogError> {
    let inner = serde_json::to_value(message).map_err(|source| DialogError::Codec {
        endpoint: M::ENDPOINT.to_string(),
        source,
    })?;
    let mut wrapper = serde_json::Map::new();
    wrapper.insert(M::FIELD.to_string(), inner);
    Ok(Value::Object(wrapper))
}

pub(crate) fn decode<M: PaymentMessage>(mut payload: Value) -> Result<M, DialogError> {
    let inner = payload
        .get_mut(M::FIELD)
        .map(Value::take)
        .unwrap_or(Value::Null);
    serde_json::from_value(inner).map_err(|source| DialogError::Codec {
        endpoint: M::ENDPOINT.to_string(),
        source,
    })
}

/// Sends one message type to the peer
pub struct PeerSender<M> {
    dialog: Arc<dyn Dialog>,
    _message: PhantomData<fn(M)>,
}

impl<M: PaymentMessage> PeerSender<M> {
    pub fn new(dialog: Arc<dyn Dialog>) -> Self {
        Self {
            dialog,
            _message: PhantomData,
        }
    }

    pub fn send(&self, message: &M) -> Result<(), DialogError> {
        let payload = encode(message)?;
        debug!(endpoint = M::ENDPOINT, %payload, "sending");
        self.dialog.send(M::ENDPOINT, payload)
    }
}

/// Channel-backed listener for one message type.
///
/// Payloads that do not decode are logged and skipped.
pub struct MessageListener<M> {
    rx: mpsc::Receiver<Value>,
    _message: PhantomData<fn() -> M>,
}

impl<M: PaymentMessage> MessageListener<M> {
    /// Register on `dialog` for `M`'s endpoint
    pub fn listen(dialog: &dyn Dialog) -> Result<Self, DialogError> {
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        dialog.receive(M::ENDPOINT, tx)?;
        Ok(Self {
            rx,
            _message: PhantomData,
        })
    }

    /// Next message, or `None` once the dialog side is gone
    pub async fn recv(&mut self) -> Option<M> {
        loop {
            let payload = self.rx.recv().await?;
            if let Some(message) = Self::accept(payload) {
                return Some(message);
            }
        }
    }

    /// Next already-buffered message, without waiting
    pub fn try_recv(&mut self) -> Option<M> {
        while let Ok(payload) = self.rx.try_recv() {
            if let Some(message) = Self::accept(payload) {
                return Some(message);
            }
        }
        None
    }

    fn accept(payload: Value) -> Option<M> {
        match decode(payload) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(%err, "dropping payload");
                None
            }
        }
    }
}

type Routes = Arc<Mutex<HashMap<String, mpsc::Sender<Value>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process dialog: one half of a connected pair.
///
/// Used to wire both peers inside one process (tests, local sessions).
pub struct ChannelDialog {
    local: Routes,
    peer: Routes,
}

impl ChannelDialog {
    /// Two dialogs, each delivering to the other's listeners
    pub fn pair() -> (Self, Self) {
        let a = Routes::default();
        let b = Routes::default();
        (
            Self {
                local: Arc::clone(&a),
                peer: Arc::clone(&b),
            },
            Self { local: b, peer: a },
        )
    }
}

impl Dialog for ChannelDialog {
    fn send(&self, endpoint: &str, payload: Value) -> Result<(), DialogError> {
        let sink = lock(&self.peer)
            .get(endpoint)
            .cloned()
            .ok_or_else(|| DialogError::Send {
                endpoint: endpoint.to_string(),
                reason: "peer is not listening".to_string(),
            })?;

        sink.try_send(payload).map_err(|err| match err {
            TrySendError::Full(_) => DialogError::QueueFull(endpoint.to_string()),
            TrySendError::Closed(_) => DialogError::Closed(endpoint.to_string()),
        })
    }

    fn receive(&self, endpoint: &str, sink: mpsc::Sender<Value>) -> Result<(), DialogError> {
        lock(&self.local).insert(endpoint.to_string(), sink);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuer::{Identity, Promise};
    use serde_json::json;

    #[test]
    fn test_balance_wire_format() {
        let payload = encode(&BalanceMessage {
            sequence_id: 3,
            balance: 120,
        })
        .unwrap();
        assert_eq!(payload, json!({"balanceMessage": {"sequenceID": 3, "balance": 120}}));
    }

    #[test]
    fn test_promise_decode() {
        let payload = json!({"promiseMessage": {"amount": 59, "sequenceID": 2, "signature": "0xab"}});
        let message: PromiseMessage = decode(payload).unwrap();
        assert_eq!(
            message,
            PromiseMessage {
                amount: 59,
                sequence_id: 2,
                signature: "0xab".to_string()
            }
        );
    }

    #[test]
    fn test_decode_wrong_wrapper() {
        let payload = json!({"balanceMessage": {"sequenceID": 3, "balance": 120}});
        assert!(matches!(
            decode::<PromiseMessage>(payload),
            Err(DialogError::Codec { .. })
        ));
    }

    #[test]
    fn test_signature_is_hex_with_prefix() {
        let issued = IssuedPromise {
            promise: Promise {
                consumer: Identity::new("0xc"),
                receiver: Identity::new("0xr"),
                amount: 300,
                seq_no: 1,
            },
            issuer_signature: vec![0xde, 0xad, 0xBE, 0xef],
        };
        let message = PromiseMessage::from_issued(&issued);
        assert_eq!(message.signature, "0xdeadbeef");
        assert_eq!(message.amount, 300);
        assert_eq!(message.sequence_id, 1);
    }

    #[tokio::test]
    async fn test_channel_dialog_delivery() {
        let (provider, consumer) = ChannelDialog::pair();
        let mut balances = MessageListener::<BalanceMessage>::listen(&consumer).unwrap();

        let sender = PeerSender::<BalanceMessage>::new(Arc::new(provider));
        let message = BalanceMessage {
            sequence_id: 1,
            balance: 10,
        };
        sender.send(&message).unwrap();

        assert_eq!(balances.recv().await, Some(message));
    }

    #[test]
    fn test_send_without_listener() {
        let (provider, _consumer) = ChannelDialog::pair();
        let sender = PeerSender::<BalanceMessage>::new(Arc::new(provider));
        let err = sender
            .send(&BalanceMessage {
                sequence_id: 1,
                balance: 0,
            })
            .unwrap_err();
        assert!(matches!(err, DialogError::Send { .. }));
    }

    #[test]
    fn test_listener_skips_malformed() {
        let (provider, consumer) = ChannelDialog::pair();
        let mut promises = MessageListener::<PromiseMessage>::listen(&consumer).unwrap();

        provider.send(PROMISE_ENDPOINT, json!({"garbage": true})).unwrap();
        provider
            .send(
                PROMISE_ENDPOINT,
                json!({"promiseMessage": {"amount": 1, "sequenceID": 1, "signature": "0x"}}),
            )
            .unwrap();

        let message = promises.try_recv().unwrap();
        assert_eq!(message.amount, 1);
        assert!(promises.try_recv().is_none());
    }

    #[test]
    fn test_dropped_listener_is_closed() {
        let (provider, consumer) = ChannelDialog::pair();
        drop(MessageListener::<BalanceMessage>::listen(&consumer).unwrap());

        let err = provider.send(BALANCE_ENDPOINT, json!({})).unwrap_err();
        assert!(matches!(err, DialogError::Closed(_)));
    }
}
