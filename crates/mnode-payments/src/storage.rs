//! Promise storage
//!
//! Provider-side record of the promises received per issuer. Also hands
//! out sequence ids: the first one for an issuer is 1, every later one is
//! the last stored id + 1 and is stored immediately so two sessions never
//! share an id.

use crate::issuer::Identity;
use crate::messages::PromiseMessage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

const FIRST_PROMISE_ID: u64 = 1;

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("promise not found")]
    NotFound,

    #[error("no promise for consumer")]
    NoPromiseForConsumer,

    #[error("storage backend: {0}")]
    Backend(String),
}

/// A promise as kept by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPromise {
    #[serde(rename = "sequenceID")]
    pub sequence_id: u64,
    /// Last promise the consumer sent for this sequence
    pub message: Option<PromiseMessage>,
    /// Promised but not yet consumed
    pub unconsumed_amount: u64,
    #[serde(rename = "consumerID")]
    pub consumer: Identity,
    pub receiver: Identity,
    /// Settled; later sessions must start a new sequence
    pub cleared: bool,
    pub added_at: Option<SystemTime>,
    pub updated_at: Option<SystemTime>,
}

impl StoredPromise {
    /// Empty record opening `sequence_id`
    pub fn new(sequence_id: u64, consumer: Identity, receiver: Identity) -> Self {
        Self {
            sequence_id,
            message: None,
            unconsumed_amount: 0,
            consumer,
            receiver,
            cleared: false,
            added_at: None,
            updated_at: None,
        }
    }
}

/// Persistence boundary, keyed by issuer
pub trait PromiseStorage: Send + Sync {
    /// Open and store the next sequence for `issuer`
    fn get_new_seq_id_for_issuer(
        &self,
        consumer: &Identity,
        receiver: &Identity,
        issuer: &Identity,
    ) -> Result<u64, StorageError>;

    /// Insert or overwrite, stamping `added_at`
    fn store(&self, issuer: &Identity, promise: StoredPromise) -> Result<(), StorageError>;

    /// Overwrite an existing record, stamping `updated_at`
    fn update(&self, issuer: &Identity, promise: StoredPromise) -> Result<(), StorageError>;

    fn get_promise(&self, issuer: &Identity, sequence_id: u64) -> Result<StoredPromise, StorageError>;

    /// Record with the highest sequence id
    fn get_last_promise(&self, issuer: &Identity) -> Result<StoredPromise, StorageError>;

    /// Newest promise of `consumer` that can still be extended: the scan
    /// stops at the first cleared promise.
    fn find_promise_for_consumer(
        &self,
        issuer: &Identity,
        consumer: &Identity,
    ) -> Result<StoredPromise, StorageError>;

    fn get_all_known_issuers(&self) -> Vec<Identity>;

    /// All records for `issuer`, ascending by sequence id
    fn get_all_promises_from_issuer(
        &self,
        issuer: &Identity,
    ) -> Result<Vec<StoredPromise>, StorageError>;
}

type Buckets = BTreeMap<Identity, BTreeMap<u64, StoredPromise>>;

/// [`PromiseStorage`] held in memory
#[derive(Debug, Default)]
pub struct MemoryPromiseStorage {
    buckets: Mutex<Buckets>,
}

impl MemoryPromiseStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn buckets(&self) -> MutexGuard<'_, Buckets> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn insert_stamped(buckets: &mut Buckets, issuer: &Identity, mut promise: StoredPromise) {
    promise.added_at = Some(SystemTime::now());
    buckets
        .entry(issuer.clone())
        .or_default()
        .insert(promise.sequence_id, promise);
}

impl PromiseStorage for MemoryPromiseStorage {
    fn get_new_seq_id_for_issuer(
        &self,
        consumer: &Identity,
        receiver: &Identity,
        issuer: &Identity,
    ) -> Result<u64, StorageError> {
        let mut buckets = self.buckets();
        let id = buckets
            .get(issuer)
            .and_then(|bucket| bucket.keys().next_back())
            .map_or(FIRST_PROMISE_ID, |last| last + 1);

        insert_stamped(
            &mut buckets,
            issuer,
            StoredPromise::new(id, consumer.clone(), receiver.clone()),
        );
        Ok(id)
    }

    fn store(&self, issuer: &Identity, promise: StoredPromise) -> Result<(), StorageError> {
        insert_stamped(&mut self.buckets(), issuer, promise);
        Ok(())
    }

    fn update(&self, issuer: &Identity, mut promise: StoredPromise) -> Result<(), StorageError> {
        let mut buckets = self.buckets();
        let existing = buckets
            .get_mut(issuer)
            .and_then(|bucket| bucket.get_mut(&promise.sequence_id))
            .ok_or(StorageError::NotFound)?;

        promise.updated_at = Some(SystemTime::now());
        *existing = promise;
        Ok(())
    }

    fn get_promise(&self, issuer: &Identity, sequence_id: u64) -> Result<StoredPromise, StorageError> {
        self.buckets()
            .get(issuer)
            .and_then(|bucket| bucket.get(&sequence_id))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    fn get_last_promise(&self, issuer: &Identity) -> Result<StoredPromise, StorageError> {
        self.buckets()
            .get(issuer)
            .and_then(|bucket| bucket.values().next_back())
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    fn find_promise_for_consumer(
        &self,
        issuer: &Identity,
        consumer: &Identity,
    ) -> Result<StoredPromise, StorageError> {
        let buckets = self.buckets();
        let Some(bucket) = buckets.get(issuer) else {
            return Err(StorageError::NoPromiseForConsumer);
        };

        for promise in bucket.values().rev() {
            if promise.cleared {
                break;
            }
            if &promise.consumer == consumer {
                return Ok(promise.clone());
            }
        }
        Err(StorageError::NoPromiseForConsumer)
    }

    fn get_all_known_issuers(&self) -> Vec<Identity> {
        self.buckets().keys().cloned().collect()
    }

    fn get_all_promises_from_issuer(
        &self,
        issuer: &Identity,
    ) -> Result<Vec<StoredPromise>, StorageError> {
        self.buckets()
            .get(issuer)
            .map(|bucket| bucket.values().cloned().collect())
            .ok_or(StorageError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (Identity, Identity, Identity) {
        (
            Identity::new("0xconsumer"),
            Identity::new("0xreceiver"),
            Identity::new("0xissuer"),
        )
    }

    #[test]
    fn test_sequence_ids() {
        let storage = MemoryPromiseStorage::new();
        let (consumer, receiver, issuer) = ids();

        assert_eq!(storage.get_new_seq_id_for_issuer(&consumer, &receiver, &issuer).unwrap(), 1);
        assert_eq!(storage.get_new_seq_id_for_issuer(&consumer, &receiver, &issuer).unwrap(), 2);

        let last = storage.get_last_promise(&issuer).unwrap();
        assert_eq!(last.sequence_id, 2);
        assert_eq!(last.consumer, consumer);
        assert!(last.added_at.is_some());

        // ids are per issuer
        let other = Identity::new("0xother");
        assert_eq!(storage.get_new_seq_id_for_issuer(&consumer, &receiver, &other).unwrap(), 1);
        assert_eq!(storage.get_all_known_issuers(), vec![issuer, other]);
    }

    #[test]
    fn test_update_requires_existing() {
        let storage = MemoryPromiseStorage::new();
        let (consumer, receiver, issuer) = ids();

        let missing = StoredPromise::new(9, consumer.clone(), receiver.clone());
        assert!(matches!(storage.update(&issuer, missing), Err(StorageError::NotFound)));

        let id = storage.get_new_seq_id_for_issuer(&consumer, &receiver, &issuer).unwrap();
        let mut promise = storage.get_promise(&issuer, id).unwrap();
        promise.unconsumed_amount = 40;
        storage.update(&issuer, promise).unwrap();

        let stored = storage.get_promise(&issuer, id).unwrap();
        assert_eq!(stored.unconsumed_amount, 40);
        assert!(stored.updated_at.is_some());
    }

    #[test]
    fn test_find_promise_for_consumer() {
        let storage = MemoryPromiseStorage::new();
        let (consumer, receiver, issuer) = ids();
        let someone_else = Identity::new("0xsomeone");

        assert!(matches!(
            storage.find_promise_for_consumer(&issuer, &consumer),
            Err(StorageError::NoPromiseForConsumer)
        ));

        storage.get_new_seq_id_for_issuer(&consumer, &receiver, &issuer).unwrap();
        storage.get_new_seq_id_for_issuer(&someone_else, &receiver, &issuer).unwrap();

        // skips other consumers' newer promises
        let found = storage.find_promise_for_consumer(&issuer, &consumer).unwrap();
        assert_eq!(found.sequence_id, 1);
    }

    #[test]
    fn test_find_stops_at_cleared() {
        let storage = MemoryPromiseStorage::new();
        let (consumer, receiver, issuer) = ids();

        storage.get_new_seq_id_for_issuer(&consumer, &receiver, &issuer).unwrap();
        let mut cleared = StoredPromise::new(2, Identity::new("0xsomeone"), receiver);
        cleared.cleared = true;
        storage.store(&issuer, cleared).unwrap();

        assert!(matches!(
            storage.find_promise_for_consumer(&issuer, &consumer),
            Err(StorageError::NoPromiseForConsumer)
        ));
    }

    #[test]
    fn test_all_promises_ascending() {
        let storage = MemoryPromiseStorage::new();
        let (consumer, receiver, issuer) = ids();

        assert!(storage.get_all_promises_from_issuer(&issuer).is_err());
        for _ in 0..3 {
            storage.get_new_seq_id_for_issuer(&consumer, &receiver, &issuer).unwrap();
        }
        let seqs: Vec<_> = storage
            .get_all_promises_from_issuer(&issuer)
            .unwrap()
            .iter()
            .map(|p| p.sequence_id)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_stored_promise_json() {
        let (consumer, receiver, _) = ids();
        let value = serde_json::to_value(StoredPromise::new(1, consumer, receiver)).unwrap();
        assert_eq!(value["sequenceID"], 1);
        assert_eq!(value["unconsumedAmount"], 0);
        assert_eq!(value["consumerID"], "0xconsumer");
    }
}
