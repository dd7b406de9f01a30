use std::sync::Arc;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::core::cache::{idempotency_cache_key, KeyValueStore};
use crate::core::error::LedgerError;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum RecordState {
    InFlight,
    Completed,
}

/// What the keeper remembers about a key: the request digest, and once the
/// request succeeded, the exact response bytes to replay.
#[derive(Serialize, Deserialize, Clone, Debug)]
struct IdempotencyRecord {
    state: RecordState,
    request_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<Vec<u8>>,
}

/// Outcome of reserving an idempotency key.
pub enum Reservation {
    /// The key is fresh; the guard must be completed (or dropped to
    /// release) by the caller.
    New(IdempotencyGuard),
    /// A successful response is already stored; replay it verbatim.
    Existing(Vec<u8>),
    /// Another request holds the key and has not finished.
    InFlight,
}

/// At-most-once replay of successful responses, keyed by a client-supplied
/// token scoped to `(organization, ledger)`.
pub struct IdempotencyKeeper {
    store: Arc<dyn KeyValueStore>,
}

impl IdempotencyKeeper {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Content-addressed digest of the normalized request body.
    pub fn request_hash(body: &[u8]) -> String {
        hex::encode(Sha256::digest(body))
    }

    pub async fn reserve(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        key: &str,
        request_hash: &str,
        ttl: Duration,
    ) -> Result<Reservation, LedgerError> {
        let cache_key = idempotency_cache_key(organization_id, ledger_id, key);
        let sentinel = serde_json::to_vec(&IdempotencyRecord {
            state: RecordState::InFlight,
            request_hash: request_hash.to_string(),
            response: None,
        })?;

        // two rounds: the entry may expire between the failed insert and
        // the read
        for _ in 0..2 {
            if self
                .store
                .set_if_absent(&cache_key, sentinel.clone(), ttl)
                .await?
            {
                return Ok(Reservation::New(IdempotencyGuard {
                    store: self.store.clone(),
                    key: Some(cache_key),
                    request_hash: request_hash.to_string(),
                    ttl,
                }));
            }

            let Some(bytes) = self.store.get(&cache_key).await? else {
                continue;
            };
            let record: IdempotencyRecord = serde_json::from_slice(&bytes)?;
            if record.request_hash != request_hash {
                return Err(LedgerError::IdempotencyKeyConflict);
            }
            return match record {
                IdempotencyRecord {
                    state: RecordState::Completed,
                    response: Some(response),
                    ..
                } => Ok(Reservation::Existing(response)),
                _ => Ok(Reservation::InFlight),
            };
        }
        Ok(Reservation::InFlight)
    }
}

/// Reservation of a fresh key. `complete` must be called with the exact
/// bytes that will be sent to the client, before the client sees them;
/// dropping the guard releases the key so a retry may proceed.
pub struct IdempotencyGuard {
    store: Arc<dyn KeyValueStore>,
    key: Option<String>,
    request_hash: String,
    ttl: Duration,
}

impl IdempotencyGuard {
    pub async fn complete(mut self, response: &[u8]) -> Result<(), LedgerError> {
        let Some(key) = self.key.take() else {
            return Ok(());
        };
        let record = serde_json::to_vec(&IdempotencyRecord {
            state: RecordState::Completed,
            request_hash: self.request_hash.clone(),
            response: Some(response.to_vec()),
        })?;
        self.store.put(&key, record, self.ttl).await
    }
}

impl Drop for IdempotencyGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(e) = store.remove(&key).await {
                    warn!("failed to release idempotency reservation {}: {}", key, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::MemoryCache;

    const TTL: Duration = Duration::from_secs(60);

    fn keeper() -> IdempotencyKeeper {
        IdempotencyKeeper::new(Arc::new(MemoryCache::new()))
    }

    #[tokio::test]
    async fn test_replay_returns_stored_bytes() {
        let keeper = keeper();
        let org = Uuid::now_v7();
        let ledger = Uuid::now_v7();
        let hash = IdempotencyKeeper::request_hash(b"body");

        let Reservation::New(guard) = keeper
            .reserve(&org, &ledger, "k1", &hash, TTL)
            .await
            .unwrap()
        else {
            panic!("expected a fresh reservation");
        };
        guard.complete(b"response-bytes").await.unwrap();

        match keeper.reserve(&org, &ledger, "k1", &hash, TTL).await.unwrap() {
            Reservation::Existing(bytes) => assert_eq!(bytes, b"response-bytes"),
            _ => panic!("expected a replay"),
        }
    }

    #[tokio::test]
    async fn test_in_flight_key_blocks_second_request() {
        let keeper = keeper();
        let org = Uuid::now_v7();
        let ledger = Uuid::now_v7();
        let hash = IdempotencyKeeper::request_hash(b"body");

        let Reservation::New(_guard) = keeper
            .reserve(&org, &ledger, "k1", &hash, TTL)
            .await
            .unwrap()
        else {
            panic!("expected a fresh reservation");
        };

        assert!(matches!(
            keeper.reserve(&org, &ledger, "k1", &hash, TTL).await.unwrap(),
            Reservation::InFlight
        ));
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_key() {
        let keeper = keeper();
        let org = Uuid::now_v7();
        let ledger = Uuid::now_v7();
        let hash = IdempotencyKeeper::request_hash(b"body");

        let reservation = keeper.reserve(&org, &ledger, "k1", &hash, TTL).await.unwrap();
        drop(reservation);
        tokio::task::yield_now().await;

        assert!(matches!(
            keeper.reserve(&org, &ledger, "k1", &hash, TTL).await.unwrap(),
            Reservation::New(_)
        ));
    }

    #[tokio::test]
    async fn test_body_mismatch_is_a_conflict() {
        let keeper = keeper();
        let org = Uuid::now_v7();
        let ledger = Uuid::now_v7();
        let hash = IdempotencyKeeper::request_hash(b"body");

        let Reservation::New(guard) = keeper
            .reserve(&org, &ledger, "k1", &hash, TTL)
            .await
            .unwrap()
        else {
            panic!("expected a fresh reservation");
        };
        guard.complete(b"response").await.unwrap();

        let other_hash = IdempotencyKeeper::request_hash(b"different body");
        assert!(matches!(
            keeper
                .reserve(&org, &ledger, "k1", &other_hash, TTL)
                .await
                .unwrap_err(),
            LedgerError::IdempotencyKeyConflict
        ));
    }

    #[tokio::test]
    async fn test_keys_are_scoped_by_ledger() {
        let keeper = keeper();
        let org = Uuid::now_v7();
        let hash = IdempotencyKeeper::request_hash(b"body");

        let Reservation::New(_guard) = keeper
            .reserve(&org, &Uuid::now_v7(), "k1", &hash, TTL)
            .await
            .unwrap()
        else {
            panic!("expected a fresh reservation");
        };
        // same key under a different ledger is independent
        assert!(matches!(
            keeper
                .reserve(&org, &Uuid::now_v7(), "k1", &hash, TTL)
                .await
                .unwrap(),
            Reservation::New(_)
        ));
    }
}
