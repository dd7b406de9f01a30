use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use log::trace;
use rust_decimal::Decimal;

use crate::core::cache::{BalanceCache, CachedBalance, KeyValueStore, ReserveOutcome};
use crate::core::error::LedgerError;

struct Entry {
    payload: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        match self.expires_at {
            Some(deadline) => Instant::now() < deadline,
            None => true,
        }
    }
}

/// In-process cache backend. Balance entries are stored as the JSON record
/// `{available, on_hold, version}`; mutation happens under the map's
/// per-entry lock, which is what makes the reserve CAS atomic.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode(payload: &[u8]) -> Result<CachedBalance, LedgerError> {
        Ok(serde_json::from_slice(payload)?)
    }

    fn encode(entry: &CachedBalance) -> Result<Vec<u8>, LedgerError> {
        Ok(serde_json::to_vec(entry)?)
    }
}

#[async_trait]
impl BalanceCache for MemoryCache {
    async fn read(&self, key: &str) -> Result<Option<CachedBalance>, LedgerError> {
        // decode outside the guard so the expired-entry removal below does
        // not re-enter the shard lock
        let (decoded, expired) = match self.entries.get(key) {
            Some(entry) if entry.live() => (Some(Self::decode(&entry.payload)?), false),
            Some(_) => (None, true),
            None => (None, false),
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(decoded)
    }

    async fn warm(&self, key: &str, entry: CachedBalance) -> Result<(), LedgerError> {
        let payload = Self::encode(&entry)?;
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let newer = !current.live()
                    || Self::decode(&current.payload)?.version < entry.version;
                if newer {
                    occupied.insert(Entry {
                        payload,
                        expires_at: None,
                    });
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Entry {
                    payload,
                    expires_at: None,
                });
            }
        }
        Ok(())
    }

    async fn reserve(
        &self,
        key: &str,
        delta_available: Decimal,
        delta_on_hold: Decimal,
        expected_version: u64,
        allow_overdraft: bool,
    ) -> Result<ReserveOutcome, LedgerError> {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(ReserveOutcome::Conflict);
        };
        if !entry.live() {
            drop(entry);
            drop(self.entries.remove(key));
            return Ok(ReserveOutcome::Conflict);
        }

        let mut balance = Self::decode(&entry.payload)?;
        if balance.version != expected_version {
            if log::log_enabled!(log::Level::Trace) {
                trace!(
                    "reserve conflict on {}: expected v{}, found v{}",
                    key,
                    expected_version,
                    balance.version
                );
            }
            return Ok(ReserveOutcome::Conflict);
        }

        let available = balance.available + delta_available;
        let on_hold = balance.on_hold + delta_on_hold;
        if (!allow_overdraft && available < Decimal::ZERO) || on_hold < Decimal::ZERO {
            return Ok(ReserveOutcome::Insufficient);
        }

        balance.available = available;
        balance.on_hold = on_hold;
        balance.version += 1;
        entry.payload = Self::encode(&balance)?;
        Ok(ReserveOutcome::Applied(balance.version))
    }

    async fn set(
        &self,
        key: &str,
        available: Decimal,
        on_hold: Decimal,
    ) -> Result<u64, LedgerError> {
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let version = if occupied.get().live() {
                    Self::decode(&occupied.get().payload)?.version + 1
                } else {
                    1
                };
                occupied.insert(Entry {
                    payload: Self::encode(&CachedBalance {
                        available,
                        on_hold,
                        version,
                    })?,
                    expires_at: None,
                });
                Ok(version)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Entry {
                    payload: Self::encode(&CachedBalance {
                        available,
                        on_hold,
                        version: 1,
                    })?,
                    expires_at: None,
                });
                Ok(1)
            }
        }
    }

    async fn mark_stale(&self, key: &str) -> Result<(), LedgerError> {
        drop(self.entries.remove(key));
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryCache {
    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, LedgerError> {
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().live() {
                    Ok(false)
                } else {
                    occupied.insert(Entry {
                        payload: value,
                        expires_at: Some(Instant::now() + ttl),
                    });
                    Ok(true)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Entry {
                    payload: value,
                    expires_at: Some(Instant::now() + ttl),
                });
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        let (payload, expired) = match self.entries.get(key) {
            Some(entry) if entry.live() => (Some(entry.payload.clone()), false),
            Some(_) => (None, true),
            None => (None, false),
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(payload)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), LedgerError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                payload: value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), LedgerError> {
        drop(self.entries.remove(key));
        Ok(())
    }
}
