use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, info, trace, warn};
use lru::LruCache;
use metrics::counter;
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use uuid::Uuid;

use tally_common::account::{
    composite_alias, is_valid_alias, split_composite_alias, Balance, BalanceSnapshot,
    DEFAULT_BALANCE_KEY,
};
use tally_common::api::CreateBalanceRequest;
use tally_common::transaction::{
    Operation, SendSpec, Transaction, TransactionStatus,
};

use crate::config::{CAS_BACKOFF_BASE, CAS_BACKOFF_CAP, CAS_MAX_ATTEMPTS};
use crate::core::cache::{balance_cache_key, BalanceCache, CachedBalance, ReserveOutcome};
use crate::core::error::LedgerError;
use crate::core::idempotency::{IdempotencyKeeper, Reservation};
use crate::core::lock::PendingLocks;
use crate::core::operations::{operation_deltas, synthesize, SynthesisContext};
use crate::core::queue::{Broker, DispatchEnvelope};
use crate::core::storage::{Storage, StoreCas};
use crate::core::validator;

/// Normalized input of the create path, shared by the JSON, inflow,
/// outflow, annotation and revert surfaces. Serializable so the RPC layer
/// can digest the normalized form for idempotency.
#[derive(Clone, Debug, serde::Serialize)]
pub struct CreateArgs {
    pub description: String,
    pub pending: bool,
    pub noted: bool,
    pub metadata: Option<serde_json::Value>,
    pub transaction_date: Option<DateTime<Utc>>,
    pub send: SendSpec,
    pub parent_id: Option<Uuid>,
}

/// Client-supplied idempotency token with its digest and TTL.
#[derive(Clone, Debug)]
pub struct IdempotencyOptions {
    pub key: String,
    pub request_hash: String,
    pub ttl: Duration,
}

/// Result of a create: the response body to send, and whether it was
/// replayed from the idempotency keeper. `body` is authoritative — on a
/// replay it is the original response byte-for-byte.
pub struct CreateResult {
    pub transaction: Option<Transaction>,
    pub body: Vec<u8>,
    pub replayed: bool,
}

/// The transaction engine. Coordinates the validator, the synthesizer,
/// the balance cache and store, the journal, the idempotency keeper, the
/// pending lock and the dispatch queue.
pub struct Ledger<S: Storage> {
    storage: RwLock<S>,
    balances: Arc<dyn BalanceCache>,
    idempotency: IdempotencyKeeper,
    pending_locks: PendingLocks,
    broker: Option<Arc<dyn Broker>>,
    journal_cache: Mutex<LruCache<Uuid, Arc<Transaction>>>,
}

impl<S: Storage> Ledger<S> {
    pub fn new(
        storage: S,
        balances: Arc<dyn BalanceCache>,
        idempotency: IdempotencyKeeper,
        pending_locks: PendingLocks,
        broker: Option<Arc<dyn Broker>>,
        cache_size: usize,
    ) -> Self {
        Self {
            storage: RwLock::new(storage),
            balances,
            idempotency,
            pending_locks,
            broker,
            journal_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(cache_size).expect("Non zero value for cache"),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    pub async fn create_transaction(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        args: CreateArgs,
        idempotency: Option<IdempotencyOptions>,
    ) -> Result<CreateResult, LedgerError> {
        let target = if args.noted {
            TransactionStatus::Noted
        } else if args.pending {
            TransactionStatus::Pending
        } else {
            TransactionStatus::Created
        };

        validator::validate_shape(&args.send)?;
        validator::validate_positivity(&args.send)?;
        validator::validate_temporal(args.transaction_date, args.pending)?;

        // reserve the key before any persistent effect; the guard releases
        // it on every failure path so a legitimate retry may proceed
        let guard = match &idempotency {
            Some(options) => {
                match self
                    .idempotency
                    .reserve(
                        organization_id,
                        ledger_id,
                        &options.key,
                        &options.request_hash,
                        options.ttl,
                    )
                    .await?
                {
                    Reservation::New(guard) => Some(guard),
                    Reservation::Existing(body) => {
                        counter!("tally_idempotency_replays_total").increment(1);
                        return Ok(CreateResult {
                            transaction: None,
                            body,
                            replayed: true,
                        });
                    }
                    Reservation::InFlight => return Err(LedgerError::IdempotencyInFlight),
                }
            }
            None => None,
        };

        let resolved = if target == TransactionStatus::Noted {
            IndexMap::new()
        } else {
            self.resolve_balances(organization_id, ledger_id, &args.send)
                .await?
        };

        validator::validate_aggregates(&args.send)?;
        validator::validate_rules(&args.send)?;
        if target != TransactionStatus::Noted {
            let sources = args.send.aggregate_sources();
            validator::validate_coverage(&sources, |composite| {
                resolved
                    .get(composite)
                    .map(|row| (row.available, row.account_type.allows_overdraft()))
            })?;
        }

        let now = Utc::now();
        let transaction_id = Uuid::now_v7();
        let ctx = SynthesisContext {
            transaction_id,
            organization_id: *organization_id,
            ledger_id: *ledger_id,
            asset_code: &args.send.asset,
            description: &args.description,
            timestamp: now,
        };
        let mut operations = synthesize(&ctx, &args.send, target, &resolved)?;
        validator::validate_closure(&operations, args.send.value)?;

        let mut transaction = Transaction {
            id: transaction_id,
            organization_id: *organization_id,
            ledger_id: *ledger_id,
            asset_code: args.send.asset.clone(),
            amount: args.send.value,
            status: target,
            description: args.description.clone(),
            source_aliases: args.send.source_aliases(),
            destination_aliases: args.send.destination_aliases(),
            parent_id: args.parent_id,
            transaction_date: args.transaction_date.unwrap_or(now),
            created_at: now,
            updated_at: now,
            body: args.send.clone(),
            metadata: args.metadata.clone(),
            operations: Vec::new(),
        };

        match (target, &self.broker) {
            (TransactionStatus::Noted, _) => {
                // annotations are journalled and done; balances untouched
                transaction.operations = operations.clone();
                self.storage
                    .write()
                    .await
                    .insert_transaction(&transaction, &operations)
                    .await?;
            }
            (_, Some(broker)) => {
                // async mode: the consumer finalizes; nothing is persisted
                // here, so a broker failure leaves no partial state
                transaction.operations = operations.clone();
                let envelope = DispatchEnvelope {
                    organization_id: *organization_id,
                    ledger_id: *ledger_id,
                    transaction: transaction.clone(),
                    pre_balances: resolved.values().cloned().collect(),
                    validated_amount: args.send.value,
                };
                broker.publish(envelope.encode()?).await?;
                debug!("transaction {} dispatched for finalization", transaction_id);
            }
            (_, None) => {
                self.apply_cache_phase(organization_id, ledger_id, &mut operations, &resolved)
                    .await?;
                if target == TransactionStatus::Created {
                    transaction.status = TransactionStatus::Approved;
                }
                transaction.operations = operations.clone();
                let inserted = self
                    .storage
                    .write()
                    .await
                    .insert_transaction(&transaction, &operations)
                    .await;
                if let Err(e) = inserted {
                    // nothing durable happened yet; take the cache back
                    self.compensate(
                        organization_id,
                        ledger_id,
                        &operations,
                        operations.len(),
                        &resolved,
                    )
                    .await;
                    return Err(e);
                }
                self.write_through_phase(organization_id, ledger_id, &operations, &resolved)
                    .await?;
            }
        }

        counter!("tally_transactions_created_total").increment(1);
        info!(
            "transaction {} created with status {}",
            transaction_id, transaction.status
        );

        let body = serde_json::to_vec(&transaction)?;
        if let Some(guard) = guard {
            // stored before the caller ever sees the response, so a retry
            // arriving right after cannot slip past the keeper
            guard.complete(&body).await?;
        }
        Ok(CreateResult {
            transaction: Some(transaction),
            body,
            replayed: false,
        })
    }

    // ------------------------------------------------------------------
    // Commit / cancel
    // ------------------------------------------------------------------

    pub async fn commit_transaction(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        transaction_id: &Uuid,
    ) -> Result<Transaction, LedgerError> {
        self.settle(organization_id, ledger_id, transaction_id, true)
            .await
    }

    pub async fn cancel_transaction(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        transaction_id: &Uuid,
    ) -> Result<Transaction, LedgerError> {
        self.settle(organization_id, ledger_id, transaction_id, false)
            .await
    }

    async fn settle(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        transaction_id: &Uuid,
        approve: bool,
    ) -> Result<Transaction, LedgerError> {
        let Some(guard) = self
            .pending_locks
            .acquire(organization_id, ledger_id, transaction_id)
            .await?
        else {
            // the holder is finishing the transition; same error as a
            // transaction that already left PENDING
            return Err(LedgerError::TransactionNotPending(*transaction_id));
        };

        // status is re-read under the lock
        let mut transaction = self
            .storage
            .read()
            .await
            .get_transaction_with_operations(organization_id, ledger_id, transaction_id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(*transaction_id))?;
        if transaction.status != TransactionStatus::Pending {
            return Err(LedgerError::TransactionNotPending(*transaction_id));
        }

        let target = if approve {
            TransactionStatus::Approved
        } else {
            TransactionStatus::Canceled
        };
        if !transaction.status.can_transition(target) {
            return Err(LedgerError::TransactionNotPending(*transaction_id));
        }

        let resolved = self
            .resolve_balances(organization_id, ledger_id, &transaction.body)
            .await?;

        // the balances may have moved since the hold was taken, but the
        // held funds belong to this transaction
        for (composite, total) in transaction.body.aggregate_sources() {
            let alias = split_composite_alias(&composite).0.to_string();
            let row = resolved
                .get(&composite)
                .ok_or(LedgerError::BalanceNotFound { alias: alias.clone() })?;
            if row.on_hold < total {
                return Err(LedgerError::InsufficientFunds { alias });
            }
        }

        let ctx = SynthesisContext {
            transaction_id: *transaction_id,
            organization_id: *organization_id,
            ledger_id: *ledger_id,
            asset_code: &transaction.asset_code,
            description: &transaction.description,
            timestamp: Utc::now(),
        };
        let mut operations = synthesize(&ctx, &transaction.body, target, &resolved)?;
        validator::validate_closure(&operations, transaction.amount)?;

        self.apply_cache_phase(organization_id, ledger_id, &mut operations, &resolved)
            .await?;
        let journalled = {
            let mut storage = self.storage.write().await;
            match storage.append_operations(&operations).await {
                Ok(()) => {
                    storage
                        .update_transaction_status(
                            organization_id,
                            ledger_id,
                            transaction_id,
                            target,
                        )
                        .await
                }
                Err(e) => Err(e),
            }
        };
        if let Err(e) = journalled {
            self.compensate(
                organization_id,
                ledger_id,
                &operations,
                operations.len(),
                &resolved,
            )
            .await;
            return Err(e);
        }
        self.write_through_phase(organization_id, ledger_id, &operations, &resolved)
            .await?;

        self.journal_cache.lock().await.pop(transaction_id);
        guard.release().await?;

        counter!("tally_transactions_settled_total", "outcome" => if approve { "approved" } else { "canceled" })
            .increment(1);
        // audit emission is best-effort and never blocks the response
        let audit_id = *transaction_id;
        tokio::spawn(async move {
            debug!(
                "audit: transaction {} settled as {}",
                audit_id,
                if approve { "APPROVED" } else { "CANCELED" }
            );
        });

        transaction.status = target;
        transaction.updated_at = Utc::now();
        transaction.operations.extend(operations);
        Ok(transaction)
    }

    // ------------------------------------------------------------------
    // Revert
    // ------------------------------------------------------------------

    pub async fn revert_transaction(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        transaction_id: &Uuid,
        idempotency: Option<IdempotencyOptions>,
    ) -> Result<CreateResult, LedgerError> {
        let original = {
            let storage = self.storage.read().await;
            if storage
                .get_transaction_by_parent(organization_id, ledger_id, transaction_id)
                .await?
                .is_some()
            {
                return Err(LedgerError::AlreadyReverted(*transaction_id));
            }
            storage
                .get_transaction(organization_id, ledger_id, transaction_id)
                .await?
                .ok_or(LedgerError::TransactionNotFound(*transaction_id))?
        };

        if original.is_revert() {
            return Err(LedgerError::RevertOfRevert(*transaction_id));
        }
        if original.status != TransactionStatus::Approved {
            return Err(LedgerError::TransactionNotApproved(*transaction_id));
        }

        let args = CreateArgs {
            description: original.description.clone(),
            pending: false,
            noted: false,
            metadata: original.metadata.clone(),
            transaction_date: None,
            send: original.body.inverse(),
            parent_id: Some(*transaction_id),
        };
        let result = self
            .create_transaction(organization_id, ledger_id, args, idempotency)
            .await?;
        counter!("tally_transactions_reverted_total").increment(1);
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_transaction(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        transaction_id: &Uuid,
    ) -> Result<Arc<Transaction>, LedgerError> {
        if let Some(cached) = self.journal_cache.lock().await.get(transaction_id) {
            if cached.organization_id == *organization_id && cached.ledger_id == *ledger_id {
                trace!("journal cache hit for {}", transaction_id);
                return Ok(cached.clone());
            }
        }

        let transaction = self
            .storage
            .read()
            .await
            .get_transaction_with_operations(organization_id, ledger_id, transaction_id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(*transaction_id))?;
        let transaction = Arc::new(transaction);
        if transaction.status.is_terminal() {
            self.journal_cache
                .lock()
                .await
                .put(*transaction_id, transaction.clone());
        }
        Ok(transaction)
    }

    // ------------------------------------------------------------------
    // Balance bootstrap surface
    // ------------------------------------------------------------------

    pub async fn create_balance(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        request: CreateBalanceRequest,
    ) -> Result<Balance, LedgerError> {
        if !is_valid_alias(&request.alias) {
            return Err(LedgerError::InvalidAlias(request.alias));
        }
        if request.on_hold < Decimal::ZERO {
            return Err(LedgerError::NonPositiveAmount(request.on_hold));
        }

        let now = Utc::now();
        let balance = Balance {
            id: Uuid::now_v7(),
            organization_id: *organization_id,
            ledger_id: *ledger_id,
            account_id: Uuid::now_v7(),
            alias: request.alias,
            key: request.key.unwrap_or_else(|| DEFAULT_BALANCE_KEY.to_string()),
            asset_code: request.asset_code,
            available: request.available,
            on_hold: request.on_hold,
            version: 0,
            account_type: request.account_type,
            created_at: now,
            updated_at: now,
        };
        self.storage.write().await.create_balance(&balance).await?;

        let cache_key =
            balance_cache_key(organization_id, ledger_id, &balance.alias, &balance.key);
        self.balances
            .warm(
                &cache_key,
                CachedBalance {
                    available: balance.available,
                    on_hold: balance.on_hold,
                    version: balance.version,
                },
            )
            .await?;
        info!("balance {} registered as {}", balance.id, balance.alias);
        Ok(balance)
    }

    pub async fn get_balance(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        alias: &str,
        key: &str,
    ) -> Result<Balance, LedgerError> {
        let mut row = self
            .storage
            .read()
            .await
            .get_balance(organization_id, ledger_id, alias, key)
            .await?
            .ok_or_else(|| LedgerError::BalanceNotFound {
                alias: alias.to_string(),
            })?;
        let cache_key = balance_cache_key(organization_id, ledger_id, alias, key);
        match self.balances.read(&cache_key).await? {
            Some(entry) => {
                row.available = entry.available;
                row.on_hold = entry.on_hold;
                row.version = entry.version;
            }
            None => {
                self.balances
                    .warm(&cache_key, CachedBalance {
                        available: row.available,
                        on_hold: row.on_hold,
                        version: row.version,
                    })
                    .await?;
            }
        }
        Ok(row)
    }

    // ------------------------------------------------------------------
    // Queue finalization
    // ------------------------------------------------------------------

    /// Consumer-side completion of an async create: apply the balance
    /// mutations, journal the transaction, settle the final status. A
    /// duplicate delivery is absorbed by the journal's id uniqueness.
    pub async fn finalize_dispatch(&self, envelope: DispatchEnvelope) -> Result<(), LedgerError> {
        let DispatchEnvelope {
            organization_id,
            ledger_id,
            mut transaction,
            pre_balances,
            validated_amount,
        } = envelope;

        if self
            .storage
            .read()
            .await
            .get_transaction(&organization_id, &ledger_id, &transaction.id)
            .await?
            .is_some()
        {
            debug!("duplicate dispatch of {} absorbed", transaction.id);
            return Ok(());
        }

        // after a restart the cache may be cold; the envelope carries the
        // balances the transaction was validated against
        for row in &pre_balances {
            let cache_key =
                balance_cache_key(&organization_id, &ledger_id, &row.alias, &row.key);
            if self.balances.read(&cache_key).await?.is_none() {
                self.balances
                    .warm(&cache_key, CachedBalance {
                        available: row.available,
                        on_hold: row.on_hold,
                        version: row.version,
                    })
                    .await?;
            }
        }

        let resolved = self
            .resolve_balances(&organization_id, &ledger_id, &transaction.body)
            .await?;
        let sources = transaction.body.aggregate_sources();
        validator::validate_coverage(&sources, |composite| {
            resolved
                .get(composite)
                .map(|row| (row.available, row.account_type.allows_overdraft()))
        })?;

        let shape = if transaction.status == TransactionStatus::Pending {
            TransactionStatus::Pending
        } else {
            TransactionStatus::Created
        };
        let ctx = SynthesisContext {
            transaction_id: transaction.id,
            organization_id,
            ledger_id,
            asset_code: &transaction.asset_code,
            description: &transaction.description,
            timestamp: Utc::now(),
        };
        let mut operations = synthesize(&ctx, &transaction.body, shape, &resolved)?;
        validator::validate_closure(&operations, validated_amount)?;

        self.apply_cache_phase(&organization_id, &ledger_id, &mut operations, &resolved)
            .await?;
        if transaction.status == TransactionStatus::Created {
            transaction.status = TransactionStatus::Approved;
        }
        transaction.operations = operations.clone();
        let inserted = self
            .storage
            .write()
            .await
            .insert_transaction(&transaction, &operations)
            .await?;
        if !inserted {
            warn!(
                "transaction {} journalled concurrently; compensating duplicate application",
                transaction.id
            );
            self.compensate(&organization_id, &ledger_id, &operations, operations.len(), &resolved)
                .await;
            return Ok(());
        }
        self.write_through_phase(&organization_id, &ledger_id, &operations, &resolved)
            .await?;

        info!(
            "transaction {} finalized with status {}",
            transaction.id, transaction.status
        );
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), LedgerError> {
        self.storage.write().await.stop().await
    }

    // ------------------------------------------------------------------
    // Balance resolution and mutation
    // ------------------------------------------------------------------

    /// Resolve every balance the intent touches: rows come from the store,
    /// funds from the cache. A cache miss warms the entry from the store;
    /// a hit overrides the row's funds, since the cache is the arbiter
    /// under contention.
    async fn resolve_balances(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        spec: &SendSpec,
    ) -> Result<IndexMap<String, Balance>, LedgerError> {
        let mut composites: Vec<String> = spec.aggregate_sources().into_keys().collect();
        for composite in spec.aggregate_destinations().into_keys() {
            if !composites.contains(&composite) {
                composites.push(composite);
            }
        }

        let rows = self
            .storage
            .read()
            .await
            .get_balances(organization_id, ledger_id, &composites)
            .await?;
        let mut resolved: IndexMap<String, Balance> = rows
            .into_iter()
            .map(|row| (row.composite_alias(), row))
            .collect();

        for composite in &composites {
            let Some(row) = resolved.get_mut(composite) else {
                return Err(LedgerError::BalanceNotFound {
                    alias: split_composite_alias(composite).0.to_string(),
                });
            };
            let cache_key = balance_cache_key(organization_id, ledger_id, &row.alias, &row.key);
            match self.balances.read(&cache_key).await? {
                Some(entry) => {
                    row.available = entry.available;
                    row.on_hold = entry.on_hold;
                    row.version = entry.version;
                }
                None => {
                    self.balances
                        .warm(&cache_key, CachedBalance {
                            available: row.available,
                            on_hold: row.on_hold,
                            version: row.version,
                        })
                        .await?;
                }
            }
        }
        Ok(resolved)
    }

    /// Apply every operation's deltas to the cache under the versioned
    /// CAS, fixing up the snapshots to what was actually applied. On a
    /// conflict the entry is re-read and retried with jittered backoff; on
    /// failure the already-applied deltas are compensated so no partial
    /// state survives.
    async fn apply_cache_phase(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        operations: &mut [Operation],
        resolved: &IndexMap<String, Balance>,
    ) -> Result<(), LedgerError> {
        for index in 0..operations.len() {
            if !operations[index].balance_affected {
                continue;
            }
            let (delta_available, delta_on_hold) = operation_deltas(&operations[index]);
            let composite = composite_alias(
                &operations[index].account_alias,
                &operations[index].balance_key,
            );
            let row = resolved
                .get(&composite)
                .ok_or_else(|| LedgerError::BalanceNotFound {
                    alias: operations[index].account_alias.clone(),
                })?;
            let cache_key = balance_cache_key(organization_id, ledger_id, &row.alias, &row.key);
            let allow_overdraft = row.account_type.allows_overdraft();

            let mut attempt = 0u32;
            let applied = loop {
                attempt += 1;
                let entry = match self.balances.read(&cache_key).await? {
                    Some(entry) => entry,
                    None => {
                        // evicted mid-flight: re-hydrate from the store
                        let fresh = self
                            .storage
                            .read()
                            .await
                            .get_balance_by_id(&row.id)
                            .await?
                            .ok_or_else(|| LedgerError::BalanceNotFound {
                                alias: row.alias.clone(),
                            })?;
                        let entry = CachedBalance {
                            available: fresh.available,
                            on_hold: fresh.on_hold,
                            version: fresh.version,
                        };
                        self.balances.warm(&cache_key, entry).await?;
                        entry
                    }
                };

                match self
                    .balances
                    .reserve(
                        &cache_key,
                        delta_available,
                        delta_on_hold,
                        entry.version,
                        allow_overdraft,
                    )
                    .await?
                {
                    ReserveOutcome::Applied(version) => break Ok((entry, version)),
                    ReserveOutcome::Conflict if attempt < CAS_MAX_ATTEMPTS => {
                        counter!("tally_cas_conflicts_total").increment(1);
                        sleep(backoff_delay(attempt)).await;
                    }
                    ReserveOutcome::Conflict => {
                        break Err(LedgerError::VersionConflict {
                            alias: row.alias.clone(),
                            attempts: attempt,
                        })
                    }
                    ReserveOutcome::Insufficient => {
                        break Err(LedgerError::InsufficientFunds {
                            alias: row.alias.clone(),
                        })
                    }
                }
            };

            match applied {
                Ok((before, version)) => {
                    operations[index].balance_before = BalanceSnapshot {
                        available: before.available,
                        on_hold: before.on_hold,
                        version: before.version,
                    };
                    operations[index].balance_after = BalanceSnapshot {
                        available: before.available + delta_available,
                        on_hold: before.on_hold + delta_on_hold,
                        version,
                    };
                }
                Err(e) => {
                    self.compensate(organization_id, ledger_id, operations, index, resolved)
                        .await;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Reverse the cache deltas of `operations[..until]` after a
    /// mid-flight failure. Overdraft is always allowed on the way back so
    /// the unwind cannot itself be rejected. Both the applied and the
    /// compensating state are carried through to the store so its version
    /// sequence stays gapless; anything unrecoverable marks the entry
    /// stale for re-hydration.
    async fn compensate(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        operations: &[Operation],
        until: usize,
        resolved: &IndexMap<String, Balance>,
    ) {
        // first catch the store up through every version the cache already
        // applied, in order, so the compensating writes have no gaps to
        // wait on
        for operation in operations[..until].iter() {
            if !operation.balance_affected {
                continue;
            }
            let composite = composite_alias(&operation.account_alias, &operation.balance_key);
            let Some(row) = resolved.get(&composite) else {
                continue;
            };
            let cache_key = balance_cache_key(organization_id, ledger_id, &row.alias, &row.key);
            if let Err(e) = self
                .write_through_one(&row.id, &cache_key, operation.balance_after)
                .await
            {
                warn!(
                    "compensation could not land {} on the store: {}",
                    operation.id, e
                );
                let _ = self.balances.mark_stale(&cache_key).await;
            }
        }

        for operation in operations[..until].iter().rev() {
            if !operation.balance_affected {
                continue;
            }
            let (delta_available, delta_on_hold) = operation_deltas(operation);
            let composite = composite_alias(&operation.account_alias, &operation.balance_key);
            let Some(row) = resolved.get(&composite) else {
                continue;
            };
            let cache_key = balance_cache_key(organization_id, ledger_id, &row.alias, &row.key);

            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let entry = match self.balances.read(&cache_key).await {
                    Ok(Some(entry)) => entry,
                    _ => {
                        warn!("compensation lost cache entry {}, marking stale", cache_key);
                        let _ = self.balances.mark_stale(&cache_key).await;
                        break;
                    }
                };
                match self
                    .balances
                    .reserve(
                        &cache_key,
                        -delta_available,
                        -delta_on_hold,
                        entry.version,
                        true,
                    )
                    .await
                {
                    Ok(ReserveOutcome::Applied(version)) => {
                        let compensated = BalanceSnapshot {
                            available: entry.available - delta_available,
                            on_hold: entry.on_hold - delta_on_hold,
                            version,
                        };
                        if let Err(e) = self
                            .write_through_one(&row.id, &cache_key, compensated)
                            .await
                        {
                            warn!(
                                "compensating state of {} did not reach the store: {}",
                                operation.id, e
                            );
                            let _ = self.balances.mark_stale(&cache_key).await;
                        }
                        break;
                    }
                    Ok(ReserveOutcome::Conflict) if attempt < CAS_MAX_ATTEMPTS * 4 => {
                        sleep(backoff_delay(attempt.min(CAS_MAX_ATTEMPTS))).await;
                    }
                    _ => {
                        warn!(
                            "failed to compensate {} on {}, marking stale",
                            operation.id, cache_key
                        );
                        let _ = self.balances.mark_stale(&cache_key).await;
                        break;
                    }
                }
            }
        }
    }

    /// Propagate applied cache states to the balance store. A conflict can
    /// mean the store is still behind a predecessor's write; those are
    /// waited out. A store already at or past the target version means the
    /// state was subsumed by a later writer. Anything else marks the cache
    /// entry stale and surfaces a fault for the operator to reconcile.
    async fn write_through_phase(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        operations: &[Operation],
        resolved: &IndexMap<String, Balance>,
    ) -> Result<(), LedgerError> {
        for operation in operations {
            if !operation.balance_affected {
                continue;
            }
            let composite = composite_alias(&operation.account_alias, &operation.balance_key);
            let Some(row) = resolved.get(&composite) else {
                continue;
            };
            let cache_key = balance_cache_key(organization_id, ledger_id, &row.alias, &row.key);
            self.write_through_one(&row.id, &cache_key, operation.balance_after)
                .await?;
        }

        Ok(())
    }

    async fn write_through_one(
        &self,
        balance_id: &Uuid,
        cache_key: &str,
        after: BalanceSnapshot,
    ) -> Result<(), LedgerError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = self
                .storage
                .write()
                .await
                .compare_and_set_balance(
                    balance_id,
                    after.version - 1,
                    after.available,
                    after.on_hold,
                )
                .await;
            match outcome {
                Ok(StoreCas::Applied(_)) => return Ok(()),
                Ok(StoreCas::Conflict) => {
                    let store_version = self
                        .storage
                        .read()
                        .await
                        .get_balance_by_id(balance_id)
                        .await?
                        .map(|b| b.version)
                        .unwrap_or(0);
                    if store_version >= after.version {
                        // a later writer already carried this state through
                        return Ok(());
                    }
                    if attempt >= CAS_MAX_ATTEMPTS {
                        self.balances.mark_stale(cache_key).await?;
                        return Err(LedgerError::StoreWriteFailed(format!(
                            "store stuck at version {} waiting for {}",
                            store_version,
                            after.version - 1
                        )));
                    }
                    sleep(backoff_delay(attempt)).await;
                }
                Err(e) => {
                    self.balances.mark_stale(cache_key).await?;
                    return Err(LedgerError::StoreWriteFailed(e.to_string()));
                }
            }
        }
    }
}

/// Jittered exponential backoff, capped.
fn backoff_delay(attempt: u32) -> Duration {
    let base = CAS_BACKOFF_BASE.as_millis() as u64;
    let cap = CAS_BACKOFF_CAP.as_millis() as u64;
    let exp = base.saturating_mul(1u64 << attempt.min(16)).min(cap);
    let jitter = rand::thread_rng().gen_range(0..=exp / 2);
    Duration::from_millis(exp / 2 + jitter)
}
