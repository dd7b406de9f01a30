use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Every failure the engine can surface. Variants are tagged so the RPC
/// layer can derive a stable short code and an HTTP status without string
/// matching.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Transaction amount must be strictly positive, got {0}")]
    NonPositiveAmount(Decimal),

    #[error("Source total {source} does not match destination total {destination}")]
    AmbiguousAmounts { source: Decimal, destination: Decimal },

    #[error("Aggregated {side} amount {aggregated} does not match declared value {declared}")]
    ValueMismatch {
        side: &'static str,
        declared: Decimal,
        aggregated: Decimal,
    },

    #[error("Account rule requires both a type and a value")]
    IncompleteAccountRule,

    #[error("Unknown account rule type '{0}'")]
    UnknownRuleType(String),

    #[error("Account rule value has the wrong shape for type '{0}'")]
    MalformedRuleValue(String),

    #[error("Invalid account alias '{0}'")]
    InvalidAlias(String),

    #[error("Transaction date {0} is in the future")]
    TransactionDateInFuture(chrono::DateTime<chrono::Utc>),

    #[error("A pending transaction cannot carry a future transaction date")]
    PendingWithFutureDate,

    #[error("Source fragments are required")]
    EmptySource,

    #[error("Destination fragments are required")]
    EmptyDistribute,

    #[error("No balance found for alias '{alias}'")]
    BalanceNotFound { alias: String },

    #[error("Transaction {0} not found")]
    TransactionNotFound(Uuid),

    #[error("Insufficient funds on '{alias}'")]
    InsufficientFunds { alias: String },

    #[error("Balance '{alias}' version conflict after {attempts} attempts")]
    VersionConflict { alias: String, attempts: u32 },

    #[error("Transaction {0} is not pending")]
    TransactionNotPending(Uuid),

    #[error("Transaction {0} is not approved")]
    TransactionNotApproved(Uuid),

    #[error("Transaction {0} has already been reverted")]
    AlreadyReverted(Uuid),

    #[error("Transaction {0} is itself a revert and cannot be reverted")]
    RevertOfRevert(Uuid),

    #[error("Another request is in flight for this idempotency key")]
    IdempotencyInFlight,

    #[error("Idempotency key was already used with a different request body")]
    IdempotencyKeyConflict,

    #[error("Double-entry closure violated: debits {debits}, credits {credits}, amount {amount}")]
    DoubleEntryViolation {
        debits: Decimal,
        credits: Decimal,
        amount: Decimal,
    },

    #[error("Message broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Balance store write failed after cache update: {0}")]
    StoreWriteFailed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Storage transaction error: {0}")]
    StorageTransaction(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Stable short code carried in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::NonPositiveAmount(_) => "non_positive_amount",
            LedgerError::AmbiguousAmounts { .. } => "ambiguous_amounts",
            LedgerError::ValueMismatch { .. } => "value_mismatch",
            LedgerError::IncompleteAccountRule => "incomplete_account_rule",
            LedgerError::UnknownRuleType(_) => "unknown_rule_type",
            LedgerError::MalformedRuleValue(_) => "malformed_rule_value",
            LedgerError::InvalidAlias(_) => "invalid_alias",
            LedgerError::TransactionDateInFuture(_) => "transaction_date_in_future",
            LedgerError::PendingWithFutureDate => "pending_with_future_date",
            LedgerError::EmptySource => "empty_source",
            LedgerError::EmptyDistribute => "empty_distribute",
            LedgerError::BalanceNotFound { .. } => "balance_not_found",
            LedgerError::TransactionNotFound(_) => "transaction_not_found",
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::VersionConflict { .. } => "version_conflict",
            LedgerError::TransactionNotPending(_) => "transaction_not_pending",
            LedgerError::TransactionNotApproved(_) => "transaction_not_approved",
            LedgerError::AlreadyReverted(_) => "transaction_already_reverted",
            LedgerError::RevertOfRevert(_) => "revert_of_revert",
            LedgerError::IdempotencyInFlight => "idempotency_in_flight",
            LedgerError::IdempotencyKeyConflict => "idempotency_key_conflict",
            LedgerError::DoubleEntryViolation { .. } => "double_entry_violation",
            LedgerError::BrokerUnavailable(_) => "broker_unavailable",
            LedgerError::StoreWriteFailed(_) => "store_write_failed",
            LedgerError::Storage(_)
            | LedgerError::StorageTransaction(_)
            | LedgerError::Serialization(_) => "internal_error",
        }
    }

    /// Semantic HTTP status for the RPC layer.
    pub fn http_status(&self) -> u16 {
        match self {
            LedgerError::NonPositiveAmount(_)
            | LedgerError::AmbiguousAmounts { .. }
            | LedgerError::ValueMismatch { .. }
            | LedgerError::IncompleteAccountRule
            | LedgerError::UnknownRuleType(_)
            | LedgerError::MalformedRuleValue(_)
            | LedgerError::InvalidAlias(_)
            | LedgerError::TransactionDateInFuture(_)
            | LedgerError::PendingWithFutureDate
            | LedgerError::EmptySource
            | LedgerError::EmptyDistribute => 400,

            LedgerError::BalanceNotFound { .. } | LedgerError::TransactionNotFound(_) => 404,

            LedgerError::IdempotencyInFlight | LedgerError::IdempotencyKeyConflict => 409,

            LedgerError::InsufficientFunds { .. }
            | LedgerError::VersionConflict { .. }
            | LedgerError::TransactionNotPending(_)
            | LedgerError::TransactionNotApproved(_)
            | LedgerError::AlreadyReverted(_)
            | LedgerError::RevertOfRevert(_)
            | LedgerError::BrokerUnavailable(_) => 422,

            LedgerError::DoubleEntryViolation { .. }
            | LedgerError::StoreWriteFailed(_)
            | LedgerError::Storage(_)
            | LedgerError::StorageTransaction(_)
            | LedgerError::Serialization(_) => 500,
        }
    }

    /// Field path the error refers to, when it is about a specific input.
    pub fn field(&self) -> Option<(&'static str, String)> {
        match self {
            LedgerError::NonPositiveAmount(value) => Some(("send.value", value.to_string())),
            LedgerError::InsufficientFunds { alias }
            | LedgerError::BalanceNotFound { alias }
            | LedgerError::VersionConflict { alias, .. } => Some(("account", alias.clone())),
            LedgerError::InvalidAlias(alias) => Some(("account", alias.clone())),
            _ => None,
        }
    }

    /// Retrying the same request cannot succeed for these; the RPC layer
    /// uses this to hint clients via the envelope title.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LedgerError::DoubleEntryViolation { .. } | LedgerError::StoreWriteFailed(_)
        )
    }
}
