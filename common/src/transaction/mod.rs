use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::account::BalanceSnapshot;

mod intent;

pub use intent::*;

/// Life-cycle status of a transaction.
///
/// `Created` is the transient status of an immediate post that has not been
/// applied yet (async dispatch); it becomes `Approved` once the operations
/// land. `Pending` is the open half of a two-phase transaction. `Noted` is
/// an annotation and never affects balances.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Created,
    Pending,
    Approved,
    Canceled,
    Noted,
}

impl TransactionStatus {
    /// Statuses reachable from the current one. Everything not listed here
    /// is a forbidden transition.
    pub fn valid_transitions(self) -> &'static [TransactionStatus] {
        match self {
            TransactionStatus::Created => &[TransactionStatus::Approved],
            TransactionStatus::Pending => {
                &[TransactionStatus::Approved, TransactionStatus::Canceled]
            }
            TransactionStatus::Approved
            | TransactionStatus::Canceled
            | TransactionStatus::Noted => &[],
        }
    }

    pub fn can_transition(self, to: TransactionStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        self.valid_transitions().is_empty()
    }
}

/// Kind of a single balance-affecting entry inside a transaction.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Debit,
    Credit,
    OnHold,
    Release,
}

/// A single entry inside a transaction, carrying the before/after snapshot
/// of the balance it touched.
///
/// Invariant: `balance_before.version + 1 == balance_after.version` for any
/// operation with `balance_affected`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Operation {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub organization_id: Uuid,
    pub ledger_id: Uuid,
    pub balance_id: Uuid,
    pub account_alias: String,
    pub balance_key: String,
    pub asset_code: String,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub amount: Decimal,
    pub balance_before: BalanceSnapshot,
    pub balance_after: BalanceSnapshot,
    /// False when the parent transaction is an annotation (`NOTED`).
    pub balance_affected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// A double-entry monetary transaction and its journal entries.
///
/// A transaction with a non-empty `parent_id` is the revert of its parent;
/// the parent stays `Approved` for auditability.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Transaction {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub ledger_id: Uuid,
    pub asset_code: String,
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub description: String,
    pub source_aliases: Vec<String>,
    pub destination_aliases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub transaction_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// The normalized intent the transaction was created from.
    pub body: SendSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl Transaction {
    pub fn is_revert(&self) -> bool {
        self.parent_id.is_some()
    }

    /// Sum of debit amounts over balance-affecting operations.
    pub fn debit_total(&self) -> Decimal {
        self.operations
            .iter()
            .filter(|op| op.balance_affected && matches!(op.kind, OperationKind::Debit))
            .map(|op| op.amount)
            .sum()
    }

    /// Sum of credit amounts over balance-affecting operations.
    pub fn credit_total(&self) -> Decimal {
        self.operations
            .iter()
            .filter(|op| op.balance_affected && matches!(op.kind, OperationKind::Credit))
            .map(|op| op.amount)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use TransactionStatus::*;

        assert!(Created.can_transition(Approved));
        assert!(Pending.can_transition(Approved));
        assert!(Pending.can_transition(Canceled));

        assert!(!Created.can_transition(Canceled));
        assert!(!Approved.can_transition(Pending));
        assert!(!Approved.can_transition(Canceled));
        assert!(!Canceled.can_transition(Approved));
        assert!(!Noted.can_transition(Approved));
    }

    #[test]
    fn test_terminal_states() {
        use TransactionStatus::*;

        assert!(Approved.is_terminal());
        assert!(Canceled.is_terminal());
        assert!(Noted.is_terminal());
        assert!(!Created.is_terminal());
        assert!(!Pending.is_terminal());
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&TransactionStatus::Pending).unwrap(),
            "\"PENDING\""
        );
        assert_eq!(
            serde_json::to_string(&OperationKind::OnHold).unwrap(),
            "\"ON_HOLD\""
        );
        assert_eq!(TransactionStatus::Approved.to_string(), "APPROVED");
    }
}
