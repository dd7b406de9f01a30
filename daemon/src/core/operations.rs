use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use uuid::Uuid;

use tally_common::account::{Balance, BalanceSnapshot};
use tally_common::transaction::{
    Fragment, Operation, OperationKind, SendSpec, TransactionStatus,
};

use crate::core::error::LedgerError;

/// Identity of the transaction the operations are being built for.
pub struct SynthesisContext<'a> {
    pub transaction_id: Uuid,
    pub organization_id: Uuid,
    pub ledger_id: Uuid,
    pub asset_code: &'a str,
    pub description: &'a str,
    pub timestamp: DateTime<Utc>,
}

/// Expand an intent and a set of resolved balances into concrete journal
/// entries with before/after snapshots, for the given target status:
///
/// - `Created`: a `DEBIT` per source fragment, a `CREDIT` per destination.
/// - `Pending`: an `ON_HOLD` per source fragment; no destination entries.
/// - `Approved`: a `RELEASE` per source (the held funds leave for good)
///   paired with a `CREDIT` per destination.
/// - `Canceled`: a `RELEASE` per source returning the hold to available.
/// - `Noted`: the `Created` shape with zeroed snapshots and
///   `balance_affected = false`.
///
/// `balances` is keyed by the internal `alias#key` composite and carries
/// the funds the snapshots are computed from; one balance appearing in
/// several fragments threads its snapshot through each of them.
pub fn synthesize(
    ctx: &SynthesisContext<'_>,
    spec: &SendSpec,
    target: TransactionStatus,
    balances: &IndexMap<String, Balance>,
) -> Result<Vec<Operation>, LedgerError> {
    let mut working: IndexMap<String, BalanceSnapshot> = balances
        .iter()
        .map(|(composite, balance)| (composite.clone(), balance.snapshot()))
        .collect();
    let mut operations = Vec::new();

    let mut emit = |fragment: &Fragment,
                    kind: OperationKind,
                    delta_available: Decimal,
                    delta_on_hold: Decimal|
     -> Result<(), LedgerError> {
        let composite = fragment.composite_alias();
        let (balance_id, before, after) = if target == TransactionStatus::Noted {
            // annotations carry zeroed placeholders and touch nothing
            (Uuid::nil(), BalanceSnapshot::default(), BalanceSnapshot::default())
        } else {
            let balance = balances
                .get(&composite)
                .ok_or_else(|| LedgerError::BalanceNotFound {
                    alias: fragment.account.clone(),
                })?;
            let before = working.get(&composite).copied().unwrap_or(balance.snapshot());
            let after = BalanceSnapshot {
                available: before.available + delta_available,
                on_hold: before.on_hold + delta_on_hold,
                version: before.version + 1,
            };
            working.insert(composite.clone(), after);
            (balance.id, before, after)
        };

        operations.push(Operation {
            id: Uuid::now_v7(),
            transaction_id: ctx.transaction_id,
            organization_id: ctx.organization_id,
            ledger_id: ctx.ledger_id,
            balance_id,
            account_alias: fragment.account.clone(),
            balance_key: fragment.balance_key().to_string(),
            asset_code: ctx.asset_code.to_string(),
            kind,
            amount: fragment.amount,
            balance_before: before,
            balance_after: after,
            balance_affected: target != TransactionStatus::Noted,
            route: fragment.route.clone(),
            description: fragment
                .description
                .clone()
                .unwrap_or_else(|| ctx.description.to_string()),
            created_at: ctx.timestamp,
        });
        Ok(())
    };

    match target {
        TransactionStatus::Created | TransactionStatus::Noted => {
            for fragment in &spec.source.from {
                emit(fragment, OperationKind::Debit, -fragment.amount, Decimal::ZERO)?;
            }
            for fragment in &spec.distribute.to {
                emit(fragment, OperationKind::Credit, fragment.amount, Decimal::ZERO)?;
            }
        }
        TransactionStatus::Pending => {
            for fragment in &spec.source.from {
                emit(fragment, OperationKind::OnHold, -fragment.amount, fragment.amount)?;
            }
        }
        TransactionStatus::Approved => {
            for fragment in &spec.source.from {
                emit(fragment, OperationKind::Release, Decimal::ZERO, -fragment.amount)?;
            }
            for fragment in &spec.distribute.to {
                emit(fragment, OperationKind::Credit, fragment.amount, Decimal::ZERO)?;
            }
        }
        TransactionStatus::Canceled => {
            for fragment in &spec.source.from {
                emit(fragment, OperationKind::Release, fragment.amount, -fragment.amount)?;
            }
        }
    }

    Ok(operations)
}

/// The `(available, on_hold)` deltas an operation applies, derived from
/// its snapshots.
pub fn operation_deltas(operation: &Operation) -> (Decimal, Decimal) {
    (
        operation.balance_after.available - operation.balance_before.available,
        operation.balance_after.on_hold - operation.balance_before.on_hold,
    )
}
