use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;

use tally_common::account::is_valid_alias;
use tally_common::transaction::{
    Operation, OperationKind, SendSpec, RULE_TYPE_ACCOUNT_TYPE, RULE_TYPE_ALIAS,
};

use crate::core::error::LedgerError;

/// Transaction value and every fragment amount must be strictly positive.
pub fn validate_positivity(spec: &SendSpec) -> Result<(), LedgerError> {
    if spec.value <= Decimal::ZERO {
        return Err(LedgerError::NonPositiveAmount(spec.value));
    }
    for fragment in spec.source.from.iter().chain(spec.distribute.to.iter()) {
        if fragment.amount <= Decimal::ZERO {
            return Err(LedgerError::NonPositiveAmount(fragment.amount));
        }
    }
    Ok(())
}

/// A caller-supplied transaction date may not be in the future; combined
/// with the pending flag it is rejected with its own error.
pub fn validate_temporal(
    transaction_date: Option<DateTime<Utc>>,
    pending: bool,
) -> Result<(), LedgerError> {
    if let Some(date) = transaction_date {
        if date > Utc::now() {
            if pending {
                return Err(LedgerError::PendingWithFutureDate);
            }
            return Err(LedgerError::TransactionDateInFuture(date));
        }
    }
    Ok(())
}

/// Both sides must name at least one fragment and every alias must be
/// well-formed.
pub fn validate_shape(spec: &SendSpec) -> Result<(), LedgerError> {
    if spec.source.from.is_empty() {
        return Err(LedgerError::EmptySource);
    }
    if spec.distribute.to.is_empty() {
        return Err(LedgerError::EmptyDistribute);
    }
    for fragment in spec.source.from.iter().chain(spec.distribute.to.iter()) {
        if !is_valid_alias(&fragment.account) {
            return Err(LedgerError::InvalidAlias(fragment.account.clone()));
        }
    }
    Ok(())
}

/// Ordered aggregate checks: source and destination totals must agree with
/// each other, then each must match the declared value.
pub fn validate_aggregates(spec: &SendSpec) -> Result<(), LedgerError> {
    let source = spec.source_total();
    let destination = spec.destination_total();
    if source != destination {
        return Err(LedgerError::AmbiguousAmounts {
            source,
            destination,
        });
    }
    if source != spec.value {
        return Err(LedgerError::ValueMismatch {
            side: "source",
            declared: spec.value,
            aggregated: source,
        });
    }
    if destination != spec.value {
        return Err(LedgerError::ValueMismatch {
            side: "destination",
            declared: spec.value,
            aggregated: destination,
        });
    }
    Ok(())
}

/// When a fragment carries an account rule, type and value must both be
/// present and the value's shape must match the type.
pub fn validate_rules(spec: &SendSpec) -> Result<(), LedgerError> {
    for fragment in spec.source.from.iter().chain(spec.distribute.to.iter()) {
        let Some(rule) = &fragment.rule else {
            continue;
        };
        let (Some(rule_type), Some(value)) = (&rule.rule_type, &rule.value) else {
            return Err(LedgerError::IncompleteAccountRule);
        };
        match rule_type.as_str() {
            RULE_TYPE_ALIAS => {
                if !value.is_string() {
                    return Err(LedgerError::MalformedRuleValue(rule_type.clone()));
                }
            }
            RULE_TYPE_ACCOUNT_TYPE => {
                let well_formed = value
                    .as_array()
                    .is_some_and(|items| items.iter().all(|item| item.is_string()));
                if !well_formed {
                    return Err(LedgerError::MalformedRuleValue(rule_type.clone()));
                }
            }
            other => return Err(LedgerError::UnknownRuleType(other.to_string())),
        }
    }
    Ok(())
}

/// Every aggregated source must resolve to a balance that can cover its
/// share; external accounts may overdraw.
pub fn validate_coverage<F>(
    sources: &IndexMap<String, Decimal>,
    mut lookup: F,
) -> Result<(), LedgerError>
where
    F: FnMut(&str) -> Option<(Decimal, bool)>,
{
    for (composite, total) in sources {
        let alias = tally_common::account::split_composite_alias(composite).0;
        let Some((available, allows_overdraft)) = lookup(composite) else {
            return Err(LedgerError::BalanceNotFound {
                alias: alias.to_string(),
            });
        };
        if !allows_overdraft && available < *total {
            return Err(LedgerError::InsufficientFunds {
                alias: alias.to_string(),
            });
        }
    }
    Ok(())
}

/// Double-entry closure over synthesized operations: the outgoing side
/// (debits, holds, releases) must equal the transaction amount, and so
/// must the credit side whenever the shape has one. A failure here is a
/// programming error, not a user error.
pub fn validate_closure(operations: &[Operation], amount: Decimal) -> Result<(), LedgerError> {
    let mut outgoing = Decimal::ZERO;
    let mut credits = Decimal::ZERO;
    for operation in operations {
        match operation.kind {
            OperationKind::Debit | OperationKind::OnHold | OperationKind::Release => {
                outgoing += operation.amount
            }
            OperationKind::Credit => credits += operation.amount,
        }
    }
    let closed = outgoing == amount
        && outgoing > Decimal::ZERO
        && (credits == Decimal::ZERO || credits == amount);
    if !closed {
        return Err(LedgerError::DoubleEntryViolation {
            debits: outgoing,
            credits,
            amount,
        });
    }
    Ok(())
}
