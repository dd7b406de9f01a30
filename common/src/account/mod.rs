use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Balance key used when the caller does not name one
pub const DEFAULT_BALANCE_KEY: &str = "default";

// Aliases of ledger-wide external accounts are derived from the asset code
pub const EXTERNAL_ALIAS_PREFIX: &str = "@external/";

// Separator between alias and balance key in the internal composite form
pub const ALIAS_KEY_SEPARATOR: char = '#';

/// Kind of account a balance belongs to.
///
/// External accounts represent the world outside the ledger (inflows and
/// outflows). They are the only accounts allowed to go negative.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    #[default]
    Regular,
    External,
}

impl AccountType {
    pub fn allows_overdraft(&self) -> bool {
        matches!(self, AccountType::External)
    }
}

/// The mutable funds of a balance at a point in time, with the version
/// counter used by the compare-and-set protocol.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BalanceSnapshot {
    pub available: Decimal,
    pub on_hold: Decimal,
    pub version: u64,
}

/// A per-account, per-asset, per-key balance.
///
/// Identity is `(organization, ledger, alias, key)`; `id` is the stable
/// storage handle. `version` strictly increases on every mutation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Balance {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub ledger_id: Uuid,
    pub account_id: Uuid,
    pub alias: String,
    pub key: String,
    pub asset_code: String,
    pub available: Decimal,
    pub on_hold: Decimal,
    pub version: u64,
    pub account_type: AccountType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn is_external(&self) -> bool {
        self.account_type.allows_overdraft()
    }

    pub fn snapshot(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            available: self.available,
            on_hold: self.on_hold,
            version: self.version,
        }
    }

    /// Composite `alias#key` form used internally for deduplication.
    pub fn composite_alias(&self) -> String {
        composite_alias(&self.alias, &self.key)
    }
}

/// Alias of the ledger-wide external account for an asset.
pub fn external_alias(asset_code: &str) -> String {
    format!("{}{}", EXTERNAL_ALIAS_PREFIX, asset_code)
}

pub fn is_external_alias(alias: &str) -> bool {
    alias.starts_with(EXTERNAL_ALIAS_PREFIX)
}

/// A user-facing alias is a non-empty handle beginning with `@`.
pub fn is_valid_alias(alias: &str) -> bool {
    alias.len() > 1 && alias.starts_with('@') && !alias.contains(ALIAS_KEY_SEPARATOR)
}

/// Build the internal `alias#key` composite form.
pub fn composite_alias(alias: &str, key: &str) -> String {
    format!("{}{}{}", alias, ALIAS_KEY_SEPARATOR, key)
}

/// Split an `alias#key` composite back into its bare parts.
/// A missing key maps to [`DEFAULT_BALANCE_KEY`].
pub fn split_composite_alias(composite: &str) -> (&str, &str) {
    match composite.split_once(ALIAS_KEY_SEPARATOR) {
        Some((alias, key)) if !key.is_empty() => (alias, key),
        Some((alias, _)) => (alias, DEFAULT_BALANCE_KEY),
        None => (composite, DEFAULT_BALANCE_KEY),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_validation() {
        assert!(is_valid_alias("@treasury"));
        assert!(is_valid_alias("@external/USD"));
        assert!(!is_valid_alias("treasury"));
        assert!(!is_valid_alias("@"));
        assert!(!is_valid_alias("@a#default"));
    }

    #[test]
    fn test_external_alias() {
        assert_eq!(external_alias("USD"), "@external/USD");
        assert!(is_external_alias("@external/USD"));
        assert!(!is_external_alias("@merchant"));
    }

    #[test]
    fn test_composite_round_trip() {
        let composite = composite_alias("@a", "savings");
        assert_eq!(composite, "@a#savings");
        assert_eq!(split_composite_alias(&composite), ("@a", "savings"));
        assert_eq!(split_composite_alias("@a"), ("@a", DEFAULT_BALANCE_KEY));
        assert_eq!(split_composite_alias("@a#"), ("@a", DEFAULT_BALANCE_KEY));
    }

    #[test]
    fn test_overdraft_permission() {
        assert!(AccountType::External.allows_overdraft());
        assert!(!AccountType::Regular.allows_overdraft());
    }
}
