use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::account::{composite_alias, DEFAULT_BALANCE_KEY};

/// Rule types a fragment may constrain its account with.
pub const RULE_TYPE_ALIAS: &str = "alias";
pub const RULE_TYPE_ACCOUNT_TYPE: &str = "account_type";

/// Declarative description of where funds come from and where they go.
///
/// This is the normalized intent a transaction is created from; it is kept
/// verbatim on the journalled transaction so a revert can derive its
/// inverse from it.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct SendSpec {
    pub asset: String,
    pub value: Decimal,
    pub source: SourceSpec,
    pub distribute: DistributeSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct SourceSpec {
    pub from: Vec<Fragment>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DistributeSpec {
    pub to: Vec<Fragment>,
}

/// One leg of a source or destination: an alias, an amount, and optional
/// routing/annotation attributes.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Fragment {
    pub account: String,
    pub amount: Decimal,
    #[serde(default)]
    pub asset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<AccountRule>,
}

impl Fragment {
    pub fn new(account: impl Into<String>, amount: Decimal) -> Self {
        Self {
            account: account.into(),
            amount,
            asset: String::new(),
            balance_key: None,
            route: None,
            description: None,
            metadata: None,
            rule: None,
        }
    }

    /// The balance key this fragment targets, defaulting to `default`.
    pub fn balance_key(&self) -> &str {
        self.balance_key.as_deref().unwrap_or(DEFAULT_BALANCE_KEY)
    }

    /// Internal `alias#key` form used for deduplication and balance lookup.
    pub fn composite_alias(&self) -> String {
        composite_alias(&self.account, self.balance_key())
    }
}

/// Constraint a caller can attach to a fragment's account. Both fields must
/// be present together; the value's shape depends on the type.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AccountRule {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub rule_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl SendSpec {
    /// Total declared by the source fragments.
    pub fn source_total(&self) -> Decimal {
        self.source.from.iter().map(|f| f.amount).sum()
    }

    /// Total declared by the destination fragments.
    pub fn destination_total(&self) -> Decimal {
        self.distribute.to.iter().map(|f| f.amount).sum()
    }

    /// Bare aliases on the source side, in declaration order, deduplicated.
    pub fn source_aliases(&self) -> Vec<String> {
        dedup_aliases(&self.source.from)
    }

    /// Bare aliases on the destination side, in declaration order,
    /// deduplicated.
    pub fn destination_aliases(&self) -> Vec<String> {
        dedup_aliases(&self.distribute.to)
    }

    /// Per-balance aggregated amounts over both sides, keyed by the
    /// internal `alias#key` composite. Source amounts are kept separate
    /// from destination amounts since one balance may appear on both sides.
    pub fn aggregate_sources(&self) -> IndexMap<String, Decimal> {
        aggregate(&self.source.from)
    }

    pub fn aggregate_destinations(&self) -> IndexMap<String, Decimal> {
        aggregate(&self.distribute.to)
    }

    /// Derive the inverse intent: sources and destinations swapped
    /// verbatim, amount and asset preserved.
    pub fn inverse(&self) -> SendSpec {
        SendSpec {
            asset: self.asset.clone(),
            value: self.value,
            source: SourceSpec {
                from: self.distribute.to.clone(),
            },
            distribute: DistributeSpec {
                to: self.source.from.clone(),
            },
        }
    }
}

fn dedup_aliases(fragments: &[Fragment]) -> Vec<String> {
    let mut seen = IndexMap::new();
    for fragment in fragments {
        seen.entry(fragment.account.clone()).or_insert(());
    }
    seen.into_keys().collect()
}

fn aggregate(fragments: &[Fragment]) -> IndexMap<String, Decimal> {
    let mut totals: IndexMap<String, Decimal> = IndexMap::new();
    for fragment in fragments {
        *totals.entry(fragment.composite_alias()).or_default() += fragment.amount;
    }
    totals
}
