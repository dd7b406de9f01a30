use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::account::AccountType;
use crate::transaction::{DistributeSpec, SendSpec, SourceSpec};

/// Idempotency request headers. The replay marker is a response header so
/// that a replayed body can stay byte-for-byte identical to the original.
pub const IDEMPOTENCY_KEY_HEADER: &str = "X-Idempotency-Key";
pub const IDEMPOTENCY_TTL_HEADER: &str = "X-Idempotency-TTL";
pub const IDEMPOTENCY_REPLAYED_HEADER: &str = "X-Idempotency-Replayed";

/// Body of `POST .../transactions/json` and `.../transactions/annotation`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CreateTransactionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_date: Option<DateTime<Utc>>,
    pub send: SendSpec,
}

/// Body of `POST .../transactions/inflow`: no source side, the external
/// account of the asset is debited instead.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CreateInflowRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_date: Option<DateTime<Utc>>,
    pub send: InflowSend,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InflowSend {
    pub asset: String,
    pub value: Decimal,
    pub distribute: DistributeSpec,
}

/// Body of `POST .../transactions/outflow`: no destination side, the
/// external account of the asset is credited instead.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CreateOutflowRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_date: Option<DateTime<Utc>>,
    pub send: OutflowSend,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OutflowSend {
    pub asset: String,
    pub value: Decimal,
    pub source: SourceSpec,
}

/// Bootstrap surface used to seed balances into a fresh ledger.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CreateBalanceRequest {
    pub alias: String,
    pub asset_code: String,
    #[serde(default)]
    pub account_type: AccountType,
    #[serde(default)]
    pub available: Decimal,
    #[serde(default)]
    pub on_hold: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Error body returned on every non-2xx response.
///
/// `code` is a stable short string; `fields` maps the violating field paths
/// to messages when the error is about specific input fields.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErrorEnvelope {
    pub code: String,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<BTreeMap<String, String>>,
}

impl ErrorEnvelope {
    pub fn new(
        code: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            title: title.into(),
            message: message.into(),
            fields: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
        self.fields
            .get_or_insert_with(BTreeMap::new)
            .insert(field.into(), message.into());
        self
    }
}
