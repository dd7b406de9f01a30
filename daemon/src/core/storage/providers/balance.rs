use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use tally_common::account::Balance;

use crate::core::error::LedgerError;

/// Outcome of a version-checked write against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreCas {
    /// The write landed; carries the new version.
    Applied(u64),
    /// The expected version no longer matches.
    Conflict,
}

#[async_trait]
pub trait BalanceProvider {
    // Lookup a balance by its bare alias and balance key
    async fn get_balance(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        alias: &str,
        key: &str,
    ) -> Result<Option<Balance>, LedgerError>;

    // Lookup a balance by its storage id
    async fn get_balance_by_id(
        &self,
        balance_id: &Uuid,
    ) -> Result<Option<Balance>, LedgerError>;

    // Lookup several balances by their `alias#key` composite form,
    // preserving request order. Missing entries are skipped.
    async fn get_balances(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        composites: &[String],
    ) -> Result<Vec<Balance>, LedgerError>;

    // Register a new balance. Fails if the `(alias, key)` pair is taken.
    async fn create_balance(&mut self, balance: &Balance) -> Result<(), LedgerError>;

    // Version-checked write of the two fund buckets. Durable before
    // returning `Applied`.
    async fn compare_and_set_balance(
        &mut self,
        balance_id: &Uuid,
        expected_version: u64,
        available: Decimal,
        on_hold: Decimal,
    ) -> Result<StoreCas, LedgerError>;
}
