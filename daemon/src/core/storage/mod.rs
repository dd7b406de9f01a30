mod providers;

pub mod sled;

pub use self::{providers::*, sled::SledStorage};

use async_trait::async_trait;

use crate::core::error::LedgerError;

/// Durable system of record behind the engine: balances on one side,
/// the transaction journal on the other. All writes are durable before the
/// call returns; reads observe prior writes.
#[async_trait]
pub trait Storage: BalanceProvider + TransactionProvider + Send + Sync + 'static {
    // Flush the inner DB to disk
    async fn flush(&self) -> Result<(), LedgerError>;

    // Stop the storage and wait for it to finish
    async fn stop(&mut self) -> Result<(), LedgerError>;
}
