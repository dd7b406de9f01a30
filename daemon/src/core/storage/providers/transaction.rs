use async_trait::async_trait;
use uuid::Uuid;

use tally_common::transaction::{Operation, Transaction, TransactionStatus};

use crate::core::error::LedgerError;

#[async_trait]
pub trait TransactionProvider {
    // Journal a transaction together with its operations. Returns false
    // without writing anything when the id is already journalled, which is
    // how duplicate queue deliveries are absorbed.
    async fn insert_transaction(
        &mut self,
        transaction: &Transaction,
        operations: &[Operation],
    ) -> Result<bool, LedgerError>;

    // Read a transaction without its operations
    async fn get_transaction(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        transaction_id: &Uuid,
    ) -> Result<Option<Transaction>, LedgerError>;

    // Read a transaction with its operations populated
    async fn get_transaction_with_operations(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        transaction_id: &Uuid,
    ) -> Result<Option<Transaction>, LedgerError>;

    // Find the revert child of a transaction, if any
    async fn get_transaction_by_parent(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        parent_id: &Uuid,
    ) -> Result<Option<Transaction>, LedgerError>;

    // Append additional operations to an already journalled transaction
    // (the commit/cancel legs of a pending transaction)
    async fn append_operations(&mut self, operations: &[Operation]) -> Result<(), LedgerError>;

    // Move a journalled transaction to a new status. Only the status and
    // the updated-at timestamp change; the transition must be on the table.
    async fn update_transaction_status(
        &mut self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        transaction_id: &Uuid,
        status: TransactionStatus,
    ) -> Result<(), LedgerError>;
}
