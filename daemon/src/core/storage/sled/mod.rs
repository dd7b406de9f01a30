use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use log::trace;
use rust_decimal::Decimal;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use uuid::Uuid;

use tally_common::account::{composite_alias, split_composite_alias, Balance};
use tally_common::transaction::{Operation, Transaction, TransactionStatus};

use crate::core::error::LedgerError;
use crate::core::storage::{BalanceProvider, Storage, StoreCas, TransactionProvider};

// Tree names
const TREE_BALANCES: &str = "balances";
const TREE_BALANCE_INDEX: &str = "balance_index";
const TREE_TRANSACTIONS: &str = "transactions";
const TREE_OPERATIONS: &str = "operations";
const TREE_PARENTS: &str = "parents";

/// Embedded durable store. Balances are kept by id with an
/// `(org, ledger, alias#key)` index; the journal keeps transactions by id
/// and operations under a `transaction_id ++ operation_id` composite key so
/// a prefix scan returns them in creation order (ids are time-ordered).
pub struct SledStorage {
    db: Db,
    balances: Tree,
    balance_index: Tree,
    transactions: Tree,
    operations: Tree,
    parents: Tree,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory instance for tests; nothing touches the filesystem.
    pub fn temporary() -> Result<Self, LedgerError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, LedgerError> {
        Ok(Self {
            balances: db.open_tree(TREE_BALANCES)?,
            balance_index: db.open_tree(TREE_BALANCE_INDEX)?,
            transactions: db.open_tree(TREE_TRANSACTIONS)?,
            operations: db.open_tree(TREE_OPERATIONS)?,
            parents: db.open_tree(TREE_PARENTS)?,
            db,
        })
    }

    fn index_key(organization_id: &Uuid, ledger_id: &Uuid, composite: &str) -> Vec<u8> {
        format!("{}:{}:{}", organization_id, ledger_id, composite).into_bytes()
    }

    fn parent_key(organization_id: &Uuid, ledger_id: &Uuid, parent_id: &Uuid) -> Vec<u8> {
        format!("{}:{}:{}", organization_id, ledger_id, parent_id).into_bytes()
    }

    fn operation_key(transaction_id: &Uuid, operation_id: &Uuid) -> [u8; 32] {
        let mut key = [0u8; 32];
        key[..16].copy_from_slice(transaction_id.as_bytes());
        key[16..].copy_from_slice(operation_id.as_bytes());
        key
    }

    fn load_balance_row(&self, balance_id: &Uuid) -> Result<Option<Balance>, LedgerError> {
        match self.balances.get(balance_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_transaction_row(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        transaction_id: &Uuid,
    ) -> Result<Option<Transaction>, LedgerError> {
        let Some(bytes) = self.transactions.get(transaction_id.as_bytes())? else {
            return Ok(None);
        };
        let transaction: Transaction = serde_json::from_slice(&bytes)?;
        // ids are global, ownership is not
        if transaction.organization_id != *organization_id || transaction.ledger_id != *ledger_id {
            return Ok(None);
        }
        Ok(Some(transaction))
    }

    fn load_operations(&self, transaction_id: &Uuid) -> Result<Vec<Operation>, LedgerError> {
        let mut operations = Vec::new();
        for entry in self.operations.scan_prefix(transaction_id.as_bytes()) {
            let (_, bytes) = entry?;
            operations.push(serde_json::from_slice(&bytes)?);
        }
        Ok(operations)
    }

    async fn flush_now(&self) -> Result<(), LedgerError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl BalanceProvider for SledStorage {
    async fn get_balance(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        alias: &str,
        key: &str,
    ) -> Result<Option<Balance>, LedgerError> {
        if log::log_enabled!(log::Level::Trace) {
            trace!("get balance {}#{} in ledger {}", alias, key, ledger_id);
        }
        let index_key = Self::index_key(organization_id, ledger_id, &composite_alias(alias, key));
        let Some(id_bytes) = self.balance_index.get(index_key)? else {
            return Ok(None);
        };
        let balance_id = Uuid::from_slice(&id_bytes)
            .map_err(|e| LedgerError::StorageTransaction(e.to_string()))?;
        self.load_balance_row(&balance_id)
    }

    async fn get_balance_by_id(&self, balance_id: &Uuid) -> Result<Option<Balance>, LedgerError> {
        self.load_balance_row(balance_id)
    }

    async fn get_balances(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        composites: &[String],
    ) -> Result<Vec<Balance>, LedgerError> {
        let mut balances = Vec::with_capacity(composites.len());
        for composite in composites {
            let (alias, key) = split_composite_alias(composite);
            if let Some(balance) = self.get_balance(organization_id, ledger_id, alias, key).await? {
                balances.push(balance);
            }
        }
        Ok(balances)
    }

    async fn create_balance(&mut self, balance: &Balance) -> Result<(), LedgerError> {
        let index_key = Self::index_key(
            &balance.organization_id,
            &balance.ledger_id,
            &balance.composite_alias(),
        );
        // reserve the alias first so two creators cannot share it
        self.balance_index
            .compare_and_swap(
                index_key,
                None as Option<&[u8]>,
                Some(balance.id.as_bytes().as_slice()),
            )?
            .map_err(|_| {
                LedgerError::StorageTransaction(format!(
                    "balance alias '{}' already registered",
                    balance.composite_alias()
                ))
            })?;
        self.balances
            .insert(balance.id.as_bytes(), serde_json::to_vec(balance)?)?;
        self.flush_now().await
    }

    async fn compare_and_set_balance(
        &mut self,
        balance_id: &Uuid,
        expected_version: u64,
        available: Decimal,
        on_hold: Decimal,
    ) -> Result<StoreCas, LedgerError> {
        let Some(old_bytes) = self.balances.get(balance_id.as_bytes())? else {
            return Ok(StoreCas::Conflict);
        };
        let mut balance: Balance = serde_json::from_slice(&old_bytes)?;
        if balance.version != expected_version {
            if log::log_enabled!(log::Level::Trace) {
                trace!(
                    "store CAS conflict on {}: expected v{}, found v{}",
                    balance_id,
                    expected_version,
                    balance.version
                );
            }
            return Ok(StoreCas::Conflict);
        }

        balance.available = available;
        balance.on_hold = on_hold;
        balance.version = expected_version + 1;
        balance.updated_at = Utc::now();
        let new_bytes = serde_json::to_vec(&balance)?;

        match self.balances.compare_and_swap(
            balance_id.as_bytes(),
            Some(old_bytes),
            Some(new_bytes),
        )? {
            Ok(()) => {
                self.flush_now().await?;
                Ok(StoreCas::Applied(balance.version))
            }
            Err(_) => Ok(StoreCas::Conflict),
        }
    }
}

#[async_trait]
impl TransactionProvider for SledStorage {
    async fn insert_transaction(
        &mut self,
        transaction: &Transaction,
        operations: &[Operation],
    ) -> Result<bool, LedgerError> {
        if self.transactions.contains_key(transaction.id.as_bytes())? {
            if log::log_enabled!(log::Level::Trace) {
                trace!("transaction {} already journalled, skipping", transaction.id);
            }
            return Ok(false);
        }

        // journal rows never embed the operation list; it lives in its own tree
        let mut row = transaction.clone();
        row.operations = Vec::new();
        let row_bytes = serde_json::to_vec(&row)?;

        let mut op_rows = Vec::with_capacity(operations.len());
        for operation in operations {
            op_rows.push((
                Self::operation_key(&transaction.id, &operation.id),
                serde_json::to_vec(operation)?,
            ));
        }

        let parent_row = transaction.parent_id.map(|parent_id| {
            Self::parent_key(&transaction.organization_id, &transaction.ledger_id, &parent_id)
        });

        let result: Result<(), TransactionError> =
            (&self.transactions, &self.operations, &self.parents).transaction(
                |(transactions, ops, parents)| {
                    transactions
                        .insert(transaction.id.as_bytes().as_slice(), row_bytes.as_slice())?;
                    for (key, value) in &op_rows {
                        ops.insert(key.as_slice(), value.as_slice())?;
                    }
                    if let Some(parent_key) = &parent_row {
                        parents.insert(
                            parent_key.as_slice(),
                            transaction.id.as_bytes().as_slice(),
                        )?;
                    }
                    Ok::<(), ConflictableTransactionError>(())
                },
            );
        result.map_err(|e| LedgerError::StorageTransaction(e.to_string()))?;

        self.flush_now().await?;
        Ok(true)
    }

    async fn get_transaction(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        transaction_id: &Uuid,
    ) -> Result<Option<Transaction>, LedgerError> {
        self.load_transaction_row(organization_id, ledger_id, transaction_id)
    }

    async fn get_transaction_with_operations(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        transaction_id: &Uuid,
    ) -> Result<Option<Transaction>, LedgerError> {
        let Some(mut transaction) =
            self.load_transaction_row(organization_id, ledger_id, transaction_id)?
        else {
            return Ok(None);
        };
        transaction.operations = self.load_operations(transaction_id)?;
        Ok(Some(transaction))
    }

    async fn get_transaction_by_parent(
        &self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        parent_id: &Uuid,
    ) -> Result<Option<Transaction>, LedgerError> {
        let key = Self::parent_key(organization_id, ledger_id, parent_id);
        let Some(child_bytes) = self.parents.get(key)? else {
            return Ok(None);
        };
        let child_id = Uuid::from_slice(&child_bytes)
            .map_err(|e| LedgerError::StorageTransaction(e.to_string()))?;
        self.load_transaction_row(organization_id, ledger_id, &child_id)
    }

    async fn append_operations(&mut self, operations: &[Operation]) -> Result<(), LedgerError> {
        for operation in operations {
            self.operations.insert(
                Self::operation_key(&operation.transaction_id, &operation.id),
                serde_json::to_vec(operation)?,
            )?;
        }
        self.flush_now().await
    }

    async fn update_transaction_status(
        &mut self,
        organization_id: &Uuid,
        ledger_id: &Uuid,
        transaction_id: &Uuid,
        status: TransactionStatus,
    ) -> Result<(), LedgerError> {
        let Some(mut transaction) =
            self.load_transaction_row(organization_id, ledger_id, transaction_id)?
        else {
            return Err(LedgerError::TransactionNotFound(*transaction_id));
        };
        if !transaction.status.can_transition(status) {
            return Err(LedgerError::StorageTransaction(format!(
                "illegal status transition {} -> {} for {}",
                transaction.status, status, transaction_id
            )));
        }
        transaction.status = status;
        transaction.updated_at = Utc::now();
        self.transactions
            .insert(transaction_id.as_bytes(), serde_json::to_vec(&transaction)?)?;
        self.flush_now().await
    }
}

#[async_trait]
impl Storage for SledStorage {
    async fn flush(&self) -> Result<(), LedgerError> {
        self.flush_now().await
    }

    async fn stop(&mut self) -> Result<(), LedgerError> {
        self.flush_now().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tally_common::account::AccountType;
    use tally_common::transaction::SendSpec;

    fn balance(org: Uuid, ledger: Uuid, alias: &str) -> Balance {
        let now = Utc::now();
        Balance {
            id: Uuid::now_v7(),
            organization_id: org,
            ledger_id: ledger,
            account_id: Uuid::now_v7(),
            alias: alias.into(),
            key: "default".into(),
            asset_code: "USD".into(),
            available: dec!(1000),
            on_hold: dec!(0),
            version: 0,
            account_type: AccountType::Regular,
            created_at: now,
            updated_at: now,
        }
    }

    fn transaction(org: Uuid, ledger: Uuid) -> Transaction {
        let now = Utc::now();
        Transaction {
            id: Uuid::now_v7(),
            organization_id: org,
            ledger_id: ledger,
            asset_code: "USD".into(),
            amount: dec!(100),
            status: TransactionStatus::Approved,
            description: "test".into(),
            source_aliases: vec!["@a".into()],
            destination_aliases: vec!["@b".into()],
            parent_id: None,
            transaction_date: now,
            created_at: now,
            updated_at: now,
            body: SendSpec::default(),
            metadata: None,
            operations: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_balance_round_trip() {
        let mut storage = SledStorage::temporary().unwrap();
        let org = Uuid::now_v7();
        let ledger = Uuid::now_v7();
        let balance = balance(org, ledger, "@a");

        storage.create_balance(&balance).await.unwrap();
        let loaded = storage
            .get_balance(&org, &ledger, "@a", "default")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.id, balance.id);
        assert_eq!(loaded.available, dec!(1000));
        assert_eq!(loaded.version, 0);

        assert!(storage
            .get_balance(&org, &ledger, "@missing", "default")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_alias_rejected() {
        let mut storage = SledStorage::temporary().unwrap();
        let org = Uuid::now_v7();
        let ledger = Uuid::now_v7();

        storage.create_balance(&balance(org, ledger, "@a")).await.unwrap();
        assert!(storage.create_balance(&balance(org, ledger, "@a")).await.is_err());
    }

    #[tokio::test]
    async fn test_store_cas_detects_conflict() {
        let mut storage = SledStorage::temporary().unwrap();
        let org = Uuid::now_v7();
        let ledger = Uuid::now_v7();
        let balance = balance(org, ledger, "@a");
        storage.create_balance(&balance).await.unwrap();

        let applied = storage
            .compare_and_set_balance(&balance.id, 0, dec!(900), dec!(0))
            .await
            .unwrap();
        assert_eq!(applied, StoreCas::Applied(1));

        // stale expected version
        let conflict = storage
            .compare_and_set_balance(&balance.id, 0, dec!(800), dec!(0))
            .await
            .unwrap();
        assert_eq!(conflict, StoreCas::Conflict);

        let row = storage
            .get_balance(&org, &ledger, "@a", "default")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.available, dec!(900));
        assert_eq!(row.version, 1);
    }

    #[tokio::test]
    async fn test_journal_insert_is_idempotent() {
        let mut storage = SledStorage::temporary().unwrap();
        let org = Uuid::now_v7();
        let ledger = Uuid::now_v7();
        let tx = transaction(org, ledger);

        assert!(storage.insert_transaction(&tx, &[]).await.unwrap());
        assert!(!storage.insert_transaction(&tx, &[]).await.unwrap());

        let loaded = storage
            .get_transaction(&org, &ledger, &tx.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.id, tx.id);

        // wrong ledger does not see it
        assert!(storage
            .get_transaction(&org, &Uuid::now_v7(), &tx.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_parent_index() {
        let mut storage = SledStorage::temporary().unwrap();
        let org = Uuid::now_v7();
        let ledger = Uuid::now_v7();
        let parent = transaction(org, ledger);
        let mut child = transaction(org, ledger);
        child.parent_id = Some(parent.id);

        storage.insert_transaction(&parent, &[]).await.unwrap();
        assert!(storage
            .get_transaction_by_parent(&org, &ledger, &parent.id)
            .await
            .unwrap()
            .is_none());

        storage.insert_transaction(&child, &[]).await.unwrap();
        let found = storage
            .get_transaction_by_parent(&org, &ledger, &parent.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, child.id);
    }

    #[tokio::test]
    async fn test_status_update() {
        let mut storage = SledStorage::temporary().unwrap();
        let org = Uuid::now_v7();
        let ledger = Uuid::now_v7();
        let mut tx = transaction(org, ledger);
        tx.status = TransactionStatus::Pending;
        storage.insert_transaction(&tx, &[]).await.unwrap();

        storage
            .update_transaction_status(&org, &ledger, &tx.id, TransactionStatus::Approved)
            .await
            .unwrap();
        let loaded = storage
            .get_transaction(&org, &ledger, &tx.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, TransactionStatus::Approved);
    }
}
