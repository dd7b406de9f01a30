#![allow(dead_code)]

use std::sync::Arc;

use rust_decimal::Decimal;
use uuid::Uuid;

use tally_common::account::{AccountType, Balance};
use tally_common::api::CreateBalanceRequest;
use tally_common::transaction::{DistributeSpec, Fragment, SendSpec, SourceSpec};
use tally_daemon::core::cache::MemoryCache;
use tally_daemon::core::engine::{CreateArgs, Ledger};
use tally_daemon::core::idempotency::IdempotencyKeeper;
use tally_daemon::core::lock::PendingLocks;
use tally_daemon::core::queue::Broker;
use tally_daemon::core::storage::SledStorage;

pub struct TestLedger {
    pub ledger: Arc<Ledger<SledStorage>>,
    pub organization_id: Uuid,
    pub ledger_id: Uuid,
}

pub fn setup() -> TestLedger {
    setup_with_broker(None)
}

pub fn setup_with_broker(broker: Option<Arc<dyn Broker>>) -> TestLedger {
    let storage = SledStorage::temporary().expect("temporary storage");
    let cache = Arc::new(MemoryCache::new());
    let idempotency = IdempotencyKeeper::new(cache.clone());
    let pending_locks = PendingLocks::new(cache.clone());
    let ledger = Arc::new(Ledger::new(
        storage,
        cache,
        idempotency,
        pending_locks,
        broker,
        64,
    ));
    TestLedger {
        ledger,
        organization_id: Uuid::now_v7(),
        ledger_id: Uuid::now_v7(),
    }
}

impl TestLedger {
    pub async fn seed_balance(&self, alias: &str, available: Decimal) -> Balance {
        self.seed_typed_balance(alias, available, AccountType::Regular)
            .await
    }

    pub async fn seed_typed_balance(
        &self,
        alias: &str,
        available: Decimal,
        account_type: AccountType,
    ) -> Balance {
        self.ledger
            .create_balance(
                &self.organization_id,
                &self.ledger_id,
                CreateBalanceRequest {
                    alias: alias.into(),
                    asset_code: "USD".into(),
                    account_type,
                    available,
                    on_hold: Decimal::ZERO,
                    key: None,
                },
            )
            .await
            .expect("seed balance")
    }

    pub async fn balance(&self, alias: &str) -> Balance {
        self.ledger
            .get_balance(&self.organization_id, &self.ledger_id, alias, "default")
            .await
            .expect("balance")
    }
}

pub fn transfer_spec(from: &str, to: &str, amount: Decimal) -> SendSpec {
    SendSpec {
        asset: "USD".into(),
        value: amount,
        source: SourceSpec {
            from: vec![Fragment::new(from, amount)],
        },
        distribute: DistributeSpec {
            to: vec![Fragment::new(to, amount)],
        },
    }
}

pub fn transfer_args(from: &str, to: &str, amount: Decimal, pending: bool) -> CreateArgs {
    CreateArgs {
        description: "transfer".into(),
        pending,
        noted: false,
        metadata: None,
        transaction_date: None,
        send: transfer_spec(from, to, amount),
        parent_id: None,
    }
}
