mod common;

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use common::{setup, transfer_args, transfer_spec};
use tally_common::account::{external_alias, AccountType};
use tally_common::transaction::{OperationKind, TransactionStatus};
use tally_daemon::core::engine::{CreateArgs, IdempotencyOptions};
use tally_daemon::core::error::LedgerError;
use tally_daemon::core::idempotency::IdempotencyKeeper;

#[tokio::test]
async fn test_simple_transfer() {
    let fixture = setup();
    fixture.seed_balance("@a", dec!(1000)).await;
    fixture.seed_balance("@b", dec!(0)).await;

    let result = fixture
        .ledger
        .create_transaction(
            &fixture.organization_id,
            &fixture.ledger_id,
            transfer_args("@a", "@b", dec!(100), false),
            None,
        )
        .await
        .unwrap();
    let transaction = result.transaction.unwrap();

    assert_eq!(transaction.status, TransactionStatus::Approved);
    assert_eq!(transaction.operations.len(), 2);
    assert_eq!(transaction.operations[0].kind, OperationKind::Debit);
    assert_eq!(transaction.operations[1].kind, OperationKind::Credit);

    let source = fixture.balance("@a").await;
    let destination = fixture.balance("@b").await;
    assert_eq!(source.available, dec!(900));
    assert_eq!(destination.available, dec!(100));

    // §-style double entry: debits == credits == amount
    assert_eq!(transaction.debit_total(), dec!(100));
    assert_eq!(transaction.credit_total(), dec!(100));
}

#[tokio::test]
async fn test_pending_then_commit() {
    let fixture = setup();
    fixture.seed_balance("@a", dec!(1000)).await;
    fixture.seed_balance("@b", dec!(0)).await;

    let result = fixture
        .ledger
        .create_transaction(
            &fixture.organization_id,
            &fixture.ledger_id,
            transfer_args("@a", "@b", dec!(100), true),
            None,
        )
        .await
        .unwrap();
    let pending = result.transaction.unwrap();
    assert_eq!(pending.status, TransactionStatus::Pending);
    assert_eq!(pending.operations.len(), 1);
    assert_eq!(pending.operations[0].kind, OperationKind::OnHold);

    let source = fixture.balance("@a").await;
    assert_eq!(source.available, dec!(900));
    assert_eq!(source.on_hold, dec!(100));
    assert_eq!(fixture.balance("@b").await.available, dec!(0));

    let committed = fixture
        .ledger
        .commit_transaction(&fixture.organization_id, &fixture.ledger_id, &pending.id)
        .await
        .unwrap();
    assert_eq!(committed.status, TransactionStatus::Approved);
    assert_eq!(committed.operations.len(), 3);

    let source = fixture.balance("@a").await;
    let destination = fixture.balance("@b").await;
    assert_eq!(source.available, dec!(900));
    assert_eq!(source.on_hold, dec!(0));
    assert_eq!(destination.available, dec!(100));

    let journalled = fixture
        .ledger
        .get_transaction(&fixture.organization_id, &fixture.ledger_id, &pending.id)
        .await
        .unwrap();
    assert_eq!(journalled.status, TransactionStatus::Approved);
    assert_eq!(journalled.operations.len(), 3);
}

#[tokio::test]
async fn test_pending_then_cancel() {
    let fixture = setup();
    fixture.seed_balance("@a", dec!(1000)).await;
    fixture.seed_balance("@b", dec!(0)).await;

    let pending = fixture
        .ledger
        .create_transaction(
            &fixture.organization_id,
            &fixture.ledger_id,
            transfer_args("@a", "@b", dec!(100), true),
            None,
        )
        .await
        .unwrap()
        .transaction
        .unwrap();

    let canceled = fixture
        .ledger
        .cancel_transaction(&fixture.organization_id, &fixture.ledger_id, &pending.id)
        .await
        .unwrap();
    assert_eq!(canceled.status, TransactionStatus::Canceled);

    // round-trip law: cancel restores the pre-create state exactly
    let source = fixture.balance("@a").await;
    assert_eq!(source.available, dec!(1000));
    assert_eq!(source.on_hold, dec!(0));
    assert_eq!(fixture.balance("@b").await.available, dec!(0));
}

#[tokio::test]
async fn test_commit_requires_pending() {
    let fixture = setup();
    fixture.seed_balance("@a", dec!(1000)).await;
    fixture.seed_balance("@b", dec!(0)).await;

    let approved = fixture
        .ledger
        .create_transaction(
            &fixture.organization_id,
            &fixture.ledger_id,
            transfer_args("@a", "@b", dec!(100), false),
            None,
        )
        .await
        .unwrap()
        .transaction
        .unwrap();

    assert!(matches!(
        fixture
            .ledger
            .commit_transaction(&fixture.organization_id, &fixture.ledger_id, &approved.id)
            .await
            .unwrap_err(),
        LedgerError::TransactionNotPending(_)
    ));

    // a canceled pending cannot be committed afterwards
    let pending = fixture
        .ledger
        .create_transaction(
            &fixture.organization_id,
            &fixture.ledger_id,
            transfer_args("@a", "@b", dec!(50), true),
            None,
        )
        .await
        .unwrap()
        .transaction
        .unwrap();
    fixture
        .ledger
        .cancel_transaction(&fixture.organization_id, &fixture.ledger_id, &pending.id)
        .await
        .unwrap();
    assert!(matches!(
        fixture
            .ledger
            .commit_transaction(&fixture.organization_id, &fixture.ledger_id, &pending.id)
            .await
            .unwrap_err(),
        LedgerError::TransactionNotPending(_)
    ));
}

#[tokio::test]
async fn test_revert_restores_balances() {
    let fixture = setup();
    fixture.seed_balance("@a", dec!(1000)).await;
    fixture.seed_balance("@b", dec!(0)).await;

    let original = fixture
        .ledger
        .create_transaction(
            &fixture.organization_id,
            &fixture.ledger_id,
            transfer_args("@a", "@b", dec!(100), false),
            None,
        )
        .await
        .unwrap()
        .transaction
        .unwrap();

    let child = fixture
        .ledger
        .revert_transaction(
            &fixture.organization_id,
            &fixture.ledger_id,
            &original.id,
            None,
        )
        .await
        .unwrap()
        .transaction
        .unwrap();

    assert_eq!(child.parent_id, Some(original.id));
    assert_eq!(child.status, TransactionStatus::Approved);

    let kept = fixture
        .ledger
        .get_transaction(&fixture.organization_id, &fixture.ledger_id, &original.id)
        .await
        .unwrap();
    assert_eq!(kept.status, TransactionStatus::Approved);

    let source = fixture.balance("@a").await;
    let destination = fixture.balance("@b").await;
    assert_eq!(source.available, dec!(1000));
    assert_eq!(destination.available, dec!(0));

    // per-balance deltas of original and child sum to zero
    let mut net = Decimal::ZERO;
    for op in kept.operations.iter().chain(child.operations.iter()) {
        net += op.balance_after.available - op.balance_before.available;
    }
    assert_eq!(net, dec!(0));
}

#[tokio::test]
async fn test_revert_guards() {
    let fixture = setup();
    fixture.seed_balance("@a", dec!(1000)).await;
    fixture.seed_balance("@b", dec!(0)).await;

    let original = fixture
        .ledger
        .create_transaction(
            &fixture.organization_id,
            &fixture.ledger_id,
            transfer_args("@a", "@b", dec!(100), false),
            None,
        )
        .await
        .unwrap()
        .transaction
        .unwrap();

    let child = fixture
        .ledger
        .revert_transaction(
            &fixture.organization_id,
            &fixture.ledger_id,
            &original.id,
            None,
        )
        .await
        .unwrap()
        .transaction
        .unwrap();

    // a second revert of the same transaction conflicts
    assert!(matches!(
        fixture
            .ledger
            .revert_transaction(
                &fixture.organization_id,
                &fixture.ledger_id,
                &original.id,
                None
            )
            .await
            .unwrap_err(),
        LedgerError::AlreadyReverted(_)
    ));

    // reverts of reverts are forbidden
    assert!(matches!(
        fixture
            .ledger
            .revert_transaction(
                &fixture.organization_id,
                &fixture.ledger_id,
                &child.id,
                None
            )
            .await
            .unwrap_err(),
        LedgerError::RevertOfRevert(_)
    ));

    // a pending transaction cannot be reverted
    let pending = fixture
        .ledger
        .create_transaction(
            &fixture.organization_id,
            &fixture.ledger_id,
            transfer_args("@a", "@b", dec!(10), true),
            None,
        )
        .await
        .unwrap()
        .transaction
        .unwrap();
    assert!(matches!(
        fixture
            .ledger
            .revert_transaction(
                &fixture.organization_id,
                &fixture.ledger_id,
                &pending.id,
                None
            )
            .await
            .unwrap_err(),
        LedgerError::TransactionNotApproved(_)
    ));
}

#[tokio::test]
async fn test_idempotency_replay() {
    let fixture = setup();
    fixture.seed_balance("@a", dec!(1000)).await;
    fixture.seed_balance("@b", dec!(0)).await;

    let args = transfer_args("@a", "@b", dec!(100), false);
    let hash = IdempotencyKeeper::request_hash(&serde_json::to_vec(&args.send).unwrap());
    let options = IdempotencyOptions {
        key: "client-token-1".into(),
        request_hash: hash.clone(),
        ttl: Duration::from_secs(60),
    };

    let first = fixture
        .ledger
        .create_transaction(
            &fixture.organization_id,
            &fixture.ledger_id,
            args.clone(),
            Some(options.clone()),
        )
        .await
        .unwrap();
    assert!(!first.replayed);

    let second = fixture
        .ledger
        .create_transaction(
            &fixture.organization_id,
            &fixture.ledger_id,
            args,
            Some(options),
        )
        .await
        .unwrap();
    assert!(second.replayed);
    // byte-for-byte replay of the original response
    assert_eq!(first.body, second.body);

    // the debit happened exactly once
    assert_eq!(fixture.balance("@a").await.available, dec!(900));
}

#[tokio::test]
async fn test_insufficient_funds() {
    let fixture = setup();
    fixture.seed_balance("@a", dec!(50)).await;
    fixture.seed_balance("@b", dec!(0)).await;

    let err = fixture
        .ledger
        .create_transaction(
            &fixture.organization_id,
            &fixture.ledger_id,
            transfer_args("@a", "@b", dec!(100), false),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

    // nothing moved
    assert_eq!(fixture.balance("@a").await.available, dec!(50));
    assert_eq!(fixture.balance("@b").await.available, dec!(0));
}

#[tokio::test]
async fn test_annotation_never_touches_balances() {
    let fixture = setup();
    fixture.seed_balance("@a", dec!(1000)).await;
    fixture.seed_balance("@b", dec!(0)).await;

    let mut args = transfer_args("@a", "@b", dec!(100), false);
    args.noted = true;

    let noted = fixture
        .ledger
        .create_transaction(&fixture.organization_id, &fixture.ledger_id, args, None)
        .await
        .unwrap()
        .transaction
        .unwrap();

    assert_eq!(noted.status, TransactionStatus::Noted);
    assert_eq!(noted.operations.len(), 2);
    assert!(noted.operations.iter().all(|op| !op.balance_affected));

    assert_eq!(fixture.balance("@a").await.available, dec!(1000));
    assert_eq!(fixture.balance("@b").await.available, dec!(0));

    let journalled = fixture
        .ledger
        .get_transaction(&fixture.organization_id, &fixture.ledger_id, &noted.id)
        .await
        .unwrap();
    assert_eq!(journalled.status, TransactionStatus::Noted);
}

#[tokio::test]
async fn test_inflow_and_outflow_through_external() {
    let fixture = setup();
    let external = external_alias("USD");
    fixture
        .seed_typed_balance(&external, dec!(0), AccountType::External)
        .await;
    fixture.seed_balance("@acct", dec!(100)).await;

    // inflow: external -> @acct, overdrawing the external account
    fixture
        .ledger
        .create_transaction(
            &fixture.organization_id,
            &fixture.ledger_id,
            transfer_args(&external, "@acct", dec!(40), false),
            None,
        )
        .await
        .unwrap();
    assert_eq!(fixture.balance("@acct").await.available, dec!(140));
    assert_eq!(fixture.balance(&external).await.available, dec!(-40));

    // outflow: @acct -> external
    fixture
        .ledger
        .create_transaction(
            &fixture.organization_id,
            &fixture.ledger_id,
            transfer_args("@acct", &external, dec!(15), false),
            None,
        )
        .await
        .unwrap();
    assert_eq!(fixture.balance("@acct").await.available, dec!(125));
    assert_eq!(fixture.balance(&external).await.available, dec!(-25));
}

#[tokio::test]
async fn test_versions_strictly_increase() {
    let fixture = setup();
    fixture.seed_balance("@a", dec!(1000)).await;
    fixture.seed_balance("@b", dec!(0)).await;

    let mut last_version = fixture.balance("@a").await.version;
    for _ in 0..3 {
        fixture
            .ledger
            .create_transaction(
                &fixture.organization_id,
                &fixture.ledger_id,
                transfer_args("@a", "@b", dec!(10), false),
                None,
            )
            .await
            .unwrap();
        let version = fixture.balance("@a").await.version;
        assert_eq!(version, last_version + 1);
        last_version = version;
    }
}

#[tokio::test]
async fn test_validation_rejections() {
    let fixture = setup();
    fixture.seed_balance("@a", dec!(1000)).await;
    fixture.seed_balance("@b", dec!(0)).await;

    // declared value disagrees with the aggregates
    let mut args = transfer_args("@a", "@b", dec!(100), false);
    args.send.value = dec!(90);
    assert!(matches!(
        fixture
            .ledger
            .create_transaction(&fixture.organization_id, &fixture.ledger_id, args, None)
            .await
            .unwrap_err(),
        LedgerError::ValueMismatch { .. }
    ));

    // unknown balance
    assert!(matches!(
        fixture
            .ledger
            .create_transaction(
                &fixture.organization_id,
                &fixture.ledger_id,
                transfer_args("@a", "@ghost", dec!(10), false),
                None
            )
            .await
            .unwrap_err(),
        LedgerError::BalanceNotFound { .. }
    ));

    // future-dated pending
    let mut args = transfer_args("@a", "@b", dec!(10), true);
    args.transaction_date = Some(chrono::Utc::now() + chrono::Duration::hours(2));
    assert!(matches!(
        fixture
            .ledger
            .create_transaction(&fixture.organization_id, &fixture.ledger_id, args, None)
            .await
            .unwrap_err(),
        LedgerError::PendingWithFutureDate
    ));
}

#[tokio::test]
async fn test_pending_commit_equivalent_to_direct_create() {
    let direct = setup();
    direct.seed_balance("@a", dec!(500)).await;
    direct.seed_balance("@b", dec!(0)).await;
    direct
        .ledger
        .create_transaction(
            &direct.organization_id,
            &direct.ledger_id,
            transfer_args("@a", "@b", dec!(120), false),
            None,
        )
        .await
        .unwrap();

    let two_phase = setup();
    two_phase.seed_balance("@a", dec!(500)).await;
    two_phase.seed_balance("@b", dec!(0)).await;
    let pending = two_phase
        .ledger
        .create_transaction(
            &two_phase.organization_id,
            &two_phase.ledger_id,
            transfer_args("@a", "@b", dec!(120), true),
            None,
        )
        .await
        .unwrap()
        .transaction
        .unwrap();
    two_phase
        .ledger
        .commit_transaction(&two_phase.organization_id, &two_phase.ledger_id, &pending.id)
        .await
        .unwrap();

    // same final balance state, different operation counts
    for alias in ["@a", "@b"] {
        let lhs = direct.balance(alias).await;
        let rhs = two_phase.balance(alias).await;
        assert_eq!(lhs.available, rhs.available, "available of {}", alias);
        assert_eq!(lhs.on_hold, rhs.on_hold, "on_hold of {}", alias);
    }
}

#[tokio::test]
async fn test_split_legs_and_fragment_keys() {
    let fixture = setup();
    fixture.seed_balance("@a", dec!(1000)).await;
    fixture.seed_balance("@b", dec!(0)).await;
    fixture.seed_balance("@c", dec!(0)).await;

    let mut spec = transfer_spec("@a", "@b", dec!(100));
    spec.distribute.to = vec![
        tally_common::transaction::Fragment::new("@b", dec!(70)),
        tally_common::transaction::Fragment::new("@c", dec!(30)),
    ];
    let args = CreateArgs {
        description: "split".into(),
        pending: false,
        noted: false,
        metadata: None,
        transaction_date: None,
        send: spec,
        parent_id: None,
    };

    let transaction = fixture
        .ledger
        .create_transaction(&fixture.organization_id, &fixture.ledger_id, args, None)
        .await
        .unwrap()
        .transaction
        .unwrap();
    assert_eq!(transaction.operations.len(), 3);
    assert_eq!(fixture.balance("@a").await.available, dec!(900));
    assert_eq!(fixture.balance("@b").await.available, dec!(70));
    assert_eq!(fixture.balance("@c").await.available, dec!(30));
}
