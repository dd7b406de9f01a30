use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use uuid::Uuid;

use tally_common::account::Balance;
use tally_common::transaction::Transaction;

use crate::config::{CONSUMER_BACKOFF_BASE, CONSUMER_BACKOFF_CAP};
use crate::core::engine::Ledger;
use crate::core::error::LedgerError;
use crate::core::storage::Storage;

/// What travels over the queue in async mode: the validated transaction
/// with its synthesized operations, plus the balances it was validated
/// against. The frame is self-describing JSON with decimals as strings, so
/// amounts and caller metadata round-trip exactly.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DispatchEnvelope {
    pub organization_id: Uuid,
    pub ledger_id: Uuid,
    pub transaction: Transaction,
    pub pre_balances: Vec<Balance>,
    pub validated_amount: Decimal,
}

impl DispatchEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>, LedgerError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LedgerError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Producer half of the dispatch queue. An implementation acknowledges a
/// publish only once the payload is safely queued.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), LedgerError>;
}

/// In-process broker over a bounded tokio channel.
pub struct MemoryBroker {
    sender: mpsc::Sender<Vec<u8>>,
}

impl MemoryBroker {
    pub fn new(depth: usize) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::channel(depth);
        (Arc::new(Self { sender }), receiver)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), LedgerError> {
        self.sender
            .send(payload)
            .await
            .map_err(|_| LedgerError::BrokerUnavailable("dispatch queue closed".into()))
    }
}

/// Single-in-flight consumer: decodes each envelope and hands it to the
/// engine's finalization path. Engine faults are retried with capped
/// exponential backoff; business errors cannot be fixed by re-delivery and
/// are dropped with a warning. On shutdown the consumer drains what is
/// already queued before exiting.
pub fn spawn_consumer<S: Storage>(
    ledger: Arc<Ledger<S>>,
    mut receiver: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = receiver.recv() => match maybe {
                    Some(payload) => consume(&ledger, payload, &shutdown).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    while let Ok(payload) = receiver.try_recv() {
                        consume(&ledger, payload, &shutdown).await;
                    }
                    break;
                }
            }
        }
        info!("dispatch consumer stopped");
    })
}

async fn consume<S: Storage>(
    ledger: &Arc<Ledger<S>>,
    payload: Vec<u8>,
    shutdown: &watch::Receiver<bool>,
) {
    let envelope = match DispatchEnvelope::decode(&payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            error!("undecodable dispatch envelope dropped: {}", e);
            return;
        }
    };

    let transaction_id = envelope.transaction.id;
    let mut backoff = CONSUMER_BACKOFF_BASE;
    loop {
        match ledger.finalize_dispatch(envelope.clone()).await {
            Ok(()) => return,
            Err(e) if e.http_status() < 500 => {
                warn!(
                    "dropping dispatch of transaction {}: {}",
                    transaction_id, e
                );
                return;
            }
            Err(e) => {
                if *shutdown.borrow() {
                    warn!(
                        "shutdown while retrying transaction {}, giving up: {}",
                        transaction_id, e
                    );
                    return;
                }
                warn!(
                    "finalization of {} failed, retrying in {:?}: {}",
                    transaction_id, backoff, e
                );
                sleep(backoff).await;
                backoff = (backoff * 2).min(CONSUMER_BACKOFF_CAP);
            }
        }
    }
}
