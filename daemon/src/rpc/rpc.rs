use std::sync::Arc;
use std::time::Duration;

use actix_web::http::header::ContentType;
use actix_web::web::{self, Data, Json, Path, Query};
use actix_web::{HttpRequest, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

use tally_common::account::{external_alias, DEFAULT_BALANCE_KEY};
use tally_common::api::{
    CreateBalanceRequest, CreateInflowRequest, CreateOutflowRequest, CreateTransactionRequest,
    IDEMPOTENCY_KEY_HEADER, IDEMPOTENCY_REPLAYED_HEADER, IDEMPOTENCY_TTL_HEADER,
};
use tally_common::transaction::{DistributeSpec, Fragment, SendSpec, SourceSpec};

use crate::config::{DEFAULT_IDEMPOTENCY_TTL, MAX_IDEMPOTENCY_TTL};
use crate::core::engine::{CreateArgs, CreateResult, IdempotencyOptions, Ledger};
use crate::core::idempotency::IdempotencyKeeper;
use crate::core::storage::Storage;
use crate::rpc::ApiError;

pub fn configure<S: Storage>(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/v1/organizations/{organization_id}/ledgers/{ledger_id}")
            .route("/transactions/json", web::post().to(create_transaction::<S>))
            .route("/transactions/inflow", web::post().to(create_inflow::<S>))
            .route("/transactions/outflow", web::post().to(create_outflow::<S>))
            .route(
                "/transactions/annotation",
                web::post().to(create_annotation::<S>),
            )
            .route(
                "/transactions/{transaction_id}/commit",
                web::post().to(commit_transaction::<S>),
            )
            .route(
                "/transactions/{transaction_id}/cancel",
                web::post().to(cancel_transaction::<S>),
            )
            .route(
                "/transactions/{transaction_id}/revert",
                web::post().to(revert_transaction::<S>),
            )
            .route(
                "/transactions/{transaction_id}",
                web::get().to(get_transaction::<S>),
            )
            .route("/balances", web::post().to(create_balance::<S>))
            // external aliases embed the asset code behind a slash
            .route("/balances/{alias:.*}", web::get().to(get_balance::<S>)),
    );
}

/// Pull the idempotency token and TTL off the request; the digest is over
/// the normalized body so equivalent requests hash alike.
fn idempotency_options(
    request: &HttpRequest,
    normalized_body: &[u8],
) -> Option<IdempotencyOptions> {
    let key = request
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .to_string();
    if key.is_empty() {
        return None;
    }
    let ttl = request
        .headers()
        .get(IDEMPOTENCY_TTL_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_IDEMPOTENCY_TTL)
        .min(MAX_IDEMPOTENCY_TTL);
    Some(IdempotencyOptions {
        key,
        request_hash: IdempotencyKeeper::request_hash(normalized_body),
        ttl,
    })
}

fn created_response(result: CreateResult) -> HttpResponse {
    let mut response = HttpResponse::Created();
    response.insert_header(ContentType::json());
    if result.replayed {
        response.insert_header((IDEMPOTENCY_REPLAYED_HEADER, "true"));
    }
    response.body(result.body)
}

async fn create_with(
    ledger: &Ledger<impl Storage>,
    request: HttpRequest,
    organization_id: Uuid,
    ledger_id: Uuid,
    args: CreateArgs,
) -> Result<HttpResponse, ApiError> {
    // digest the full normalized request, not the raw bytes
    let normalized = serde_json::to_vec(&args).map_err(|e| ApiError(e.into()))?;
    let idempotency = idempotency_options(&request, &normalized);
    let result = ledger
        .create_transaction(&organization_id, &ledger_id, args, idempotency)
        .await?;
    Ok(created_response(result))
}

async fn create_transaction<S: Storage>(
    ledger: Data<Arc<Ledger<S>>>,
    path: Path<(Uuid, Uuid)>,
    body: Json<CreateTransactionRequest>,
    request: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let (organization_id, ledger_id) = path.into_inner();
    let body = body.into_inner();
    let args = CreateArgs {
        description: body.description.unwrap_or_default(),
        pending: body.pending,
        noted: false,
        metadata: body.metadata,
        transaction_date: body.transaction_date,
        send: body.send,
        parent_id: None,
    };
    create_with(&ledger, request, organization_id, ledger_id, args).await
}

async fn create_annotation<S: Storage>(
    ledger: Data<Arc<Ledger<S>>>,
    path: Path<(Uuid, Uuid)>,
    body: Json<CreateTransactionRequest>,
    request: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let (organization_id, ledger_id) = path.into_inner();
    let body = body.into_inner();
    let args = CreateArgs {
        description: body.description.unwrap_or_default(),
        pending: false,
        noted: true,
        metadata: body.metadata,
        transaction_date: body.transaction_date,
        send: body.send,
        parent_id: None,
    };
    create_with(&ledger, request, organization_id, ledger_id, args).await
}

async fn create_inflow<S: Storage>(
    ledger: Data<Arc<Ledger<S>>>,
    path: Path<(Uuid, Uuid)>,
    body: Json<CreateInflowRequest>,
    request: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let (organization_id, ledger_id) = path.into_inner();
    let body = body.into_inner();
    // the external account of the asset funds the inflow
    let send = SendSpec {
        source: SourceSpec {
            from: vec![Fragment::new(
                external_alias(&body.send.asset),
                body.send.value,
            )],
        },
        distribute: body.send.distribute,
        asset: body.send.asset,
        value: body.send.value,
    };
    let args = CreateArgs {
        description: body.description.unwrap_or_default(),
        pending: body.pending,
        noted: false,
        metadata: body.metadata,
        transaction_date: body.transaction_date,
        send,
        parent_id: None,
    };
    create_with(&ledger, request, organization_id, ledger_id, args).await
}

async fn create_outflow<S: Storage>(
    ledger: Data<Arc<Ledger<S>>>,
    path: Path<(Uuid, Uuid)>,
    body: Json<CreateOutflowRequest>,
    request: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let (organization_id, ledger_id) = path.into_inner();
    let body = body.into_inner();
    // funds leave the ledger through the asset's external account
    let send = SendSpec {
        source: body.send.source,
        distribute: DistributeSpec {
            to: vec![Fragment::new(
                external_alias(&body.send.asset),
                body.send.value,
            )],
        },
        asset: body.send.asset,
        value: body.send.value,
    };
    let args = CreateArgs {
        description: body.description.unwrap_or_default(),
        pending: body.pending,
        noted: false,
        metadata: body.metadata,
        transaction_date: body.transaction_date,
        send,
        parent_id: None,
    };
    create_with(&ledger, request, organization_id, ledger_id, args).await
}

async fn commit_transaction<S: Storage>(
    ledger: Data<Arc<Ledger<S>>>,
    path: Path<(Uuid, Uuid, Uuid)>,
) -> Result<HttpResponse, ApiError> {
    let (organization_id, ledger_id, transaction_id) = path.into_inner();
    let transaction = ledger
        .commit_transaction(&organization_id, &ledger_id, &transaction_id)
        .await?;
    Ok(HttpResponse::Ok().json(transaction))
}

async fn cancel_transaction<S: Storage>(
    ledger: Data<Arc<Ledger<S>>>,
    path: Path<(Uuid, Uuid, Uuid)>,
) -> Result<HttpResponse, ApiError> {
    let (organization_id, ledger_id, transaction_id) = path.into_inner();
    let transaction = ledger
        .cancel_transaction(&organization_id, &ledger_id, &transaction_id)
        .await?;
    Ok(HttpResponse::Ok().json(transaction))
}

async fn revert_transaction<S: Storage>(
    ledger: Data<Arc<Ledger<S>>>,
    path: Path<(Uuid, Uuid, Uuid)>,
    request: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let (organization_id, ledger_id, transaction_id) = path.into_inner();
    let idempotency = idempotency_options(&request, transaction_id.as_bytes());
    let result = ledger
        .revert_transaction(&organization_id, &ledger_id, &transaction_id, idempotency)
        .await?;
    Ok(created_response(result))
}

async fn get_transaction<S: Storage>(
    ledger: Data<Arc<Ledger<S>>>,
    path: Path<(Uuid, Uuid, Uuid)>,
) -> Result<HttpResponse, ApiError> {
    let (organization_id, ledger_id, transaction_id) = path.into_inner();
    let transaction = ledger
        .get_transaction(&organization_id, &ledger_id, &transaction_id)
        .await?;
    Ok(HttpResponse::Ok().json(&*transaction))
}

async fn create_balance<S: Storage>(
    ledger: Data<Arc<Ledger<S>>>,
    path: Path<(Uuid, Uuid)>,
    body: Json<CreateBalanceRequest>,
) -> Result<HttpResponse, ApiError> {
    let (organization_id, ledger_id) = path.into_inner();
    let balance = ledger
        .create_balance(&organization_id, &ledger_id, body.into_inner())
        .await?;
    Ok(HttpResponse::Created().json(balance))
}

#[derive(Deserialize)]
struct BalanceQuery {
    key: Option<String>,
}

async fn get_balance<S: Storage>(
    ledger: Data<Arc<Ledger<S>>>,
    path: Path<(Uuid, Uuid, String)>,
    query: Query<BalanceQuery>,
) -> Result<HttpResponse, ApiError> {
    let (organization_id, ledger_id, alias) = path.into_inner();
    let key = query
        .into_inner()
        .key
        .unwrap_or_else(|| DEFAULT_BALANCE_KEY.to_string());
    let balance = ledger
        .get_balance(&organization_id, &ledger_id, &alias, &key)
        .await?;
    Ok(HttpResponse::Ok().json(balance))
}
