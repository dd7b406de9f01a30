pub mod rpc;

use std::fmt;
use std::sync::Arc;

use actix_web::dev::Server;
use actix_web::http::StatusCode;
use actix_web::web::{self, Data};
use actix_web::{App, HttpResponse, HttpServer, ResponseError};
use log::{error, info};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;

use tally_common::api::ErrorEnvelope;

use crate::core::engine::Ledger;
use crate::core::error::LedgerError;
use crate::core::storage::Storage;

/// Engine error carried through an actix handler. Maps the tagged kind to
/// the semantic status code and the stable error envelope.
#[derive(Debug)]
pub struct ApiError(pub LedgerError);

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        Self(e)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            // operator signal: these are engine faults, not user errors
            if self.0.is_fatal() {
                error!("ALERT engine fault ({}), do not retry: {}", self.0.code(), self.0);
            } else {
                error!("engine fault ({}): {}", self.0.code(), self.0);
            }
        }
        let title = match status.as_u16() {
            400 => "Bad Request",
            404 => "Not Found",
            409 => "Conflict",
            422 => "Unprocessable Entity",
            _ => "Internal Error",
        };
        let mut envelope = ErrorEnvelope::new(self.0.code(), title, self.0.to_string());
        if let Some((field, value)) = self.0.field() {
            envelope = envelope.with_field(field, value);
        }
        HttpResponse::build(status).json(envelope)
    }
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

async fn metrics(handle: Data<Option<PrometheusHandle>>) -> HttpResponse {
    match handle.get_ref() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().finish(),
    }
}

/// Build the HTTP server over the engine. The returned server is driven by
/// the caller so shutdown stays in one place.
pub fn build_server<S: Storage>(
    ledger: Arc<Ledger<S>>,
    bind_address: &str,
    metrics_handle: Option<PrometheusHandle>,
) -> std::io::Result<Server> {
    info!("starting RPC server on {}", bind_address);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(ledger.clone()))
            .app_data(Data::new(metrics_handle.clone()))
            .route("/health", web::get().to(health))
            .route("/metrics", web::get().to(metrics))
            .configure(rpc::configure::<S>)
    })
    .bind(bind_address)?
    .run();
    Ok(server)
}
