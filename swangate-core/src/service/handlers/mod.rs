use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::response::Response;
use axum::Json;
use serde_json::{json, Value};
use tracing::instrument;

use super::request::ConnectQuery;
use super::{ApiError, GatewayService};
use crate::engine::ExecOutcome;
use crate::session::Outcome;

mod connect;
mod statement;
mod transaction;

#[instrument(skip(service, query), fields(connection_id))]
pub(crate) async fn connect(
    State(service): State<GatewayService>,
    query: Result<Query<ConnectQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    connect::connect(&service, query).await
}

#[instrument(skip(service, body), fields(connection_id))]
pub(crate) async fn disconnect(
    State(service): State<GatewayService>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    connect::disconnect(&service, &body)
}

#[instrument(skip(service, body), fields(connection_id, transaction_id))]
pub(crate) async fn begin_transaction(
    State(service): State<GatewayService>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    transaction::begin(&service, &body).await
}

#[instrument(skip(service, body), fields(connection_id, transaction_id))]
pub(crate) async fn commit_transaction(
    State(service): State<GatewayService>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    transaction::finish(&service, &body, Outcome::Commit).await
}

#[instrument(skip(service, body), fields(connection_id, transaction_id))]
pub(crate) async fn rollback_transaction(
    State(service): State<GatewayService>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    transaction::finish(&service, &body, Outcome::Rollback).await
}

#[instrument(skip(service, body), fields(connection_id, transaction_id))]
pub(crate) async fn query(
    State(service): State<GatewayService>,
    body: Bytes,
) -> Result<Response, ApiError> {
    statement::query(&service, &body).await
}

#[instrument(skip(service, body), fields(connection_id, transaction_id))]
pub(crate) async fn exec(
    State(service): State<GatewayService>,
    body: Bytes,
) -> Result<Json<Vec<ExecOutcome>>, ApiError> {
    statement::exec(&service, &body).await
}

pub(crate) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
