use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, field::display, Span};

use crate::engine::ExecOutcome;
use crate::service::request::{parse_body, ExecRequest, QueryRequest};
use crate::service::{ApiError, GatewayService};

/// Runs one statement and returns its rows as the binary result payload.
pub(crate) async fn query(service: &GatewayService, body: &[u8]) -> Result<Response, ApiError> {
    let request: QueryRequest = parse_body(body)?;
    let transaction_id = request.envelope.transaction_id()?;
    Span::current().record("connection_id", request.envelope.connection_id);
    let session = service.authenticate(&request.envelope)?;

    let executor = session.executor(transaction_id).await?;
    if let Some(id) = executor.transaction_id() {
        Span::current().record("transaction_id", display(id));
    }
    let payload = executor
        .query(
            &request.sql,
            &request.args,
            service.config().statement_timeout(),
        )
        .await?;
    debug!(bytes = payload.len(), "query payload ready");

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        payload,
    )
        .into_response())
}

/// Runs a batch of statements in order; each reports its own row count or
/// error and never stops the rest.
pub(crate) async fn exec(
    service: &GatewayService,
    body: &[u8],
) -> Result<Json<Vec<ExecOutcome>>, ApiError> {
    let request: ExecRequest = parse_body(body)?;
    request.validate()?;
    let transaction_id = request.envelope.transaction_id()?;
    Span::current().record("connection_id", request.envelope.connection_id);
    let session = service.authenticate(&request.envelope)?;

    let executor = session.executor(transaction_id).await?;
    if let Some(id) = executor.transaction_id() {
        Span::current().record("transaction_id", display(id));
    }
    let outcomes = executor
        .exec_batch(
            &request.sqls,
            &request.args,
            service.config().statement_timeout(),
        )
        .await;

    Ok(Json(outcomes))
}
