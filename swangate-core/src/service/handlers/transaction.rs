use axum::Json;
use serde_json::{json, Value};
use tracing::{field::display, info, Span};

use crate::service::request::{parse_body, Envelope};
use crate::service::{ApiError, GatewayService};
use crate::session::Outcome;

/// Starts a transaction for the session, nested as a savepoint when one is
/// already open.
pub(crate) async fn begin(service: &GatewayService, body: &[u8]) -> Result<Json<Value>, ApiError> {
    let envelope: Envelope = parse_body(body)?;
    Span::current().record("connection_id", envelope.connection_id);
    let session = service.authenticate(&envelope)?;

    let transaction_id = session
        .begin_transaction(service.config().transaction_timeout())
        .await?;
    Span::current().record("transaction_id", display(transaction_id));
    info!("transaction started in session");

    Ok(Json(json!({ "transaction_id": transaction_id.id() })))
}

/// Commits or rolls back the named transaction. The id is retired either
/// way, so a second finish on it is rejected as unauthorized.
pub(crate) async fn finish(
    service: &GatewayService,
    body: &[u8],
    outcome: Outcome,
) -> Result<Json<Value>, ApiError> {
    let envelope: Envelope = parse_body(body)?;
    let transaction_id = envelope.required_transaction_id()?;
    Span::current().record("connection_id", envelope.connection_id);
    Span::current().record("transaction_id", display(transaction_id));
    let session = service.authenticate(&envelope)?;

    session
        .finish_transaction(
            transaction_id,
            outcome,
            service.config().transaction_timeout(),
        )
        .await?;
    info!(?outcome, "transaction finished");

    Ok(Json(json!({ "ok": true })))
}
