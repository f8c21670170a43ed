use axum::extract::rejection::QueryRejection;
use axum::extract::Query;
use axum::Json;
use serde_json::{json, Value};
use tracing::{field::display, info, Span};

use crate::error::ServerError;
use crate::service::request::{parse_body, ConnectQuery, Envelope};
use crate::service::{ApiError, GatewayService};

/// Opens a database connection with the caller's credentials and returns
/// the session's id and token.
pub(crate) async fn connect(
    service: &GatewayService,
    query: Result<Query<ConnectQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query.map_err(|rejection| ServerError::Validation(rejection.body_text()))?;
    let params = query.into_params(service.config().default_database_port)?;

    let (id, token) = service.registry().connect(&params).await?;
    Span::current().record("connection_id", display(id));

    Ok(Json(json!({
        "token": token.as_str(),
        "connectionId": id.id(),
    })))
}

/// Closes the session immediately instead of waiting for its lease to run out.
pub(crate) fn disconnect(service: &GatewayService, body: &[u8]) -> Result<Json<Value>, ApiError> {
    let envelope: Envelope = parse_body(body)?;
    Span::current().record("connection_id", envelope.connection_id);

    service
        .registry()
        .disconnect(&envelope.token, envelope.connection_id)?;
    info!("session disconnected by client");
    Ok(Json(json!({ "ok": true })))
}
