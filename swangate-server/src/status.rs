use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use swangate_core::config::ServerConfig;
use swangate_core::session::{SessionRegistry, SessionRegistrySnapshot};

#[derive(Serialize)]
struct StatusPayload {
    generated_at_ms: u64,
    sessions: SessionRegistrySnapshot,
}

/// Serves `{prefix}/status.json` on a separate listener so operators can
/// watch session occupancy without going through the gateway routes.
pub fn spawn_status_server(config: &ServerConfig, registry: SessionRegistry) -> Result<()> {
    if !config.status_enabled {
        return Ok(());
    }

    let addr: SocketAddr = format!("{}:{}", config.status_host, config.status_port)
        .parse()
        .with_context(|| "invalid status server bind address")?;

    let app = status_router(&config.status_path_prefix, registry);

    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(err) = axum::serve(listener, app).await {
                    tracing::error!(%err, "status server failed");
                }
            }
            Err(err) => {
                tracing::error!(%err, "status server bind failed");
            }
        }
    });

    tracing::info!(%addr, "status server listening");
    Ok(())
}

fn status_router(prefix: &str, registry: SessionRegistry) -> Router {
    let json_path = format!("{}/status.json", normalize_prefix(prefix));
    Router::new()
        .route(&json_path, get(status_json))
        .with_state(registry)
}

async fn status_json(State(registry): State<SessionRegistry>) -> Json<StatusPayload> {
    Json(StatusPayload {
        generated_at_ms: now_millis(),
        sessions: registry.snapshot(),
    })
}

fn now_millis() -> u64 {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    fn build_registry(capacity: usize, lease_secs: u64) -> Result<SessionRegistry> {
        let config = ServerConfig {
            session_lease_seconds: lease_secs,
            ..ServerConfig::default()
        };
        SessionRegistry::with_capacity(&config, capacity).map_err(|e| anyhow!(e.to_string()))
    }

    #[test]
    fn normalize_prefix_handles_empty_and_non_empty_inputs() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix("status"), "/status");
        assert_eq!(normalize_prefix("/status/"), "/status");
    }

    #[tokio::test]
    async fn status_json_reports_session_snapshot() -> Result<()> {
        let registry = build_registry(7, 600)?;
        let Json(payload) = status_json(State(registry)).await;
        assert!(payload.generated_at_ms > 0);
        assert_eq!(payload.sessions.capacity, 7);
        assert_eq!(payload.sessions.live_sessions, 0);
        assert_eq!(payload.sessions.session_lease_seconds, 600);
        Ok(())
    }

    #[tokio::test]
    async fn status_route_honours_path_prefix() -> Result<()> {
        let router = status_router("/ops/", build_registry(4, 60)?);
        let response = router
            .oneshot(Request::builder().uri("/ops/status.json").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let body: Value = serde_json::from_slice(&bytes)?;
        assert_eq!(body["sessions"]["capacity"], 4);
        Ok(())
    }

    #[test]
    fn spawn_status_server_is_noop_when_disabled() -> Result<()> {
        let config = ServerConfig {
            status_enabled: false,
            status_host: "not-a-valid-host:".to_string(),
            ..ServerConfig::default()
        };
        spawn_status_server(&config, build_registry(2, 60)?)?;
        Ok(())
    }

    #[test]
    fn spawn_status_server_validates_bind_address_when_enabled() -> Result<()> {
        let config = ServerConfig {
            status_enabled: true,
            status_host: "invalid host".to_string(),
            status_port: 9999,
            ..ServerConfig::default()
        };
        let err = spawn_status_server(&config, build_registry(2, 60)?)
            .err()
            .ok_or_else(|| anyhow!("expected invalid bind address error"))?;
        assert!(err
            .to_string()
            .contains("invalid status server bind address"));
        Ok(())
    }
}
