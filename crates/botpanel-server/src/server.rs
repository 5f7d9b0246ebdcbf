use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

use libbotpanel::{BroadcastHub, ProcessSupervisor};

use crate::config::ServerConfig;
use crate::{api, ws};

#[derive(Debug, Clone, Copy)]
pub struct GatewayLimits {
    pub max_control_bytes: usize,
    pub max_input_bytes: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub supervisor: ProcessSupervisor,
    pub limits: GatewayLimits,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Self {
        let hub = Arc::new(BroadcastHub::new(config.log_buffer_capacity));
        Self {
            supervisor: ProcessSupervisor::new(config.supervisor_config(), hub),
            limits: GatewayLimits {
                max_control_bytes: config.max_control_bytes,
                max_input_bytes: config.max_input_bytes,
            },
        }
    }
}

pub fn router(state: AppState, allow_origins: &[String]) -> anyhow::Result<Router> {
    let cors = build_cors(allow_origins)?;
    Ok(Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/bots", get(api::list_bots))
        .route("/api/bots/{id}", get(api::bot_status))
        .route("/healthz", get(api::healthz))
        .layer(cors)
        .with_state(state))
}

/// The HTTP surface is read-only, so cross-origin callers only ever get
/// GET and HEAD. `"*"` in `allow_origins` opens it to every origin.
fn build_cors(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed = origins
            .iter()
            .map(|origin| {
                HeaderValue::from_str(origin)
                    .with_context(|| format!("invalid allow_origins value: {origin}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        AllowOrigin::list(parsed)
    };
    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::HEAD]))
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.bots_dir)
        .with_context(|| format!("failed to create bots dir {}", config.bots_dir.display()))?;

    let state = AppState::new(&config);
    let app = router(state.clone(), &config.allow_origins)?;

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen))?;
    info!(
        listen = %config.listen,
        bots_dir = %config.bots_dir.display(),
        pid = std::process::id(),
        "botpanel started"
    );

    let supervisor = state.supervisor.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down...");
            supervisor.shutdown_all().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_cors_accepts_wildcard() {
        assert!(build_cors(&["*".to_string()]).is_ok());
    }

    #[test]
    fn build_cors_rejects_bad_origin() {
        assert!(build_cors(&["bad\norigin".to_string()]).is_err());
    }
}
