use std::{
    net::SocketAddr,
    sync::Arc,
};

use anyhow::Context;
use axum::{
    Json,
    Router,
    extract::State,
    http::{StatusCode, Uri},
    middleware::from_fn_with_state,
    routing::{get, post},
};
use serde_json::{Value, json};
use tiered_ratelimit::{
    EndpointPolicyRegistry,
    LimiterSettings,
    config::{CONFIG_SCOPE, DEFAULT_SCOPE, LogFormat, PRICING_SCOPE, UPLOAD_SCOPE},
    middleware::{AdmissionPipeline, admission_guard},
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = LimiterSettings::from_env().context("failed to load rate limit settings")?;
    init_tracing(settings.log_format);

    let registry = Arc::new(EndpointPolicyRegistry::from_settings(&settings));

    let pricing = Router::new()
        .route("/api/quote", post(accepted))
        .route("/api/quote/detailed", post(accepted));
    let upload = Router::new()
        .route("/api/upload", post(accepted))
        .route("/api/upload/presigned", post(accepted));
    let config_read = Router::new().route("/api/config", get(accepted));
    let fallback = Router::new().fallback(not_found);

    let app = Router::new()
        .route("/health", get(health))
        .with_state(registry.clone())
        .merge(scoped(&registry, &settings, PRICING_SCOPE, pricing)?)
        .merge(scoped(&registry, &settings, UPLOAD_SCOPE, upload)?)
        .merge(scoped(&registry, &settings, CONFIG_SCOPE, config_read)?)
        .merge(scoped(&registry, &settings, DEFAULT_SCOPE, fallback)?);

    let listener = TcpListener::bind(settings.bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(
        addr = %settings.bind_addr,
        backend = ?settings.backend,
        scopes = ?registry.scopes(),
        "rate limited API listening"
    );

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("server error")?;

    Ok(())
}

fn scoped(
    registry: &EndpointPolicyRegistry,
    settings: &LimiterSettings,
    scope: &str,
    routes: Router,
) -> anyhow::Result<Router> {
    let limiter = registry
        .limiter(scope, settings.policy_for(scope))
        .with_context(|| format!("failed to build limiter for scope {scope}"))?;
    let pipeline = Arc::new(AdmissionPipeline::for_limiter(
        scope,
        limiter,
        settings.exempt_prefixes.clone(),
    ));

    Ok(routes.layer(from_fn_with_state(pipeline, admission_guard)))
}

async fn accepted(uri: Uri) -> Json<Value> {
    Json(json!({ "status": "accepted", "path": uri.path() }))
}

async fn not_found(uri: Uri) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "not_found", "message": format!("no route for {}", uri.path()) })),
    )
}

async fn health(State(registry): State<Arc<EndpointPolicyRegistry>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "scopes": registry.scopes(),
        "degraded_calls": registry.degraded_calls(),
    }))
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,tower_http=warn"));

    match format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_route_body_has_no_retry_hint() {
        let (status, Json(body)) = not_found(Uri::from_static("/nope")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "error": "not_found", "message": "no route for /nope" }));
    }
}
