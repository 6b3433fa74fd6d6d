use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json,
    body::Body,
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::{
    context::RequestContext,
    error::{ErrorBody, LimiterResult},
    identity,
    middleware::{ControlFlow, PipelineMiddleware},
    ratelimit::{AdmissionDecision, SlidingWindowLimiter},
};

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Consults the limiter before the handler runs and reports remaining quota on
/// the way out. Only response headers are ever modified.
pub struct RateLimitMiddleware {
    limiter: Arc<SlidingWindowLimiter>,
    exempt_prefixes: Vec<String>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<SlidingWindowLimiter>, exempt_prefixes: Vec<String>) -> Self {
        Self {
            limiter,
            exempt_prefixes,
        }
    }

    fn is_exempt_path(&self, path: &str) -> bool {
        self.exempt_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    fn limited_response(&self, decision: AdmissionDecision) -> Response<Body> {
        let retry_after = decision.retry_after_secs;
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorBody {
                error: true,
                message: decision
                    .reason
                    .unwrap_or_else(|| "Rate limit exceeded".to_string()),
                retry_after,
            }),
        )
            .into_response();

        let headers = response.headers_mut();
        headers.insert(
            header::RETRY_AFTER,
            HeaderValue::from(retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS)),
        );
        headers.insert(
            X_RATELIMIT_LIMIT,
            HeaderValue::from(self.limiter.config().requests_per_minute),
        );
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from_static("0"));

        response
    }
}

#[async_trait]
impl PipelineMiddleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> LimiterResult<ControlFlow> {
        if self.is_exempt_path(ctx.uri.path()) {
            return Ok(ControlFlow::Continue);
        }

        let identity = identity::resolve(&ctx.headers, ctx.peer_ip);
        let decision = self.limiter.check(&identity).await;
        ctx.identity = Some(identity);
        ctx.decision = Some(decision.clone());

        if decision.allowed {
            return Ok(ControlFlow::Continue);
        }

        tracing::debug!(
            request_id = %ctx.request_id,
            reason = ?decision.reason,
            retry_after = ?decision.retry_after_secs,
            "request rejected by rate limiter"
        );
        Ok(ControlFlow::ShortCircuit(self.limited_response(decision)))
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) -> LimiterResult<()> {
        let Some(identity) = ctx.identity.as_ref() else {
            return Ok(());
        };

        let snapshot = self.limiter.get_remaining_requests(identity).await?;
        let headers = response.headers_mut();
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(snapshot.limit_per_minute));
        headers.insert(
            X_RATELIMIT_REMAINING,
            HeaderValue::from(snapshot.remaining_per_minute),
        );
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(snapshot.reset_minute_secs));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        config::{BackendConfig, FailurePolicy, RateLimitConfig},
        middleware::{AdmissionPipeline, admission_guard},
        ratelimit::EndpointPolicyRegistry,
    };
    use axum::{
        Router,
        body::to_bytes,
        http::Request,
        routing::{get, post},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    fn burst_config() -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: 20,
            requests_per_hour: 200,
            burst_limit: 5,
            burst_window_seconds: 10,
            ..RateLimitConfig::default()
        }
        .with_blacklist(["6.6.6.6"])
    }

    fn app_for(limiter: Arc<SlidingWindowLimiter>) -> Router {
        let pipeline = Arc::new(AdmissionPipeline::for_limiter(
            "pricing",
            limiter,
            vec!["/health".to_string()],
        ));

        Router::new()
            .route("/quote", post(|| async { "quoted" }))
            .route("/health", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(pipeline, admission_guard))
    }

    fn app(backend: BackendConfig) -> Router {
        let registry = EndpointPolicyRegistry::new(backend, FailurePolicy::Open, None);
        app_for(registry.limiter("pricing", burst_config()).unwrap())
    }

    fn request(method: &str, path: &str, client: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .header("x-forwarded-for", client)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: Response<Body>) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn header<'a>(response: &'a Response<Body>, name: &str) -> Option<&'a str> {
        response.headers().get(name).and_then(|v| v.to_str().ok())
    }

    #[tokio::test]
    async fn admitted_response_carries_quota_headers() {
        let app = app(BackendConfig::InMemory);

        let response = app.oneshot(request("POST", "/quote", "1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-limit"), Some("20"));
        assert_eq!(header(&response, "x-ratelimit-remaining"), Some("19"));
        assert_eq!(header(&response, "x-ratelimit-reset"), Some("60"));
        assert!(header(&response, "x-request-id").is_some());
    }

    #[tokio::test]
    async fn burst_overflow_gets_structured_429() {
        let app = app(BackendConfig::InMemory);

        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(request("POST", "/quote", "1.2.3.4"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.oneshot(request("POST", "/quote", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, "retry-after"), Some("10"));
        assert_eq!(header(&response, "x-ratelimit-limit"), Some("20"));
        assert_eq!(header(&response, "x-ratelimit-remaining"), Some("0"));

        let body = json_body(response).await;
        assert_eq!(body["error"], Value::Bool(true));
        assert_eq!(body["message"], "too many requests, slow down");
        assert_eq!(body["retry_after"], 10);
    }

    #[tokio::test]
    async fn identities_are_limited_separately() {
        let app = app(BackendConfig::InMemory);

        for _ in 0..5 {
            app.clone()
                .oneshot(request("POST", "/quote", "1.2.3.4"))
                .await
                .unwrap();
        }

        let other = app.oneshot(request("POST", "/quote", "5.6.7.8")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn blacklisted_client_gets_429_without_hint() {
        let app = app(BackendConfig::InMemory);

        let response = app.oneshot(request("POST", "/quote", "6.6.6.6")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, "retry-after"), Some("60"));

        let body = json_body(response).await;
        assert_eq!(body["message"], "blocked");
        assert_eq!(body["retry_after"], Value::Null);
    }

    #[tokio::test]
    async fn exempt_paths_skip_limiting_and_decoration() {
        let app = app(BackendConfig::InMemory);

        let response = app.oneshot(request("GET", "/health", "6.6.6.6")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, "x-ratelimit-limit").is_none());
    }

    #[tokio::test]
    async fn unreachable_redis_behaves_like_in_memory() {
        let app = app(BackendConfig::Redis {
            url: "redis://127.0.0.1:1/".to_string(),
            key_prefix: "test".to_string(),
            timeout: Duration::from_millis(500),
        });

        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(request("POST", "/quote", "1.2.3.4"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.oneshot(request("POST", "/quote", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json_body(response).await["retry_after"], 10);
    }
}
