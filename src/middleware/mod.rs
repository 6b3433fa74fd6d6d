pub mod rate_limit;

use std::{
    net::SocketAddr,
    sync::Arc,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::{
    context::RequestContext,
    error::LimiterResult,
    middleware::rate_limit::RateLimitMiddleware,
    ratelimit::SlidingWindowLimiter,
};

pub enum ControlFlow {
    Continue,
    ShortCircuit(Response<Body>),
}

#[async_trait]
pub trait PipelineMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, ctx: &mut RequestContext) -> LimiterResult<ControlFlow>;

    async fn on_response(
        &self,
        _ctx: &RequestContext,
        _response: &mut Response<Body>,
    ) -> LimiterResult<()> {
        Ok(())
    }
}

/// Ordered middlewares run around an inner axum service for one scope.
/// Response hooks run in reverse for every middleware whose request hook let
/// the request through, and every request ends with one completion log line.
pub struct AdmissionPipeline {
    scope: String,
    middlewares: Vec<Arc<dyn PipelineMiddleware>>,
}

impl AdmissionPipeline {
    pub fn new(scope: impl Into<String>, middlewares: Vec<Arc<dyn PipelineMiddleware>>) -> Self {
        Self {
            scope: scope.into(),
            middlewares,
        }
    }

    pub fn for_limiter(
        scope: impl Into<String>,
        limiter: Arc<SlidingWindowLimiter>,
        exempt_prefixes: Vec<String>,
    ) -> Self {
        Self::new(
            scope,
            vec![Arc::new(RateLimitMiddleware::new(limiter, exempt_prefixes))],
        )
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub async fn handle(&self, request: Request, next: Next) -> Response {
        let peer_ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        let request_id = request
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut ctx = RequestContext::new(
            request_id,
            request.method().clone(),
            request.uri().clone(),
            request.headers().clone(),
            peer_ip,
        );
        tracing::debug!(
            request_id = %ctx.request_id,
            scope = %self.scope,
            method = %ctx.method,
            path = %ctx.uri.path(),
            "admission started"
        );

        let mut executed = Vec::new();

        for (idx, middleware) in self.middlewares.iter().enumerate() {
            match middleware.on_request(&mut ctx).await {
                Ok(ControlFlow::Continue) => executed.push(idx),
                Ok(ControlFlow::ShortCircuit(mut response)) => {
                    self.apply_response_middlewares(&executed, &ctx, &mut response)
                        .await;
                    self.finish(&ctx, &mut response);
                    return response;
                }
                Err(err) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        middleware = middleware.name(),
                        code = err.code(),
                        error = %err,
                        "middleware rejected request"
                    );
                    let mut response = err.into_response();
                    self.apply_response_middlewares(&executed, &ctx, &mut response)
                        .await;
                    self.finish(&ctx, &mut response);
                    return response;
                }
            }
        }

        let mut response = next.run(request).await;
        self.apply_response_middlewares(&executed, &ctx, &mut response)
            .await;
        self.finish(&ctx, &mut response);
        response
    }

    fn finish(&self, ctx: &RequestContext, response: &mut Response<Body>) {
        attach_request_id(&ctx.request_id, response);

        let decision = ctx.decision.as_ref();
        tracing::info!(
            request_id = %ctx.request_id,
            scope = %self.scope,
            method = %ctx.method,
            path = %ctx.uri.path(),
            identity = ctx.identity.as_ref().map(|i| i.as_str()),
            admitted = decision.map(|d| d.allowed),
            window = decision.and_then(|d| d.window).map(|w| w.as_str()),
            status = response.status().as_u16(),
            latency_ms = ctx.started_at.elapsed().as_millis() as u64,
            "request completed"
        );
    }

    async fn apply_response_middlewares(
        &self,
        executed: &[usize],
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) {
        for idx in executed.iter().rev() {
            let middleware = &self.middlewares[*idx];
            if let Err(err) = middleware.on_response(ctx, response).await {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    middleware = middleware.name(),
                    error = %err,
                    "middleware post-response hook failed"
                );
            }
        }
    }
}

/// Entry point for `axum::middleware::from_fn_with_state`.
pub async fn admission_guard(
    State(pipeline): State<Arc<AdmissionPipeline>>,
    request: Request,
    next: Next,
) -> Response {
    pipeline.handle(request, next).await
}

fn attach_request_id(request_id: &str, response: &mut Response<Body>) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }
}
