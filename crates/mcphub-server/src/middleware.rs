//! Request interceptors.
//!
//! The hub holds an ordered interceptor chain fixed at construction.
//! Interceptors observe every downstream request before routing and after
//! completion; a `before` error vetoes the request.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::router::RequestCtx;
use mcphub_core::{Redactor, Result};

/// Hook around downstream request dispatch
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    /// Called before routing; an error aborts the request
    async fn before(
        &self,
        method: &str,
        params: &serde_json::Value,
        ctx: &RequestCtx,
    ) -> Result<()>;

    /// Called after the request completed, successfully or not
    async fn after(&self, method: &str, success: bool, ctx: &RequestCtx);
}

/// Ordered interceptor chain
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn RequestInterceptor>>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

impl InterceptorChain {
    /// Create an empty chain
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor
    #[must_use]
    pub fn with(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Run every `before` hook in order; the first error wins
    pub async fn before(
        &self,
        method: &str,
        params: &serde_json::Value,
        ctx: &RequestCtx,
    ) -> Result<()> {
        for interceptor in &self.interceptors {
            interceptor.before(method, params, ctx).await?;
        }
        Ok(())
    }

    /// Run every `after` hook in order
    pub async fn after(&self, method: &str, success: bool, ctx: &RequestCtx) {
        for interceptor in &self.interceptors {
            interceptor.after(method, success, ctx).await;
        }
    }

    /// Number of interceptors
    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Whether the chain is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

/// Interceptor logging each request with redacted parameters
#[derive(Debug)]
pub struct LoggingInterceptor {
    redactor: Redactor,
}

impl LoggingInterceptor {
    /// Create a logging interceptor with the given redactor
    #[must_use]
    pub fn new(redactor: Redactor) -> Self {
        Self { redactor }
    }
}

#[async_trait]
impl RequestInterceptor for LoggingInterceptor {
    async fn before(
        &self,
        method: &str,
        params: &serde_json::Value,
        ctx: &RequestCtx,
    ) -> Result<()> {
        debug!(
            method,
            session = ctx.session_id.as_deref().unwrap_or("-"),
            params = %self.redactor.redacted(params),
            "request received"
        );
        Ok(())
    }

    async fn after(&self, method: &str, success: bool, ctx: &RequestCtx) {
        info!(
            method,
            success,
            session = ctx.session_id.as_deref().unwrap_or("-"),
            "request completed"
        );
    }
}
