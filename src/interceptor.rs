//! Traffic interception and modification interfaces
//!
//! Interceptors only run on connections accepted while interception is
//! switched on with [`ProxyServer::set_intercept`]. Requests and responses
//! handed back unchanged are forwarded as the original bytes; anything an
//! interceptor altered is serialized again.
//!
//! [`ProxyServer::set_intercept`]: crate::ProxyServer::set_intercept
use crate::errors::Result;
use crate::{Request, Response};
use std::sync::Arc;

/// Trait for intercepting and modifying requests
#[async_trait::async_trait]
pub trait RequestInterceptor: Send + Sync {
  /// Intercept and optionally modify a request
  ///
  /// Return `None` to block the request, or return a modified request
  async fn intercept_request(&self, request: Request) -> Result<Option<Request>>;
}

/// Trait for intercepting and modifying responses
#[async_trait::async_trait]
pub trait ResponseInterceptor: Send + Sync {
  /// Intercept and optionally modify the response to `request`
  ///
  /// Return `None` to block the response, or return a modified response
  async fn intercept_response(&self, request: &Request, response: Response)
    -> Result<Option<Response>>;
}

/// Runs registered interceptors in order
#[derive(Clone, Default)]
pub struct InterceptorHandler {
  request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
  response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
}

impl InterceptorHandler {
  /// Create a new interceptor handler
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a request interceptor
  pub fn add_request_interceptor(&mut self, interceptor: Arc<dyn RequestInterceptor>) {
    self.request_interceptors.push(interceptor);
  }

  /// Add a response interceptor
  pub fn add_response_interceptor(&mut self, interceptor: Arc<dyn ResponseInterceptor>) {
    self.response_interceptors.push(interceptor);
  }

  /// Process a request through all interceptors
  pub async fn process_request(&self, mut request: Request) -> Result<Option<Request>> {
    for interceptor in &self.request_interceptors {
      match interceptor.intercept_request(request).await? {
        Some(modified) => request = modified,
        None => return Ok(None),
      }
    }
    Ok(Some(request))
  }

  /// Process a response through all interceptors
  pub async fn process_response(
    &self,
    request: &Request,
    mut response: Response,
  ) -> Result<Option<Response>> {
    for interceptor in &self.response_interceptors {
      match interceptor.intercept_response(request, response).await? {
        Some(modified) => response = modified,
        None => return Ok(None),
      }
    }
    Ok(Some(response))
  }

  /// Check if any interceptors are registered
  pub fn has_interceptors(&self) -> bool {
    !self.request_interceptors.is_empty() || !self.response_interceptors.is_empty()
  }
}

/// Logs every exchange it sees and lets it through unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInterceptor;

#[async_trait::async_trait]
impl RequestInterceptor for LoggingInterceptor {
  async fn intercept_request(&self, request: Request) -> Result<Option<Request>> {
    tracing::info!(method = %request.method(), url = %request.url(), "intercepted request");
    for (name, value) in request.headers().iter() {
      tracing::debug!("  {}: {}", name, value);
    }
    Ok(Some(request))
  }
}

#[async_trait::async_trait]
impl ResponseInterceptor for LoggingInterceptor {
  async fn intercept_response(
    &self,
    request: &Request,
    response: Response,
  ) -> Result<Option<Response>> {
    tracing::info!(
      url = %request.url(),
      status = response.status(),
      "intercepted response"
    );
    for (name, value) in response.headers().iter() {
      tracing::debug!("  {}: {}", name, value);
    }
    Ok(Some(response))
  }
}
