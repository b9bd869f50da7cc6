//! Bearer-token layer for mutating endpoints
//!
//! When `server.api_token` is configured, POST and PUT requests must carry
//! `Authorization: Bearer <token>`. Reads stay open: status and counters
//! are queryable at all times, and the SSE endpoint cannot send custom
//! headers from an EventSource client anyway.

use axum::{
    extract::Request,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::{Layer, Service};

#[derive(Clone)]
pub struct AuthLayer {
    /// None disables the check entirely
    pub token: Option<String>,
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            token: self.token.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    token: Option<String>,
}

impl<S> Service<Request> for AuthMiddleware<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let token = self.token.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let Some(expected) = token else {
                return inner.call(request).await;
            };

            let mutating = matches!(request.method(), &Method::POST | &Method::PUT);
            if !mutating {
                return inner.call(request).await;
            }

            let provided = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "));

            match provided {
                Some(t) if t == expected => inner.call(request).await,
                _ => Ok(unauthorized_response()),
            }
        })
    }
}

fn unauthorized_response() -> Response {
    let body = Json(json!({
        "error": {
            "code": "UNAUTHORIZED",
            "message": "missing or invalid bearer token",
        }
    }));
    (StatusCode::UNAUTHORIZED, body).into_response()
}
