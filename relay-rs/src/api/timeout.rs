use crate::error::ErrorResponse;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tower::{Layer, Service};

/// Bounds the time spent receiving a request body, the read-timeout
/// counterpart to the header-read timeout set on the server builder. Every
/// request body on this API is a bounded JSON document, so the middleware
/// buffers it under the deadline before the handler runs; a connection that
/// drips its body slowly is cut off here instead of riding out the much
/// larger whole-request budget.
#[derive(Debug, Clone)]
pub(crate) struct ReadTimeoutLayer {
    timeout: Duration,
}

impl ReadTimeoutLayer {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<S> Layer<S> for ReadTimeoutLayer {
    type Service = ReadTimeout<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ReadTimeout { inner, timeout: self.timeout }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ReadTimeout<S> {
    inner: S,
    timeout: Duration,
}

impl<S> Service<Request<Body>> for ReadTimeout<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let timeout = self.timeout;
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let body = match tokio::time::timeout(timeout, hyper::body::to_bytes(body)).await {
                Ok(Ok(bytes)) => Body::from(bytes),
                Ok(Err(err)) => {
                    return Ok(reject(
                        StatusCode::BAD_REQUEST,
                        format!("could not read request body: {err}"),
                    ))
                }
                Err(_) => {
                    return Ok(reject(
                        StatusCode::REQUEST_TIMEOUT,
                        "timed out reading request body".to_string(),
                    ))
                }
            };
            inner.call(Request::from_parts(parts, body)).await
        })
    }
}

fn reject(code: StatusCode, message: String) -> Response {
    let body = ErrorResponse { code: code.as_u16(), message };
    (code, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::Router;
    use hyper::body::Bytes;
    use tower::ServiceExt;

    fn app(timeout: Duration) -> Router {
        Router::new()
            .route("/", post(|body: String| async move { body }))
            .layer(ReadTimeoutLayer::new(timeout))
    }

    #[tokio::test]
    async fn prompt_bodies_pass_through() {
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::from("hello"))
            .unwrap();
        let response = app(Duration::from_millis(100)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn slow_request_bodies_are_cut_off() {
        let (mut sender, body) = Body::channel();
        tokio::spawn(async move {
            sender.send_data(Bytes::from_static(b"he")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = sender.send_data(Bytes::from_static(b"llo")).await;
        });

        let request = Request::builder().method("POST").uri("/").body(body).unwrap();
        let response = app(Duration::from_millis(50)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }
}
