//! HTTP middleware for the allocator service.

use std::any::Any;

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Span;

/// Span maker that includes method and path on every request span, except
/// for `/health` which stays out of the traces entirely.
#[derive(Clone, Debug)]
pub struct MakeRequestSpan;

impl<B> tower_http::trace::MakeSpan<B> for MakeRequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        if request.uri().path() == "/health" {
            return Span::none();
        }

        tracing::debug_span!(
            "request",
            method = %request.method(),
            path = %request.uri(),
        )
    }
}

/// Creates a [`TraceLayer`] with method and path on every request span.
pub fn trace_layer() -> TraceLayer<
    tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>,
    MakeRequestSpan,
    DefaultOnRequest,
    DefaultOnResponse,
> {
    TraceLayer::new_for_http().make_span_with(MakeRequestSpan)
}

/// Converts a handler panic into the wire protocol's 500 body. The service
/// must keep serving other requests after any single request faults.
pub fn internal_error_response(err: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(detail, "request handler panicked");

    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"error":"internal_error"}"#))
        .expect("static response must build")
}
