//! axum middleware around request handlers.
//!
//! ```rust,ignore
//! Router::new()
//!     .route("/ping", get(ping))
//!     .layer(middleware::from_fn_with_state(recorder, record_timing))
//!     .layer(middleware::from_fn(trace_region));
//! ```

use std::time::Instant;

use axum::{
    body::HttpBody,
    extract::{MatchedPath, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{error, info_span, Instrument};

use crate::recorder::TimingRecorder;

/// Route pattern if the router matched one, else the raw path.
fn route_of(request: &Request) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string())
}

fn body_bytes(response: &Response) -> u64 {
    if let Some(exact) = response.body().size_hint().exact() {
        return exact;
    }
    response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Append one access-log line per request.
///
/// A failed append replaces the response with a 500.
pub async fn record_timing(
    State(recorder): State<TimingRecorder>,
    request: Request,
    next: Next,
) -> Response {
    let region = recorder.start();
    let method = request.method().clone();
    let uri = route_of(&request);

    let response = next.run(request).await;

    let stopped = Instant::now();
    let status = response.status().as_u16();
    let bytes = body_bytes(&response);

    // Blocking: std mutex plus file write
    let line_method = method.clone();
    let line_uri = uri.clone();
    let appended = tokio::task::spawn_blocking(move || {
        region
            .stop_at(stopped, line_method.as_str(), &line_uri, status, bytes)
            .map_err(|e| e.to_string())
    })
    .await
    .unwrap_or_else(|e| Err(format!("access log task failed: {e}")));

    match appended {
        Ok(()) => response,
        Err(e) => {
            error!(%method, uri = %uri, "access log write failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "access log write failed").into_response()
        }
    }
}

/// Run the request inside a span named after its method and route.
pub async fn trace_region(request: Request, next: Next) -> Response {
    let region = format!("{} {}", request.method(), route_of(&request));
    let span = info_span!("region", region = %region);
    next.run(request).instrument(span).await
}
