/*
 * Copyright (C) 2025 The Weaver Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::weaver::observability::metrics;
use crate::weaver::util::with_context;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::error::Error;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

async fn serve_metrics() -> Response {
    match metrics::gather() {
        Ok(buffer) => {
            let mut response = Response::new(Body::from(buffer));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn health() -> Response {
    (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}

pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .route("/healthz", get(health))
        .route("/readyz", get(health))
}

/// Serves the metrics and health endpoints until the token is cancelled.
pub async fn serve(
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| with_context(err, format!("failed to bind metrics listener on {addr}")))?;
    axum::serve(listener, router())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|err| with_context(err, "metrics listener failed"))?;
    Ok(())
}
