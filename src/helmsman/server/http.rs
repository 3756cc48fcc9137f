/*
 * Copyright (C) 2024 The Helmsman Authors
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

use crate::helmsman::observability::{health, metrics};
use crate::helmsman::store::Storage;
use crate::helmsman::util::{with_context, DynError};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;

/// Serves `/health` and `/metrics` until cancelled.
pub async fn serve(
    listen_addr: &str,
    storage: Storage,
    cancel: CancellationToken,
) -> Result<(), DynError> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(storage);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .map_err(|err| with_context(err, format!("binding {listen_addr}")))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|err| with_context(err, "serving health listener"))?;
    Ok(())
}

async fn health_handler(State(storage): State<Storage>) -> impl IntoResponse {
    let report = health::check(&storage).await;
    let status = match report.status {
        health::HealthStatus::Ready => StatusCode::OK,
        health::HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}
