// Copyright 2023 Helsing GmbH
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension,
};
use tokio_util::io::ReaderStream;

use super::AppState;
use crate::{
    metrics::Metrics,
    mirror::MirrorError,
    types::ProviderAddress,
};

/// Cache lifetime for metadata documents.
const METADATA_CACHE_CONTROL: &str = "public, max-age=300";

/// Cache lifetime for archives. Archive names are immutable, so clients may
/// hold on to them for a year.
const ARCHIVE_CACHE_CONTROL: &str = "public, max-age=31536000";

/// GET /health
pub(super) async fn health() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// GET /metrics, in Prometheus text exposition format.
pub(super) async fn prometheus_metrics(Extension(metrics): Extension<Metrics>) -> Response {
    match metrics.gather_and_encode() {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(error) => {
            tracing::error!(%error, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /{hostname}/{namespace}/{type}/{file}
///
/// One route covers the whole provider surface; the file tail decides what
/// is being asked for: `index.json`, `<version>.json` or `<archive>.zip`.
/// Anything else under a provider path is a 404.
pub(super) async fn provider_resource(
    State(state): State<AppState>,
    Path((hostname, namespace, provider_type, file)): Path<(String, String, String, String)>,
) -> Response {
    let provider = match ProviderAddress::new(hostname, namespace, provider_type) {
        Ok(provider) => provider,
        Err(error) => {
            tracing::debug!(%error, "rejected provider address");
            return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
        }
    };

    // Path extraction decodes percent escapes, so the tail segment can
    // still smuggle separators; those never name a cached resource.
    if file.contains(['/', '\\']) || file.contains("..") {
        return not_found();
    }

    if file == "index.json" {
        return index(state, provider).await;
    }

    if let Some(version) = file.strip_suffix(".json") {
        if version.is_empty() {
            return not_found();
        }
        return manifest(state, provider, version).await;
    }

    if file.ends_with(".zip") {
        return archive(state, provider, &file).await;
    }

    not_found()
}

async fn index(state: AppState, provider: ProviderAddress) -> Response {
    tracing::info!(%provider, "index request");

    match state.mirror.get_index(&provider).await {
        Ok(body) => metadata_response(body),
        Err(MirrorError::NotFound) => {
            tracing::info!(%provider, "provider not found");
            not_found()
        }
        Err(error) => {
            state.metrics.record_error("index_handler", error.cause());
            tracing::error!(%provider, error = ?error, "failed to get index");
            internal_error()
        }
    }
}

async fn manifest(state: AppState, provider: ProviderAddress, version: &str) -> Response {
    tracing::info!(%provider, version, "version request");

    match state.mirror.get_manifest(&provider, version).await {
        Ok(body) => metadata_response(body),
        Err(MirrorError::NotFound) => {
            tracing::info!(%provider, version, "version not found");
            not_found()
        }
        Err(error) => {
            state.metrics.record_error("version_handler", error.cause());
            tracing::error!(%provider, version, error = ?error, "failed to get version");
            internal_error()
        }
    }
}

async fn archive(state: AppState, provider: ProviderAddress, filename: &str) -> Response {
    let path = provider.archive_path(filename);
    tracing::info!(path = %path, "archive request");

    let stream = match state.mirror.get_archive(&path).await {
        Ok(stream) => stream,
        Err(MirrorError::NotFound) => {
            tracing::info!(path = %path, "archive not found");
            return not_found();
        }
        Err(error) => {
            state.metrics.record_error("archive_handler", error.cause());
            tracing::error!(path = %path, error = ?error, "failed to get archive");
            return internal_error();
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(ARCHIVE_CACHE_CONTROL),
    );
    if let Ok(disposition) =
        HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
    {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }
    if let Some(len) = stream.len() {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }

    let body = Body::from_stream(ReaderStream::new(stream.into_reader()));
    (StatusCode::OK, headers, body).into_response()
}

fn metadata_response(body: bytes::Bytes) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CACHE_CONTROL, METADATA_CACHE_CONTROL),
        ],
        body,
    )
        .into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}
