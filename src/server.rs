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

//! HTTP edge of the mirror.
//!
//! Routes follow the provider network mirror layout: every metadata and
//! archive request lives under `/<hostname>/<namespace>/<type>/…`, with
//! `/health` and (when enabled) `/metrics` alongside. Handlers translate
//! request paths into mirror calls and mirror errors into status codes;
//! caching, rewriting and upstream traffic all happen below this layer.

use std::sync::Arc;

use axum::{middleware::from_fn, routing::get, Extension, Router};
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::{
    config::Config,
    metrics::{self, Metrics},
    mirror::Mirror,
};

mod handlers;

/// Shared state for request handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    mirror: Arc<Mirror>,
    metrics: Metrics,
}

impl AppState {
    /// Bundle the mirror service and metrics handle.
    pub fn new(mirror: Arc<Mirror>, metrics: Metrics) -> Self {
        Self { mirror, metrics }
    }
}

/// Assemble the application router.
///
/// The middleware stack, outermost first: request tracing, the panic
/// recovery boundary, the request deadline, then metrics recording. The
/// `/metrics` route and the recording middleware are only mounted when
/// metrics are enabled; the registry handle itself always exists.
pub fn router(state: AppState, config: &Config) -> Router {
    let metrics = state.metrics.clone();

    let mut app = Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/{hostname}/{namespace}/{provider_type}/{file}",
            get(handlers::provider_resource),
        )
        .with_state(state);

    if config.metrics_enabled {
        app = app
            .route("/metrics", get(handlers::prometheus_metrics))
            .layer(from_fn(metrics::metrics_middleware))
            .layer(Extension(metrics));
    }

    app.layer(TimeoutLayer::new(config.write_timeout()))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}
