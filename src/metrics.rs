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

//! Prometheus metrics.
//!
//! One [`Metrics`] handle wraps a private registry and is shared by the HTTP
//! middleware (request counters and latency), the mirror (cache hit/miss per
//! blob kind), the upstream client (request status and latency per fetch
//! kind) and the handlers (error counters per subsystem). The `path` label
//! always carries a route template, never a raw request path, to keep series
//! cardinality bounded.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{extract::Request, http::HeaderMap, middleware::Next, response::Response};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Shared metrics state backed by a Prometheus registry.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

struct Inner {
    registry: Registry,

    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    http_request_size_bytes: HistogramVec,
    http_response_size_bytes: HistogramVec,

    cache_hits_total: IntCounterVec,
    cache_misses_total: IntCounterVec,

    upstream_requests_total: IntCounterVec,
    upstream_request_duration_seconds: HistogramVec,

    errors_total: IntCounterVec,
}

impl Metrics {
    /// Create a metrics handle with a fresh registry.
    pub fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests"),
            &["method", "path", "status"],
        )
        .expect("metric can be created");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["method", "path"],
        )
        .expect("metric can be created");

        let size_buckets =
            prometheus::exponential_buckets(256.0, 4.0, 8).expect("buckets are well formed");

        let http_request_size_bytes = HistogramVec::new(
            HistogramOpts::new("http_request_size_bytes", "HTTP request body size in bytes")
                .buckets(size_buckets.clone()),
            &["method", "path"],
        )
        .expect("metric can be created");

        let http_response_size_bytes = HistogramVec::new(
            HistogramOpts::new(
                "http_response_size_bytes",
                "HTTP response body size in bytes",
            )
            .buckets(size_buckets),
            &["method", "path"],
        )
        .expect("metric can be created");

        let cache_hits_total = IntCounterVec::new(
            Opts::new("cache_hits_total", "Cache hits per blob kind"),
            &["kind"],
        )
        .expect("metric can be created");

        let cache_misses_total = IntCounterVec::new(
            Opts::new("cache_misses_total", "Cache misses per blob kind"),
            &["kind"],
        )
        .expect("metric can be created");

        let upstream_requests_total = IntCounterVec::new(
            Opts::new("upstream_requests_total", "Upstream HTTP requests"),
            &["status", "kind"],
        )
        .expect("metric can be created");

        let upstream_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "upstream_request_duration_seconds",
                "Upstream request duration in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["kind"],
        )
        .expect("metric can be created");

        let errors_total = IntCounterVec::new(
            Opts::new("errors_total", "Errors per subsystem and cause"),
            &["subsystem", "cause"],
        )
        .expect("metric can be created");

        for collector in [
            Box::new(http_requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(http_request_duration_seconds.clone()),
            Box::new(http_request_size_bytes.clone()),
            Box::new(http_response_size_bytes.clone()),
            Box::new(cache_hits_total.clone()),
            Box::new(cache_misses_total.clone()),
            Box::new(upstream_requests_total.clone()),
            Box::new(upstream_request_duration_seconds.clone()),
            Box::new(errors_total.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric can be registered");
        }

        Self {
            inner: Arc::new(Inner {
                registry,
                http_requests_total,
                http_request_duration_seconds,
                http_request_size_bytes,
                http_response_size_bytes,
                cache_hits_total,
                cache_misses_total,
                upstream_requests_total,
                upstream_request_duration_seconds,
                errors_total,
            }),
        }
    }

    /// Record one served HTTP request (called by the middleware).
    fn record_http_request(
        &self,
        method: &str,
        path: &str,
        status: u16,
        duration: Duration,
        request_size: u64,
        response_size: u64,
    ) {
        let status = status.to_string();
        self.inner
            .http_requests_total
            .with_label_values(&[method, path, &status])
            .inc();
        self.inner
            .http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration.as_secs_f64());
        self.inner
            .http_request_size_bytes
            .with_label_values(&[method, path])
            .observe(request_size as f64);
        self.inner
            .http_response_size_bytes
            .with_label_values(&[method, path])
            .observe(response_size as f64);
    }

    /// Record a cache hit for a blob kind (`index`, `version`, `archive`).
    pub fn record_cache_hit(&self, kind: &str) {
        self.inner.cache_hits_total.with_label_values(&[kind]).inc();
    }

    /// Record a cache miss for a blob kind.
    pub fn record_cache_miss(&self, kind: &str) {
        self.inner
            .cache_misses_total
            .with_label_values(&[kind])
            .inc();
    }

    /// Record one upstream request with its response status.
    pub fn record_upstream_request(&self, status: u16, duration: Duration, kind: &str) {
        self.inner
            .upstream_requests_total
            .with_label_values(&[&status.to_string(), kind])
            .inc();
        self.inner
            .upstream_request_duration_seconds
            .with_label_values(&[kind])
            .observe(duration.as_secs_f64());
    }

    /// Record an error in a subsystem.
    pub fn record_error(&self, subsystem: &str, cause: &str) {
        self.inner
            .errors_total
            .with_label_values(&[subsystem, cause])
            .inc();
    }

    /// Gather all metrics and encode to the Prometheus text format.
    pub fn gather_and_encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("text exposition is utf-8"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse a request path into its route template.
///
/// Provider paths carry arbitrary hostnames, namespaces and filenames;
/// recording those verbatim would explode series cardinality.
fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

    match segments.as_slice() {
        ["health"] => "/health".to_owned(),
        ["metrics"] => "/metrics".to_owned(),
        [_, _, _, tail] => {
            let tail = if *tail == "index.json" {
                "index.json"
            } else if tail.ends_with(".json") {
                "{version}.json"
            } else if tail.ends_with(".zip") {
                "{archive}.zip"
            } else {
                "{other}"
            };
            format!("/{{hostname}}/{{namespace}}/{{type}}/{tail}")
        }
        _ => "/{other}".to_owned(),
    }
}

fn content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

/// Middleware recording HTTP request metrics.
///
/// Expects a [`Metrics`] extension on the request; without one this is a
/// pass-through.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let metrics = request.extensions().get::<Metrics>().cloned();
    let method = request.method().to_string();
    let path = normalize_path(request.uri().path());
    let request_size = content_length(request.headers());
    let start = Instant::now();

    let response = next.run(request).await;

    if let Some(metrics) = metrics {
        let response_size = content_length(response.headers());
        metrics.record_http_request(
            &method,
            &path,
            response.status().as_u16(),
            start.elapsed(),
            request_size,
            response_size,
        );
    }

    response
}
