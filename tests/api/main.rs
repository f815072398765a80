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

//! End-to-end tests: a real mirror server in front of a stub upstream.

use std::{
    io::Write,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use axum::{
    extract::Path,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use tokio::net::TcpListener;

use provider_mirror::{
    config::Config,
    metrics::Metrics,
    mirror::Mirror,
    server::{self, AppState},
    storage::{AnyStorage, Filesystem},
    upstream::UpstreamClient,
};

/// Public base URL the mirror believes it is reachable under. Rewritten
/// archive URLs must start with this.
const MIRROR_BASE_URL: &str = "http://mirror.example";

struct TestMirror {
    url: String,
    cache: tempfile::TempDir,
}

impl TestMirror {
    fn cache_path(&self, relative: &str) -> std::path::PathBuf {
        self.cache.path().join(relative)
    }
}

async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

async fn spawn_mirror(upstream_base: &str, extra_args: &[&str]) -> TestMirror {
    let cache = tempfile::tempdir().unwrap();

    let mut args = vec!["provider-mirror"];
    args.extend_from_slice(extra_args);
    let mut config = Config::parse_from(args);
    config.upstream_url = upstream_base.parse().unwrap();
    config.cache_dir = cache.path().to_path_buf();
    config.base_url = MIRROR_BASE_URL.to_owned();
    config.max_retries = 1;
    config.upstream_timeout_secs = 5;
    let config = config.validate().unwrap();

    let storage: AnyStorage = Arc::new(Filesystem::open(&config.cache_dir).await.unwrap());
    let metrics = Metrics::new();
    let upstream = UpstreamClient::new(&config, metrics.clone()).unwrap();
    let mirror = Arc::new(Mirror::new(
        storage,
        Arc::new(upstream),
        config.base_url.clone(),
        metrics.clone(),
    ));

    let app = server::router(AppState::new(mirror, metrics), &config);
    let url = serve(app).await;

    TestMirror { url, cache }
}

fn provider_zip() -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    writer
        .start_file(
            "terraform-provider-aws_v5.0.0",
            zip::write::SimpleFileOptions::default(),
        )
        .unwrap();
    writer.write_all(b"provider binary contents").unwrap();
    writer.finish().unwrap().into_inner()
}

/// A stub upstream speaking the mirror protocol for one provider with one
/// version and one platform, plus the archive blob itself.
fn mirror_protocol_stub(stub_base: &str, zip: Vec<u8>) -> Router {
    let archive_url = format!("{stub_base}/files/aws_5.0.0_linux_amd64.zip");

    Router::new()
        .route(
            "/registry.example/hashicorp/aws/index.json",
            get(|| async { Json(serde_json::json!({"versions": {"5.0.0": {}}})) }),
        )
        .route(
            "/registry.example/hashicorp/aws/5.0.0.json",
            get(move || {
                let archive_url = archive_url.clone();
                async move {
                    Json(serde_json::json!({
                        "archives": {
                            "linux_amd64": {"url": archive_url, "hashes": ["zh:abc"]}
                        }
                    }))
                }
            }),
        )
        .route(
            "/files/aws_5.0.0_linux_amd64.zip",
            get(move || {
                let zip = zip.clone();
                async move { zip }
            }),
        )
}

#[tokio::test]
async fn cold_index_is_served_and_cached() {
    let stub = serve(mirror_protocol_stub("http://unused", provider_zip())).await;
    let mirror = spawn_mirror(&stub, &[]).await;

    let response = reqwest::get(format!(
        "{}/registry.example/hashicorp/aws/index.json",
        mirror.url
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/json"
    );
    assert_eq!(
        response.headers()["cache-control"].to_str().unwrap(),
        "public, max-age=300"
    );

    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], br#"{"versions":{"5.0.0":{}}}"#);

    // The exact same bytes are now on disk.
    let cached = tokio::fs::read(mirror.cache_path("registry.example/hashicorp/aws/index.json"))
        .await
        .unwrap();
    assert_eq!(cached, body);
}

/// Serve the mirror-protocol stub with archive urls pointing back at the
/// stub's own address.
async fn spawn_self_referencing_stub(zip: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base = format!("http://{addr}");
    let router = mirror_protocol_stub(&base, zip);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    base
}

#[tokio::test]
async fn cold_manifest_is_rewritten_and_stored_raw() {
    let zip = provider_zip();
    let stub = spawn_self_referencing_stub(zip.clone()).await;
    let mirror = spawn_mirror(&stub, &[]).await;

    let response = reqwest::get(format!(
        "{}/registry.example/hashicorp/aws/5.0.0.json",
        mirror.url
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(
        body["archives"]["linux_amd64"]["url"],
        format!("{MIRROR_BASE_URL}/registry.example/hashicorp/aws/aws_5.0.0_linux_amd64.zip")
    );
    assert_eq!(
        body["archives"]["linux_amd64"]["hashes"],
        serde_json::json!(["zh:abc"])
    );

    // Stored manifest keeps the upstream url.
    let stored: serde_json::Value = serde_json::from_slice(
        &tokio::fs::read(mirror.cache_path("registry.example/hashicorp/aws/5.0.0.json"))
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(
        stored["archives"]["linux_amd64"]["url"],
        format!("{stub}/files/aws_5.0.0_linux_amd64.zip")
    );

    // The reverse mapping sidecar exists before any archive was requested.
    let sidecar = tokio::fs::read_to_string(mirror.cache_path(
        "registry.example/hashicorp/aws/aws_5.0.0_linux_amd64.zip.upstream",
    ))
    .await
    .unwrap();
    assert_eq!(sidecar, format!("{stub}/files/aws_5.0.0_linux_amd64.zip"));

    // Serving the manifest again yields byte-identical output.
    let first = reqwest::get(format!(
        "{}/registry.example/hashicorp/aws/5.0.0.json",
        mirror.url
    ))
    .await
    .unwrap()
    .bytes()
    .await
    .unwrap();
    let second = reqwest::get(format!(
        "{}/registry.example/hashicorp/aws/5.0.0.json",
        mirror.url
    ))
    .await
    .unwrap()
    .bytes()
    .await
    .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn archive_fill_hashes_and_later_manifests_carry_h1() {
    let zip = provider_zip();
    let stub = spawn_self_referencing_stub(zip.clone()).await;
    let mirror = spawn_mirror(&stub, &[]).await;

    // Prime the sidecars through the manifest flow.
    reqwest::get(format!(
        "{}/registry.example/hashicorp/aws/5.0.0.json",
        mirror.url
    ))
    .await
    .unwrap();

    // Download the archive through the mirror.
    let response = reqwest::get(format!(
        "{}/registry.example/hashicorp/aws/aws_5.0.0_linux_amd64.zip",
        mirror.url
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/zip"
    );
    assert_eq!(
        response.headers()["cache-control"].to_str().unwrap(),
        "public, max-age=31536000"
    );
    assert_eq!(
        response.headers()["content-disposition"].to_str().unwrap(),
        "attachment; filename=\"aws_5.0.0_linux_amd64.zip\""
    );
    assert_eq!(
        response.headers()["content-length"]
            .to_str()
            .unwrap()
            .parse::<usize>()
            .unwrap(),
        zip.len()
    );
    assert_eq!(&response.bytes().await.unwrap()[..], &zip[..]);

    // Archive and hash sidecar are cached now.
    let cached = tokio::fs::read(mirror.cache_path(
        "registry.example/hashicorp/aws/aws_5.0.0_linux_amd64.zip",
    ))
    .await
    .unwrap();
    assert_eq!(cached, zip);

    let h1 = tokio::fs::read_to_string(mirror.cache_path(
        "registry.example/hashicorp/aws/aws_5.0.0_linux_amd64.zip.h1",
    ))
    .await
    .unwrap();
    assert!(h1.starts_with("h1:"));

    // The manifest now advertises both hashes.
    let body: serde_json::Value = reqwest::get(format!(
        "{}/registry.example/hashicorp/aws/5.0.0.json",
        mirror.url
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(
        body["archives"]["linux_amd64"]["hashes"],
        serde_json::json!(["zh:abc", h1])
    );
}

#[tokio::test]
async fn registry_dialect_fans_out_platform_probes() {
    // 5 published platforms; the other 3 default probes answer 404.
    let published = ["linux_amd64", "linux_arm64", "darwin_amd64", "darwin_arm64", "windows_amd64"];

    let stub = serve(Router::new().route(
        "/v1/providers/hashicorp/aws/5.0.0/download/{os}/{arch}",
        get(move |Path((os, arch)): Path<(String, String)>| async move {
            let platform = format!("{os}_{arch}");
            if published.contains(&platform.as_str()) {
                let body = serde_json::json!({
                    "download_url": format!("https://origin.example/aws_5.0.0_{platform}.zip"),
                    "shasum": format!("digest-{platform}"),
                });
                (StatusCode::OK, Json(body)).into_response()
            } else {
                StatusCode::NOT_FOUND.into_response()
            }
        }),
    ))
    .await;

    let mirror = spawn_mirror(&stub, &["--upstream-dialect", "registry"]).await;

    let body: serde_json::Value = reqwest::get(format!(
        "{}/registry.terraform.io/hashicorp/aws/5.0.0.json",
        mirror.url
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();

    let archives = body["archives"].as_object().unwrap();
    assert_eq!(archives.len(), published.len());
    for platform in published {
        assert_eq!(
            archives[platform]["hashes"],
            serde_json::json!([format!("zh:digest-{platform}")])
        );
        assert_eq!(
            archives[platform]["url"],
            format!(
                "{MIRROR_BASE_URL}/registry.terraform.io/hashicorp/aws/aws_5.0.0_{platform}.zip"
            )
        );
    }
}

#[tokio::test]
async fn retry_exhaustion_reports_a_server_error_and_writes_nothing() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let stub = serve(Router::new().route(
        "/registry.example/hashicorp/aws/index.json",
        get(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { StatusCode::INTERNAL_SERVER_ERROR }
        }),
    ))
    .await;

    let mirror = spawn_mirror(&stub, &[]).await;

    let response = reqwest::get(format!(
        "{}/registry.example/hashicorp/aws/index.json",
        mirror.url
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), 500);
    assert_eq!(response.text().await.unwrap(), "Internal Server Error");

    // max_retries = 1 in the test config: one attempt plus one retry.
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    // Nothing was cached.
    assert!(
        !tokio::fs::try_exists(mirror.cache_path("registry.example/hashicorp/aws/index.json"))
            .await
            .unwrap()
    );

    // The failure shows up in the metrics.
    let metrics = reqwest::get(format!("{}/metrics", mirror.url))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains(r#"upstream_requests_total{kind="index",status="500"}"#));
    assert!(metrics.contains(r#"subsystem="index_handler""#));
}

#[tokio::test]
async fn missing_upstream_index_is_a_clean_404() {
    let stub = serve(Router::new()).await;
    let mirror = spawn_mirror(&stub, &[]).await;

    let response = reqwest::get(format!(
        "{}/registry.example/hashicorp/aws/index.json",
        mirror.url
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), 404);
    assert!(
        !tokio::fs::try_exists(mirror.cache_path("registry.example/hashicorp/aws/index.json"))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn orphan_archive_request_is_a_404_and_writes_nothing() {
    let stub = serve(Router::new()).await;
    let mirror = spawn_mirror(&stub, &[]).await;

    let response = reqwest::get(format!(
        "{}/registry.example/hashicorp/aws/unknown.zip",
        mirror.url
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), 404);
    assert!(
        !tokio::fs::try_exists(mirror.cache_path("registry.example/hashicorp/aws/unknown.zip"))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn unknown_provider_tails_are_404() {
    let stub = serve(Router::new()).await;
    let mirror = spawn_mirror(&stub, &[]).await;

    let response = reqwest::get(format!(
        "{}/registry.example/hashicorp/aws/whatever.txt",
        mirror.url
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn health_endpoint_answers() {
    let stub = serve(Router::new()).await;
    let mirror = spawn_mirror(&stub, &[]).await;

    let response = reqwest::get(format!("{}/health", mirror.url)).await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), r#"{"status":"ok"}"#);
}

#[tokio::test]
async fn warm_mirror_survives_upstream_going_away() {
    let zip = provider_zip();
    let stub_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stub_addr = stub_listener.local_addr().unwrap();
    let stub_base = format!("http://{stub_addr}");
    let router = mirror_protocol_stub(&stub_base, zip.clone());
    let stub_task = tokio::spawn(async move {
        axum::serve(stub_listener, router).await.unwrap();
    });

    let mirror = spawn_mirror(&stub_base, &[]).await;
    let index_url = format!("{}/registry.example/hashicorp/aws/index.json", mirror.url);
    let manifest_url = format!("{}/registry.example/hashicorp/aws/5.0.0.json", mirror.url);
    let archive_url = format!(
        "{}/registry.example/hashicorp/aws/aws_5.0.0_linux_amd64.zip",
        mirror.url
    );

    // Warm every kind.
    assert_eq!(reqwest::get(&index_url).await.unwrap().status(), 200);
    assert_eq!(reqwest::get(&manifest_url).await.unwrap().status(), 200);
    assert_eq!(reqwest::get(&archive_url).await.unwrap().status(), 200);

    // Kill the upstream; the cache keeps serving.
    stub_task.abort();

    assert_eq!(reqwest::get(&index_url).await.unwrap().status(), 200);
    assert_eq!(reqwest::get(&manifest_url).await.unwrap().status(), 200);
    let response = reqwest::get(&archive_url).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(&response.bytes().await.unwrap()[..], &zip[..]);
}
