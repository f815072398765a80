// (c) Copyright 2023 Helsing GmbH. All rights reserved.

#![doc = include_str!("../README.md")]

/// Process configuration
pub mod config;
/// Strong content hashing for archives
pub mod digest;
/// Prometheus metrics
pub mod metrics;
/// Cache-or-fetch orchestration
pub mod mirror;
/// HTTP edge
pub mod server;
/// Blob storage backends
pub mod storage;
/// Protocol wire types
pub mod types;
/// Upstream registry client
pub mod upstream;
