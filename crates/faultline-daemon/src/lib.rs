// Copyright (c) 2026 Faultline Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod cache;
pub mod config;
pub mod criteria;
pub mod experiment;
pub mod monitor;
pub mod refresher;
pub mod server;
pub mod snapshot;
pub mod store;
pub mod telemetry;
