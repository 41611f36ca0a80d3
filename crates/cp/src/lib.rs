// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Control plane: worker registry, autoscaler, placement, HTTP API,
//! and the subdomain reverse proxy.

mod api;
mod autoscaler;
mod ingest;
mod placement;
mod pool;
mod proxy;
mod registry;
mod service;

pub use api::{api_router, AppState};
pub use autoscaler::{Autoscaler, AutoscalerOptions};
pub use ingest::IngestListener;
pub use placement::{CreateOutcome, CreateRequest, Placement, PlacementConfig};
pub use pool::WorkerPool;
pub use proxy::parse_sandbox_host;
pub use registry::{Registry, RegistryEntry, RegistryOptions};
pub use service::{ControlPlane, ControlPlaneConfig};
