// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Worker: owns the container runtime on one host.
//!
//! The [`Router`] multiplexes sandbox operations with per-sandbox
//! serialization and rolling timeouts; the [`Hibernator`] moves
//! sandboxes to and from checkpointed form; the heartbeat publisher
//! keeps the control plane's registry current; the RPC listener serves
//! lifecycle calls from the control plane.

mod config;
mod heartbeat;
mod hibernate;
mod router;
mod rpc;
mod service;
mod tap;

pub use config::WorkerConfig;
pub use heartbeat::{HeartbeatPublisher, HeartbeatSink, LocalSink, WireSink};
pub use hibernate::{HibernateResult, Hibernator};
pub use router::{KillReason, Router, RouterEvents, RouterOptions};
pub use service::Worker;
pub use tap::TapSlots;
