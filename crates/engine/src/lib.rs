// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! The pvelb balancing decision engine.
//!
//! The engine observes per-host RAM and CPU utilization through a hypervisor
//! gateway, detects imbalance or resource-exhaustion risk, selects
//! single-guest live migrations within group constraints, and drives them
//! through a migrate → poll → resume state machine. It runs as a persistent
//! single-threaded control loop; see [`controller::Balancer`].
//!
//! Everything the engine knows about the outside world goes through two
//! traits: [`gateway::Hypervisor`] (the REST control plane) and
//! [`notify::Notifier`] (operator notifications). Both are implemented
//! elsewhere; this crate only reasons about snapshots, deviations, and moves.

pub mod context;
pub mod controller;
pub mod detect;
pub mod error;
pub mod execute;
pub mod gateway;
pub mod notify;
pub mod plan;
pub mod risk;
pub mod snapshot;
pub mod testing;
pub mod trend;

pub use context::EngineContext;
pub use controller::{Balancer, IterationOutcome};
pub use error::Error;
pub use gateway::{GatewayError, GuestKind, Hypervisor};
pub use notify::{LogNotifier, Notifier};
pub use snapshot::{ClusterRules, Snapshot};
