// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! Proxmox VE REST gateway for the pvelb cluster balancer.
//!
//! Implements the engine's [`pvelb_engine::gateway::Hypervisor`] contract on
//! top of the Proxmox `api2/json` surface: cookie/CSRF authentication, the
//! cluster inventory and HA endpoints, RRD time series, and the migration
//! endpoints.

mod client;
mod wire;

pub use client::ProxmoxClient;
