// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the engine crate.

use crate::gateway::GatewayError;

/// Errors that can terminate an iteration or the whole process.
///
/// Transient conditions (empty trend series, a skipped candidate) never reach
/// this enum; they degrade in place as described on the component that
/// tolerates them.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A snapshot ingredient (status, resources, HA state) could not be
    /// fetched. Fatal for the iteration.
    #[error("cluster snapshot unavailable: {source}")]
    SnapshotUnavailable {
        /// The gateway failure that prevented the snapshot.
        #[source]
        source: GatewayError,
    },

    /// Fewer than two nodes are included; balancing is impossible.
    #[error("only {included} node(s) included, balancing not possible")]
    NotEnoughNodes {
        /// The number of included nodes found.
        included: usize,
    },

    /// The cluster memory load is outside (0, 1); the snapshot is not valid
    /// for balancing.
    #[error("cluster memory load {mem_load} is outside (0, 1)")]
    InvalidClusterLoad {
        /// The offending included-only memory load.
        mem_load: f64,
    },

    /// The migration batch accumulated more failures than allowed.
    #[error("too many migration failures, affected guests: {guests:?}")]
    TooManyMigrationFailures {
        /// The guests whose migrations failed.
        guests: Vec<u32>,
    },

    /// A migrated guest appeared on the recipient but is not running.
    #[error("guest {vmid} is present on {recipient} but not running after migration")]
    MigrationBadState {
        /// The migrated guest.
        vmid: u32,
        /// The recipient node.
        recipient: String,
    },

    /// The recipient's guest list could not be read while a migration was in
    /// flight; the guest's state is unknown.
    #[error("cannot verify guest {vmid} after migration: {source}")]
    PostMigrationCheckFailed {
        /// The guest whose state is unknown.
        vmid: u32,
        /// The gateway failure hit while polling.
        #[source]
        source: GatewayError,
    },

    /// The migration poll exceeded the operator-configured ceiling.
    #[error("migration of guest {vmid} still not settled after {elapsed_secs}s")]
    MigrationPollTimeout {
        /// The guest being migrated.
        vmid: u32,
        /// Seconds spent polling.
        elapsed_secs: u64,
    },
}
