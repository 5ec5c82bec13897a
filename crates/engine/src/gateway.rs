// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! The hypervisor gateway contract.
//!
//! The engine talks to the control plane exclusively through the
//! [`Hypervisor`] trait. URLs, authentication cookies, and JSON decoding are
//! the implementor's concern; the engine only sees the wire-neutral records
//! defined here.

use async_trait::async_trait;

/// The kind of a guest workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestKind {
    /// A full virtual machine.
    FullVm,
    /// A system container.
    Container,
}

/// Cluster identity as reported by the cluster status endpoint.
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    /// The cluster name.
    pub name: String,
    /// The number of member nodes the cluster reports.
    pub nodes: u32,
}

/// HA manager view of the cluster.
#[derive(Debug, Clone)]
pub struct HaStatus {
    /// The node currently acting as HA master.
    pub master_node: String,
    /// Whether the cluster holds quorum.
    pub quorate: bool,
}

/// One entry of the cluster resource inventory.
#[derive(Debug, Clone)]
pub enum ResourceRecord {
    /// A cluster member node.
    Node(NodeRecord),
    /// A guest workload.
    Guest(GuestRecord),
}

/// Raw node attributes from the resource inventory.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    /// The node id.
    pub node_id: String,
    /// Whether the node reports `online` status.
    pub online: bool,
    /// Total CPU cores.
    pub max_cpu: u32,
    /// Instantaneous CPU use as a fraction in [0, 1].
    pub cpu_fraction: f64,
    /// Total memory in bytes.
    pub max_mem: u64,
    /// Used memory in bytes.
    pub used_mem: u64,
}

/// Raw guest attributes from the resource inventory.
#[derive(Debug, Clone)]
pub struct GuestRecord {
    /// The cluster-unique guest id.
    pub vmid: u32,
    /// Full virtual machine or container.
    pub kind: GuestKind,
    /// The node currently hosting the guest.
    pub node_id: String,
    /// Memory reserved/used by the guest, in bytes.
    pub mem: u64,
    /// Whether the guest reports `running` status.
    pub running: bool,
}

/// Result of the pre-migration query for a full virtual machine.
#[derive(Debug, Clone, Default)]
pub struct Preflight {
    /// The guest has disks on node-local storage.
    pub local_disks: bool,
    /// The guest has pinned node-local resources.
    pub local_resources: bool,
}

impl Preflight {
    /// Whether anything pins the guest to its current node.
    #[must_use]
    pub fn blocked(&self) -> bool {
        self.local_disks || self.local_resources
    }
}

/// Status of one guest on a node, as reported by the per-node guest list.
#[derive(Debug, Clone)]
pub struct GuestStatus {
    /// The guest id.
    pub vmid: u32,
    /// Whether the guest reports `running` status.
    pub running: bool,
}

/// Errors surfaced by a [`Hypervisor`] implementation.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    /// The control plane could not be reached at all.
    #[error("hypervisor unreachable: {details}")]
    Unreachable {
        /// A description of the connection failure.
        details: String,
    },

    /// The ticket endpoint rejected the credentials.
    #[error("authentication failed: {details}")]
    Auth {
        /// A description of the rejection.
        details: String,
    },

    /// An endpoint answered with a non-success status.
    #[error("`{endpoint}` answered {status}: {details}")]
    Status {
        /// The endpoint path that failed.
        endpoint: String,
        /// The HTTP status code.
        status: u16,
        /// The response body, if any.
        details: String,
    },

    /// An endpoint answered with a payload the gateway could not decode.
    #[error("`{endpoint}` returned an undecodable payload: {details}")]
    Decode {
        /// The endpoint path that failed.
        endpoint: String,
        /// A description of the decoding failure.
        details: String,
    },
}

/// The REST surface the engine consumes, one method per endpoint.
///
/// Implementations own authentication state; every method is expected to be
/// safe to call repeatedly within one control-loop iteration.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Cluster identity (`/cluster/status`, entries of type `cluster`).
    async fn cluster_status(&self) -> Result<ClusterStatus, GatewayError>;

    /// Full resource inventory (`/cluster/resources`).
    async fn cluster_resources(&self) -> Result<Vec<ResourceRecord>, GatewayError>;

    /// HA manager status (`/cluster/ha/status/manager_status`).
    async fn ha_status(&self) -> Result<HaStatus, GatewayError>;

    /// Hourly CPU fraction series for one guest
    /// (`/nodes/{node}/{qemu|lxc}/{vmid}/rrddata?timeframe=hour`).
    /// Missing samples are dropped by the implementation.
    async fn guest_cpu_series(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
    ) -> Result<Vec<f64>, GatewayError>;

    /// Pre-migration check for a full virtual machine
    /// (`GET /nodes/{node}/qemu/{vmid}/migrate`).
    async fn migration_preflight(&self, node: &str, vmid: u32)
    -> Result<Preflight, GatewayError>;

    /// Submits a live migration (`POST /nodes/{donor}/{qemu|lxc}/{vmid}/migrate`
    /// with `online=1` for full VMs, `restart=1` for containers). Returns the
    /// hypervisor task id.
    async fn migrate(
        &self,
        donor: &str,
        kind: GuestKind,
        vmid: u32,
        target: &str,
    ) -> Result<String, GatewayError>;

    /// Lists the guests of one kind present on a node
    /// (`GET /nodes/{node}/{qemu|lxc}`).
    async fn guests_on(&self, node: &str, kind: GuestKind)
    -> Result<Vec<GuestStatus>, GatewayError>;

    /// Resumes a full virtual machine after migration
    /// (`POST /nodes/{node}/qemu/{vmid}/status/resume`).
    async fn resume(&self, node: &str, vmid: u32) -> Result<(), GatewayError>;
}
