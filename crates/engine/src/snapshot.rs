// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! The in-memory cluster snapshot.
//!
//! A snapshot is built fresh at the start of every control-loop iteration,
//! enriched in place by the trend sampler and the imbalance detector, consumed
//! by the planner, and discarded at the end of the iteration. Relations are
//! modeled by ids and maps; nothing here holds a reference cycle.

use crate::error::Error;
use crate::gateway::{GuestKind, Hypervisor, ResourceRecord};
use pvelb_config::{Config, Parameters};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Static balancing rules derived from the configuration once per process:
/// exclusion sets and the node-to-group mapping.
#[derive(Debug, Clone, Default)]
pub struct ClusterRules {
    /// Node ids that never participate in balancing.
    pub excluded_nodes: BTreeSet<String>,
    /// Guest ids that never participate in balancing.
    pub excluded_guests: BTreeSet<u32>,
    /// Node id to group name. Nodes absent here form the implicit no-group
    /// bucket.
    pub node_groups: HashMap<String, String>,
}

impl ClusterRules {
    /// Normalizes the configuration's exclusion and group sections.
    pub fn from_config(config: &Config) -> Result<Self, pvelb_config::Error> {
        let mut node_groups = HashMap::new();
        for (group, nodes) in &config.groups {
            for node in nodes {
                let _ = node_groups.insert(node.clone(), group.clone());
            }
        }
        Ok(ClusterRules {
            excluded_nodes: config.exclusions.nodes.iter().cloned().collect(),
            excluded_guests: config.exclusions.guest_ids()?,
            node_groups,
        })
    }

    /// The group of a node, or `None` for the implicit no-group bucket.
    #[must_use]
    pub fn group_of(&self, node_id: &str) -> Option<&str> {
        self.node_groups.get(node_id).map(String::as_str)
    }
}

/// One cluster member node with its derived load figures.
#[derive(Debug, Clone)]
pub struct Node {
    /// The node id.
    pub node_id: String,
    /// Total CPU cores.
    pub max_cpu: u32,
    /// Total memory in bytes.
    pub max_mem: u64,
    /// Instantaneous CPU use as a fraction in [0, 1].
    pub cpu_fraction: f64,
    /// Used memory in bytes.
    pub used_mem: u64,
    /// Cores in use: `max_cpu * cpu_fraction`.
    pub cpu_used: f64,
    /// Memory headroom in bytes.
    pub free_mem: u64,
    /// Memory load as a fraction in [0, 1].
    pub mem_load: f64,
    /// Whether this node is the HA master.
    pub is_master: bool,
    /// Whether the node is online and reports sane capacities.
    pub online: bool,
    /// The group the node belongs to, if any.
    pub group: Option<String>,
    /// Composite deviation from the cluster means, written by the imbalance
    /// detector each iteration.
    pub deviation: f64,
}

impl Node {
    /// Instantaneous CPU load as a fraction (`cpu_used / max_cpu`).
    #[must_use]
    pub fn cpu_load(&self) -> f64 {
        if self.max_cpu == 0 {
            0.0
        } else {
            self.cpu_used / f64::from(self.max_cpu)
        }
    }
}

/// One guest workload.
#[derive(Debug, Clone)]
pub struct Guest {
    /// The cluster-unique guest id.
    pub vmid: u32,
    /// Full virtual machine or container.
    pub kind: GuestKind,
    /// The node currently hosting the guest.
    pub node_id: String,
    /// Memory reserved/used per the hypervisor report, in bytes.
    pub mem: u64,
    /// Whether the guest reports `running` status.
    pub running: bool,
    /// Hourly average CPU fraction, written by the trend sampler. Zero until
    /// the sampler has run in the current iteration.
    pub cpu_trend: f64,
}

/// A consistent view of the cluster at one instant.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// The cluster name.
    pub cluster_name: String,
    /// The node currently acting as HA master.
    pub master_node: String,
    /// Whether the cluster holds quorum.
    pub quorate: bool,
    /// Every node from the inventory, offline nodes included for reporting.
    pub nodes: BTreeMap<String, Node>,
    /// Every guest from the inventory, keyed by vmid.
    pub guests: BTreeMap<u32, Guest>,
    /// Ids of nodes that participate in balancing.
    pub included_nodes: BTreeSet<String>,
    /// Ids of guests that participate in balancing.
    pub included_guests: BTreeSet<u32>,
    /// Total memory over online nodes, in bytes.
    pub cl_max_mem: u64,
    /// Used memory over online nodes, in bytes.
    pub cl_used_mem: u64,
    /// Whole-cluster memory load fraction.
    pub mem_load: f64,
    /// Memory load fraction over included nodes only.
    pub mem_load_included: f64,
    /// Total cores over online nodes.
    pub cl_max_cpu: u32,
    /// Whole-cluster CPU load fraction.
    pub cl_cpu_load: f64,
    /// CPU load fraction over included nodes only.
    pub cl_cpu_load_included: f64,
}

impl Snapshot {
    /// Builds a fresh snapshot from the hypervisor's current inventory.
    ///
    /// Failure to fetch any ingredient is fatal for the iteration. A
    /// non-quorate cluster is reported with a warning; execution is refused
    /// later, at the control-loop level.
    pub async fn build(
        hypervisor: &dyn Hypervisor,
        rules: &ClusterRules,
    ) -> Result<Self, Error> {
        let status = hypervisor
            .cluster_status()
            .await
            .map_err(|source| Error::SnapshotUnavailable { source })?;
        let resources = hypervisor
            .cluster_resources()
            .await
            .map_err(|source| Error::SnapshotUnavailable { source })?;
        let ha = hypervisor
            .ha_status()
            .await
            .map_err(|source| Error::SnapshotUnavailable { source })?;

        if !ha.quorate {
            warn!("cluster quorum is not reached");
        }

        let mut nodes = BTreeMap::new();
        let mut guests = BTreeMap::new();

        for record in resources {
            match record {
                ResourceRecord::Node(raw) => {
                    // A node advertising zero capacity cannot host anything;
                    // treat it like an offline node.
                    let online = raw.online && raw.max_mem > 0 && raw.max_cpu > 0;
                    if raw.online && !online {
                        warn!(
                            node = %raw.node_id,
                            "node reports zero capacity, treating as offline"
                        );
                    }
                    let mem_load = if raw.max_mem == 0 {
                        0.0
                    } else {
                        raw.used_mem as f64 / raw.max_mem as f64
                    };
                    let node = Node {
                        cpu_used: f64::from(raw.max_cpu) * raw.cpu_fraction,
                        free_mem: raw.max_mem.saturating_sub(raw.used_mem),
                        mem_load,
                        is_master: raw.node_id == ha.master_node,
                        online,
                        group: rules.group_of(&raw.node_id).map(str::to_string),
                        deviation: 0.0,
                        node_id: raw.node_id,
                        max_cpu: raw.max_cpu,
                        max_mem: raw.max_mem,
                        cpu_fraction: raw.cpu_fraction,
                        used_mem: raw.used_mem,
                    };
                    let _ = nodes.insert(node.node_id.clone(), node);
                }
                ResourceRecord::Guest(raw) => {
                    let guest = Guest {
                        vmid: raw.vmid,
                        kind: raw.kind,
                        node_id: raw.node_id,
                        mem: raw.mem,
                        running: raw.running,
                        cpu_trend: 0.0,
                    };
                    let _ = guests.insert(guest.vmid, guest);
                }
            }
        }

        let included_nodes: BTreeSet<String> = nodes
            .values()
            .filter(|n| n.online && !rules.excluded_nodes.contains(&n.node_id))
            .map(|n| n.node_id.clone())
            .collect();

        let included_guests: BTreeSet<u32> = guests
            .values()
            .filter(|g| {
                g.running
                    && included_nodes.contains(&g.node_id)
                    && !rules.excluded_guests.contains(&g.vmid)
            })
            .map(|g| g.vmid)
            .collect();

        let mut snapshot = Snapshot {
            cluster_name: status.name,
            master_node: ha.master_node,
            quorate: ha.quorate,
            nodes,
            guests,
            included_nodes,
            included_guests,
            cl_max_mem: 0,
            cl_used_mem: 0,
            mem_load: 0.0,
            mem_load_included: 0.0,
            cl_max_cpu: 0,
            cl_cpu_load: 0.0,
            cl_cpu_load_included: 0.0,
        };
        snapshot.compute_aggregates();

        debug!(
            cluster = %snapshot.cluster_name,
            nodes = snapshot.nodes.len(),
            included_nodes = snapshot.included_nodes.len(),
            guests = snapshot.guests.len(),
            included_guests = snapshot.included_guests.len(),
            "snapshot built"
        );
        Ok(snapshot)
    }

    /// Derives every aggregate field from the node records. Must run after
    /// all node records are populated and before any aggregate is read.
    fn compute_aggregates(&mut self) {
        let mut max_mem_included: u64 = 0;
        let mut used_mem_included: u64 = 0;
        let mut max_cpu_included: u32 = 0;
        let mut cpu_used_included: f64 = 0.0;
        let mut max_mem: u64 = 0;
        let mut used_mem: u64 = 0;
        let mut max_cpu: u32 = 0;
        let mut cpu_used: f64 = 0.0;

        for node in self.nodes.values().filter(|n| n.online) {
            max_mem += node.max_mem;
            used_mem += node.used_mem;
            max_cpu += node.max_cpu;
            cpu_used += node.cpu_used;
            if self.included_nodes.contains(&node.node_id) {
                max_mem_included += node.max_mem;
                used_mem_included += node.used_mem;
                max_cpu_included += node.max_cpu;
                cpu_used_included += node.cpu_used;
            }
        }

        self.cl_max_mem = max_mem;
        self.cl_used_mem = used_mem;
        self.mem_load = ratio(used_mem as f64, max_mem as f64);
        self.mem_load_included = ratio(used_mem_included as f64, max_mem_included as f64);
        self.cl_max_cpu = max_cpu;
        self.cl_cpu_load = ratio(cpu_used, f64::from(max_cpu));
        self.cl_cpu_load_included = ratio(cpu_used_included, f64::from(max_cpu_included));
    }

    /// The included nodes, in id order.
    pub fn included_node_iter(&self) -> impl Iterator<Item = &Node> {
        self.included_nodes
            .iter()
            .filter_map(|id| self.nodes.get(id))
    }

    /// The included guests currently hosted on `node_id`, in vmid order.
    pub fn included_guests_on(&self, node_id: &str) -> impl Iterator<Item = &Guest> {
        self.included_guests
            .iter()
            .filter_map(|vmid| self.guests.get(vmid))
            .filter(move |g| g.node_id == node_id)
    }

    /// Sum of the stored deviations over included nodes.
    #[must_use]
    pub fn sum_of_deviations(&self) -> f64 {
        self.included_node_iter().map(|n| n.deviation).sum()
    }

    /// Checks that the snapshot is valid for balancing: at least two included
    /// nodes and a cluster memory load strictly inside (0, 1). Logs a warning
    /// when the load is at or above the configured threshold.
    pub fn verify_cluster_load(&self, parameters: &Parameters) -> Result<(), Error> {
        if self.included_nodes.len() < 2 {
            return Err(Error::NotEnoughNodes {
                included: self.included_nodes.len(),
            });
        }
        if !(self.mem_load_included > 0.0 && self.mem_load_included < 1.0) {
            return Err(Error::InvalidClusterLoad {
                mem_load: self.mem_load_included,
            });
        }
        if self.mem_load_included >= parameters.threshold_fraction() {
            warn!(
                mem_load = self.mem_load_included,
                threshold = parameters.threshold_fraction(),
                "cluster memory load near threshold, balancing may be needed"
            );
        }
        Ok(())
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 { 0.0 } else { num / den }
}
