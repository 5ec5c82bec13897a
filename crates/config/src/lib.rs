// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! Configuration model for the pvelb cluster balancer.
//!
//! The configuration is a single hierarchical YAML document. It is
//! deserialized into the typed model below, then validated once at startup;
//! all violations are collected and reported together. Nothing downstream of
//! [`Config::from_yaml_file`] ever re-reads or re-parses configuration.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

pub mod error;

pub use error::Error;

/// A two-state switch serialized as `ON` / `OFF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Toggle {
    /// The option is enabled.
    #[serde(rename = "ON")]
    On,
    /// The option is disabled.
    #[default]
    #[serde(rename = "OFF")]
    Off,
}

impl Toggle {
    /// Returns `true` when the switch is `ON`.
    #[must_use]
    pub fn is_on(self) -> bool {
        matches!(self, Toggle::On)
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Hypervisor connection settings.
    pub proxmox: ProxmoxConfig,
    /// Balancing trigger parameters.
    pub parameters: Parameters,
    /// Nodes and guests that must never take part in balancing.
    #[serde(default)]
    pub exclusions: Exclusions,
    /// Named partitions of node ids. Migrations never cross groups; nodes
    /// absent from every group form the implicit no-group bucket.
    #[serde(default)]
    pub groups: HashMap<String, Vec<String>>,
    /// Deviation weights and risk thresholds.
    pub balancing: BalancingConfig,
    /// Operator notification settings.
    #[serde(default)]
    pub mail: MailConfig,
    /// Log filter passed to the logging sink (e.g. `INFO`, `DEBUG`).
    #[serde(default = "default_logging_level")]
    pub logging_level: String,
}

fn default_logging_level() -> String {
    "INFO".to_string()
}

/// Hypervisor connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxmoxConfig {
    /// API endpoint address.
    pub url: EndpointConfig,
    /// API credentials, posted verbatim to the ticket endpoint.
    pub auth: AuthConfig,
}

/// Address and port of the REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Host name or IP address of the API endpoint.
    pub ip: String,
    /// TCP port of the API endpoint.
    pub port: u16,
}

impl EndpointConfig {
    /// The base URL of the REST API.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.ip, self.port)
    }
}

/// API credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// User name, including the realm suffix (e.g. `root@pam`).
    pub username: String,
    /// Password for the user.
    pub password: String,
}

/// Balancing trigger parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameters {
    /// Allowed deviation in percent. The operational threshold is this value
    /// divided by 200 (half of a percent fraction).
    pub deviation: f64,
    /// Cluster memory load warning bound, in percent.
    pub threshold: f64,
    /// Whether containers are candidates for migration.
    #[serde(default)]
    pub lxc_migration: Toggle,
    /// Ceiling in seconds on the post-submit migration poll. `0` polls
    /// without bound.
    #[serde(default)]
    pub migration_timeout: u64,
    /// When `ON`, only the cluster master executes migrations.
    #[serde(default)]
    pub only_on_master: Toggle,
    /// When `ON`, candidate migrations are logged but never submitted.
    #[serde(default)]
    pub test_mode: Toggle,
}

impl Parameters {
    /// The steady operational deviation threshold (`deviation / 200`).
    #[must_use]
    pub fn configured_deviation(&self) -> f64 {
        self.deviation / 200.0
    }

    /// The cluster memory load warning bound as a fraction (`threshold / 100`).
    #[must_use]
    pub fn threshold_fraction(&self) -> f64 {
        self.threshold / 100.0
    }
}

/// A guest exclusion entry: a single id, a numeric string, or an inclusive
/// `"low-high"` range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GuestSelector {
    /// A single guest id.
    Id(u32),
    /// A numeric string or an inclusive `"low-high"` range.
    Text(String),
}

impl GuestSelector {
    /// Expands the selector into the guest ids it covers.
    pub fn expand(&self) -> Result<Vec<u32>, Error> {
        match self {
            GuestSelector::Id(id) => Ok(vec![*id]),
            GuestSelector::Text(text) => {
                if let Some((low, high)) = text.split_once('-') {
                    let low: u32 = low.trim().parse().map_err(|_| invalid_exclusion(text))?;
                    let high: u32 = high.trim().parse().map_err(|_| invalid_exclusion(text))?;
                    if low > high {
                        return Err(Error::InvalidExclusion {
                            entry: text.clone(),
                            details: "range lower bound exceeds upper bound".to_string(),
                        });
                    }
                    Ok((low..=high).collect())
                } else {
                    text.trim()
                        .parse()
                        .map(|id| vec![id])
                        .map_err(|_| invalid_exclusion(text))
                }
            }
        }
    }
}

fn invalid_exclusion(entry: &str) -> Error {
    Error::InvalidExclusion {
        entry: entry.to_string(),
        details: "expected an integer or an inclusive `low-high` range".to_string(),
    }
}

/// Nodes and guests excluded from balancing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Exclusions {
    /// Guest exclusion entries as written in the configuration.
    #[serde(default)]
    pub vms: Vec<GuestSelector>,
    /// Node ids excluded from balancing.
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl Exclusions {
    /// Normalizes the guest entries into a flat, ordered id set.
    pub fn guest_ids(&self) -> Result<BTreeSet<u32>, Error> {
        let mut ids = BTreeSet::new();
        for selector in &self.vms {
            ids.extend(selector.expand()?);
        }
        Ok(ids)
    }
}

/// Deviation weights and risk thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancingConfig {
    /// Weight of the RAM term in the node deviation.
    pub weight_ram: f64,
    /// Weight of the CPU term in the node deviation.
    pub weight_cpu: f64,
    /// Per-node and cluster-wide OOM risk bound, in percent.
    pub memory_oom_threshold: f64,
    /// Per-node and cluster-wide CPU risk bound, in percent.
    pub cpu_threshold: f64,
}

/// Operator notification settings. Delivery itself is an external
/// collaborator; this section only feeds its contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailConfig {
    /// Master switch for notifications.
    #[serde(default)]
    pub sending: Toggle,
    /// Subject line for notification messages.
    #[serde(default)]
    pub message_subject: String,
    /// Sender address.
    #[serde(default)]
    pub from: String,
    /// Recipient address.
    #[serde(default)]
    pub to: String,
    /// SMTP login.
    #[serde(default)]
    pub login: String,
    /// SMTP password.
    #[serde(default)]
    pub password: String,
    /// SMTP server endpoint.
    #[serde(default)]
    pub server: MailServerConfig,
    /// Whether to negotiate STARTTLS before authenticating.
    #[serde(default)]
    pub ssl_tls: Toggle,
}

/// SMTP server endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailServerConfig {
    /// Server host name or address.
    #[serde(default)]
    pub address: String,
    /// Server port.
    #[serde(default)]
    pub port: u16,
}

impl Config {
    /// Creates a new [`Config`] from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let config: Config =
            serde_yaml::from_str(yaml).map_err(|e| Error::DeserializationError {
                details: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a [`Config`] from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(&path).map_err(|e| Error::FileReadError {
            path: path.as_ref().display().to_string(),
            details: e.to_string(),
        })?;
        Self::from_yaml(&contents)
    }

    /// Validates the configuration, collecting every violation.
    pub fn validate(&self) -> Result<(), Error> {
        let mut errors = Vec::new();

        if self.proxmox.url.ip.is_empty() {
            errors.push(Error::MissingOption {
                option: "proxmox.url.ip".to_string(),
                context: "to reach the hypervisor API".to_string(),
            });
        }
        if self.proxmox.auth.username.is_empty() {
            errors.push(Error::MissingOption {
                option: "proxmox.auth.username".to_string(),
                context: "to authenticate against the hypervisor API".to_string(),
            });
        }

        check_percent(&mut errors, "parameters.deviation", self.parameters.deviation);
        check_percent(&mut errors, "parameters.threshold", self.parameters.threshold);
        check_percent(
            &mut errors,
            "balancing.memory_oom_threshold",
            self.balancing.memory_oom_threshold,
        );
        check_percent(&mut errors, "balancing.cpu_threshold", self.balancing.cpu_threshold);

        for (option, weight) in [
            ("balancing.weight_ram", self.balancing.weight_ram),
            ("balancing.weight_cpu", self.balancing.weight_cpu),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                errors.push(Error::OutOfRange {
                    option: option.to_string(),
                    value: weight,
                    expected: "a non-negative number".to_string(),
                });
            }
        }

        if let Err(e) = self.exclusions.guest_ids() {
            errors.push(e);
        }

        let mut node_to_group: HashMap<&str, &str> = HashMap::new();
        for (group, nodes) in &self.groups {
            for node in nodes {
                if let Some(first) = node_to_group.insert(node, group) {
                    if first != group.as_str() {
                        errors.push(Error::AmbiguousGroup {
                            node: node.clone(),
                            first: first.to_string(),
                            second: group.clone(),
                        });
                    }
                }
            }
        }

        if self.mail.sending.is_on() {
            for (option, value) in [
                ("mail.from", &self.mail.from),
                ("mail.to", &self.mail.to),
                ("mail.server.address", &self.mail.server.address),
            ] {
                if value.is_empty() {
                    errors.push(Error::MissingOption {
                        option: option.to_string(),
                        context: "when mail.sending is ON".to_string(),
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfiguration { errors })
        }
    }

    /// The group a node belongs to, if any. Nodes without a group share the
    /// implicit no-group bucket represented by `None`.
    #[must_use]
    pub fn group_of(&self, node: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|(_, nodes)| nodes.iter().any(|n| n == node))
            .map(|(name, _)| name.as_str())
    }
}

fn check_percent(errors: &mut Vec<Error>, option: &str, value: f64) {
    if !value.is_finite() || value <= 0.0 || value > 100.0 {
        errors.push(Error::OutOfRange {
            option: option.to_string(),
            value,
            expected: "a percentage in (0, 100]".to_string(),
        });
    }
}
