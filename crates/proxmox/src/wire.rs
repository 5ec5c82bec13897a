// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! Wire-level payloads of the Proxmox VE API.
//!
//! The API is loose about scalar types: booleans may arrive as `"1"`, `1`, or
//! `true`, and guest ids may arrive as numbers or strings depending on the
//! endpoint. The deserializers here absorb that so the client code does not
//! have to.

use serde::{Deserialize, Deserializer};

/// Every endpoint wraps its payload in `{ "data": ... }`.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiResponse<T> {
    pub data: T,
}

/// Payload of `POST /access/ticket`.
#[derive(Debug, Deserialize)]
pub(crate) struct TicketData {
    pub ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    pub csrf_prevention_token: String,
}

/// One entry of `GET /cluster/status`.
#[derive(Debug, Deserialize)]
pub(crate) struct StatusEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub nodes: Option<u32>,
}

/// One entry of `GET /cluster/resources`. Fields are optional because node
/// and guest entries populate different subsets.
#[derive(Debug, Deserialize)]
pub(crate) struct ResourceEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default, deserialize_with = "opt_flexible_u32")]
    pub vmid: Option<u32>,
    #[serde(default)]
    pub maxcpu: Option<u32>,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub maxmem: Option<u64>,
    #[serde(default)]
    pub mem: Option<u64>,
}

/// Payload of `GET /cluster/ha/status/manager_status`.
#[derive(Debug, Deserialize)]
pub(crate) struct HaStatusData {
    pub manager_status: ManagerStatus,
    pub quorum: Quorum,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ManagerStatus {
    pub master_node: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Quorum {
    #[serde(deserialize_with = "flexible_bool")]
    pub quorate: bool,
}

/// One sample of `GET /nodes/{node}/{qemu|lxc}/{vmid}/rrddata`. Gaps in the
/// series arrive as rows without a `cpu` value.
#[derive(Debug, Deserialize)]
pub(crate) struct RrdSample {
    #[serde(default)]
    pub cpu: Option<f64>,
}

/// Payload of `GET /nodes/{node}/qemu/{vmid}/migrate`.
#[derive(Debug, Deserialize)]
pub(crate) struct PreflightData {
    #[serde(default)]
    pub local_disks: Vec<serde_json::Value>,
    #[serde(default)]
    pub local_resources: Vec<serde_json::Value>,
}

/// One entry of `GET /nodes/{node}/{qemu|lxc}`.
#[derive(Debug, Deserialize)]
pub(crate) struct GuestListEntry {
    #[serde(deserialize_with = "flexible_u32")]
    pub vmid: u32,
    pub status: String,
}

/// Accepts `true`/`false`, `0`/`1`, and `"0"`/`"1"`.
fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Num(i64),
        Text(String),
    }
    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Num(n) => Ok(n != 0),
        Flag::Text(s) => Ok(s == "1" || s.eq_ignore_ascii_case("true")),
    }
}

/// Accepts a number or a numeric string.
fn flexible_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Num(u32),
        Text(String),
    }
    match Id::deserialize(deserializer)? {
        Id::Num(n) => Ok(n),
        Id::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn opt_flexible_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "flexible_u32")] u32);
    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
}
