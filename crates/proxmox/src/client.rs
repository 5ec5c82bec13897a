// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! The reqwest-backed Proxmox VE gateway.

use crate::wire::{
    ApiResponse, GuestListEntry, HaStatusData, PreflightData, ResourceEntry, RrdSample,
    StatusEntry, TicketData,
};
use async_trait::async_trait;
use pvelb_config::{AuthConfig, ProxmoxConfig};
use pvelb_engine::gateway::{
    ClusterStatus, GatewayError, GuestKind, GuestRecord, GuestStatus, HaStatus, Hypervisor,
    NodeRecord, Preflight, ResourceRecord,
};
use reqwest::header::COOKIE;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
const CSRF_HEADER: &str = "CSRFPreventionToken";
const MAX_IDLE_CONNECTIONS_PER_HOST: usize = 2;

#[derive(Debug, Clone)]
struct Ticket {
    cookie: String,
    csrf: String,
}

/// Authenticated client for the Proxmox VE REST API.
///
/// Control calls run with a 30 s timeout. Migration submissions use a
/// separate untimed client: the hypervisor answers them with a task id
/// quickly, but a slow cluster must not turn a submission into a spurious
/// failure.
pub struct ProxmoxClient {
    control: Client,
    submit: Client,
    base_url: String,
    auth: AuthConfig,
    ticket: Mutex<Option<Ticket>>,
}

impl ProxmoxClient {
    /// Builds a client for the configured endpoint. Proxmox clusters
    /// routinely run self-signed certificates, so peer verification is off,
    /// matching the stock API clients.
    pub fn new(config: &ProxmoxConfig) -> Result<Self, GatewayError> {
        Self::with_base_url(
            format!("{}/api2/json", config.url.base_url()),
            config.auth.clone(),
        )
    }

    /// Builds a client against an explicit base URL (tests use this to point
    /// at a mock server).
    pub fn with_base_url(base_url: String, auth: AuthConfig) -> Result<Self, GatewayError> {
        let control = Client::builder()
            .timeout(CONTROL_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS_PER_HOST)
            .build()
            .map_err(|e| GatewayError::Unreachable {
                details: format!("failed to create HTTP client: {e}"),
            })?;
        let submit = Client::builder()
            .danger_accept_invalid_certs(true)
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS_PER_HOST)
            .build()
            .map_err(|e| GatewayError::Unreachable {
                details: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(ProxmoxClient {
            control,
            submit,
            base_url,
            auth,
            ticket: Mutex::new(None),
        })
    }

    /// Authenticates against `/access/ticket` and stores the resulting cookie
    /// and CSRF token for all later calls.
    pub async fn login(&self) -> Result<(), GatewayError> {
        info!("authenticating against the hypervisor API");
        let url = format!("{}/access/ticket", self.base_url);
        let response = self
            .control
            .post(&url)
            .form(&[
                ("username", self.auth.username.as_str()),
                ("password", self.auth.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::Unreachable {
                details: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(GatewayError::Auth {
                details: format!("ticket endpoint answered {}", response.status()),
            });
        }

        let payload: ApiResponse<TicketData> =
            response.json().await.map_err(|e| GatewayError::Decode {
                endpoint: "/access/ticket".to_string(),
                details: e.to_string(),
            })?;
        let mut ticket = self.ticket.lock().expect("ticket lock poisoned");
        *ticket = Some(Ticket {
            cookie: format!("PVEAuthCookie={}", payload.data.ticket),
            csrf: payload.data.csrf_prevention_token,
        });
        info!("authentication successful");
        Ok(())
    }

    fn ticket(&self) -> Result<Ticket, GatewayError> {
        self.ticket
            .lock()
            .expect("ticket lock poisoned")
            .clone()
            .ok_or_else(|| GatewayError::Auth {
                details: "not authenticated, call login first".to_string(),
            })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let ticket = self.ticket()?;
        let url = format!("{}{path}", self.base_url);
        let response = self
            .control
            .get(&url)
            .header(COOKIE, &ticket.cookie)
            .send()
            .await
            .map_err(|e| GatewayError::Unreachable {
                details: e.to_string(),
            })?;
        decode(path, response).await
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        client: &Client,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<T, GatewayError> {
        let ticket = self.ticket()?;
        let url = format!("{}{path}", self.base_url);
        let response = client
            .post(&url)
            .header(COOKIE, &ticket.cookie)
            .header(CSRF_HEADER, &ticket.csrf)
            .form(form)
            .send()
            .await
            .map_err(|e| GatewayError::Unreachable {
                details: e.to_string(),
            })?;
        decode(path, response).await
    }
}

async fn decode<T: DeserializeOwned>(
    path: &str,
    response: Response,
) -> Result<T, GatewayError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(GatewayError::Auth {
            details: format!("`{path}` answered 401, ticket expired or invalid"),
        });
    }
    if !status.is_success() {
        let details = response.text().await.unwrap_or_default();
        return Err(GatewayError::Status {
            endpoint: path.to_string(),
            status: status.as_u16(),
            details,
        });
    }
    let payload: ApiResponse<T> = response.json().await.map_err(|e| GatewayError::Decode {
        endpoint: path.to_string(),
        details: e.to_string(),
    })?;
    Ok(payload.data)
}

fn kind_path(kind: GuestKind) -> &'static str {
    match kind {
        GuestKind::FullVm => "qemu",
        GuestKind::Container => "lxc",
    }
}

#[async_trait]
impl Hypervisor for ProxmoxClient {
    async fn cluster_status(&self) -> Result<ClusterStatus, GatewayError> {
        let entries: Vec<StatusEntry> = self.get_json("/cluster/status").await?;
        entries
            .into_iter()
            .find(|e| e.kind == "cluster")
            .and_then(|e| {
                Some(ClusterStatus {
                    name: e.name?,
                    nodes: e.nodes.unwrap_or(0),
                })
            })
            .ok_or_else(|| GatewayError::Decode {
                endpoint: "/cluster/status".to_string(),
                details: "no entry of type `cluster` in the response".to_string(),
            })
    }

    async fn cluster_resources(&self) -> Result<Vec<ResourceRecord>, GatewayError> {
        let entries: Vec<ResourceEntry> = self.get_json("/cluster/resources").await?;
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.kind.as_str() {
                "node" => {
                    let Some(node_id) = entry.node else { continue };
                    records.push(ResourceRecord::Node(NodeRecord {
                        node_id,
                        online: entry.status.as_deref() == Some("online"),
                        max_cpu: entry.maxcpu.unwrap_or(0),
                        cpu_fraction: entry.cpu.unwrap_or(0.0),
                        max_mem: entry.maxmem.unwrap_or(0),
                        used_mem: entry.mem.unwrap_or(0),
                    }));
                }
                "qemu" | "lxc" => {
                    let (Some(vmid), Some(node_id)) = (entry.vmid, entry.node) else {
                        continue;
                    };
                    let kind = if entry.kind == "lxc" {
                        GuestKind::Container
                    } else {
                        GuestKind::FullVm
                    };
                    records.push(ResourceRecord::Guest(GuestRecord {
                        vmid,
                        kind,
                        node_id,
                        mem: entry.mem.unwrap_or(0),
                        running: entry.status.as_deref() == Some("running"),
                    }));
                }
                // Storage, SDN, and pool entries are irrelevant here.
                _ => {}
            }
        }
        Ok(records)
    }

    async fn ha_status(&self) -> Result<HaStatus, GatewayError> {
        let data: HaStatusData = self.get_json("/cluster/ha/status/manager_status").await?;
        Ok(HaStatus {
            master_node: data.manager_status.master_node,
            quorate: data.quorum.quorate,
        })
    }

    async fn guest_cpu_series(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
    ) -> Result<Vec<f64>, GatewayError> {
        let path = format!(
            "/nodes/{node}/{}/{vmid}/rrddata?timeframe=hour",
            kind_path(kind)
        );
        let samples: Vec<RrdSample> = self.get_json(&path).await?;
        Ok(samples.into_iter().filter_map(|s| s.cpu).collect())
    }

    async fn migration_preflight(
        &self,
        node: &str,
        vmid: u32,
    ) -> Result<Preflight, GatewayError> {
        let path = format!("/nodes/{node}/qemu/{vmid}/migrate");
        let data: PreflightData = self.get_json(&path).await?;
        Ok(Preflight {
            local_disks: !data.local_disks.is_empty(),
            local_resources: !data.local_resources.is_empty(),
        })
    }

    async fn migrate(
        &self,
        donor: &str,
        kind: GuestKind,
        vmid: u32,
        target: &str,
    ) -> Result<String, GatewayError> {
        let path = format!("/nodes/{donor}/{}/{vmid}/migrate", kind_path(kind));
        // Full VMs move live; containers need a restart migration.
        let mode = match kind {
            GuestKind::FullVm => ("online", "1"),
            GuestKind::Container => ("restart", "1"),
        };
        let task_id: String = self
            .post_form(&self.submit, &path, &[("target", target), mode])
            .await?;
        debug!(vmid, %task_id, "migration task submitted");
        Ok(task_id)
    }

    async fn guests_on(
        &self,
        node: &str,
        kind: GuestKind,
    ) -> Result<Vec<GuestStatus>, GatewayError> {
        let path = format!("/nodes/{node}/{}", kind_path(kind));
        let entries: Vec<GuestListEntry> = self.get_json(&path).await?;
        Ok(entries
            .into_iter()
            .map(|e| GuestStatus {
                vmid: e.vmid,
                running: e.status == "running",
            })
            .collect())
    }

    async fn resume(&self, node: &str, vmid: u32) -> Result<(), GatewayError> {
        let path = format!("/nodes/{node}/qemu/{vmid}/status/resume");
        let _: serde_json::Value = self.post_form(&self.submit, &path, &[]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn auth() -> AuthConfig {
        AuthConfig {
            username: "root@pam".to_string(),
            password: "secret".to_string(),
        }
    }

    async fn logged_in_client(server: &MockServer) -> ProxmoxClient {
        Mock::given(method("POST"))
            .and(path("/access/ticket"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"ticket": "tkt", "CSRFPreventionToken": "csrf-token"}
            })))
            .mount(server)
            .await;
        let client =
            ProxmoxClient::with_base_url(server.uri(), auth()).expect("client must build");
        client.login().await.expect("login must succeed");
        client
    }

    #[tokio::test]
    async fn login_posts_credentials_and_stores_the_ticket() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/access/ticket"))
            .and(body_string_contains("username=root%40pam"))
            .and(body_string_contains("password=secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"ticket": "tkt", "CSRFPreventionToken": "csrf-token"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cluster/status"))
            .and(header("Cookie", "PVEAuthCookie=tkt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"type": "cluster", "name": "prod", "nodes": 3}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            ProxmoxClient::with_base_url(server.uri(), auth()).expect("client must build");
        client.login().await.expect("login must succeed");
        let status = client.cluster_status().await.expect("status must succeed");
        assert_eq!(status.name, "prod");
        assert_eq!(status.nodes, 3);
    }

    #[tokio::test]
    async fn rejected_login_is_an_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/access/ticket"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client =
            ProxmoxClient::with_base_url(server.uri(), auth()).expect("client must build");
        let err = client.login().await.expect_err("login must fail");
        assert!(matches!(err, GatewayError::Auth { .. }));
    }

    #[tokio::test]
    async fn calls_before_login_are_refused() {
        let server = MockServer::start().await;
        let client =
            ProxmoxClient::with_base_url(server.uri(), auth()).expect("client must build");
        let err = client
            .cluster_status()
            .await
            .expect_err("unauthenticated call must fail");
        assert!(matches!(err, GatewayError::Auth { .. }));
    }

    #[tokio::test]
    async fn resources_map_nodes_and_guests_and_skip_storage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cluster/resources"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"type": "node", "node": "pve1", "status": "online",
                     "maxcpu": 16, "cpu": 0.25, "maxmem": 1000, "mem": 400},
                    {"type": "node", "node": "pve2", "status": "offline",
                     "maxcpu": 16, "cpu": 0.0, "maxmem": 1000, "mem": 0},
                    {"type": "qemu", "node": "pve1", "vmid": 100,
                     "status": "running", "mem": 200},
                    {"type": "lxc", "node": "pve1", "vmid": "200",
                     "status": "stopped", "mem": 50},
                    {"type": "storage", "storage": "local"}
                ]
            })))
            .mount(&server)
            .await;

        let client = logged_in_client(&server).await;
        let records = client
            .cluster_resources()
            .await
            .expect("resources must succeed");
        assert_eq!(records.len(), 4);

        let nodes: Vec<&NodeRecord> = records
            .iter()
            .filter_map(|r| match r {
                ResourceRecord::Node(n) => Some(n),
                ResourceRecord::Guest(_) => None,
            })
            .collect();
        assert_eq!(nodes.len(), 2);
        assert!(nodes[0].online);
        assert!(!nodes[1].online);

        let guests: Vec<&GuestRecord> = records
            .iter()
            .filter_map(|r| match r {
                ResourceRecord::Guest(g) => Some(g),
                ResourceRecord::Node(_) => None,
            })
            .collect();
        assert_eq!(guests.len(), 2);
        assert_eq!(guests[0].kind, GuestKind::FullVm);
        assert!(guests[0].running);
        assert_eq!(guests[1].vmid, 200);
        assert_eq!(guests[1].kind, GuestKind::Container);
        assert!(!guests[1].running);
    }

    #[tokio::test]
    async fn ha_status_decodes_the_stringly_quorate_flag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cluster/ha/status/manager_status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "manager_status": {"master_node": "pve1"},
                    "quorum": {"quorate": "1"}
                }
            })))
            .mount(&server)
            .await;

        let client = logged_in_client(&server).await;
        let ha = client.ha_status().await.expect("ha status must succeed");
        assert_eq!(ha.master_node, "pve1");
        assert!(ha.quorate);
    }

    #[tokio::test]
    async fn cpu_series_drops_rows_without_samples() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodes/pve1/qemu/100/rrddata"))
            .and(query_param("timeframe", "hour"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"time": 1, "cpu": 0.1},
                    {"time": 2},
                    {"time": 3, "cpu": 0.3}
                ]
            })))
            .mount(&server)
            .await;

        let client = logged_in_client(&server).await;
        let series = client
            .guest_cpu_series("pve1", GuestKind::FullVm, 100)
            .await
            .expect("series must succeed");
        assert_eq!(series, vec![0.1, 0.3]);
    }

    #[tokio::test]
    async fn container_series_uses_the_lxc_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodes/pve1/lxc/200/rrddata"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .expect(1)
            .mount(&server)
            .await;

        let client = logged_in_client(&server).await;
        let series = client
            .guest_cpu_series("pve1", GuestKind::Container, 200)
            .await
            .expect("series must succeed");
        assert!(series.is_empty());
    }

    #[tokio::test]
    async fn preflight_reports_local_disks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodes/pve1/qemu/100/migrate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"local_disks": [{"volid": "local:100/disk.qcow2"}],
                         "local_resources": []}
            })))
            .mount(&server)
            .await;

        let client = logged_in_client(&server).await;
        let preflight = client
            .migration_preflight("pve1", 100)
            .await
            .expect("preflight must succeed");
        assert!(preflight.local_disks);
        assert!(!preflight.local_resources);
        assert!(preflight.blocked());
    }

    #[tokio::test]
    async fn vm_migration_posts_online_with_csrf() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/nodes/pve1/qemu/100/migrate"))
            .and(header("CSRFPreventionToken", "csrf-token"))
            .and(header("Cookie", "PVEAuthCookie=tkt"))
            .and(body_string_contains("target=pve2"))
            .and(body_string_contains("online=1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": "UPID:pve1:000b:migrate"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = logged_in_client(&server).await;
        let task_id = client
            .migrate("pve1", GuestKind::FullVm, 100, "pve2")
            .await
            .expect("migrate must succeed");
        assert_eq!(task_id, "UPID:pve1:000b:migrate");
    }

    #[tokio::test]
    async fn container_migration_posts_restart_on_the_lxc_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/nodes/pve1/lxc/200/migrate"))
            .and(body_string_contains("restart=1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": "UPID:pve1:000c:migrate"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = logged_in_client(&server).await;
        let task_id = client
            .migrate("pve1", GuestKind::Container, 200, "pve2")
            .await
            .expect("migrate must succeed");
        assert!(task_id.starts_with("UPID:"));
    }

    #[tokio::test]
    async fn failed_submission_surfaces_the_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/nodes/pve1/qemu/100/migrate"))
            .respond_with(ResponseTemplate::new(500).set_body_string("migration aborted"))
            .mount(&server)
            .await;

        let client = logged_in_client(&server).await;
        let err = client
            .migrate("pve1", GuestKind::FullVm, 100, "pve2")
            .await
            .expect_err("migrate must fail");
        assert!(matches!(
            err,
            GatewayError::Status { status: 500, .. }
        ));
    }

    #[tokio::test]
    async fn guest_list_reports_running_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodes/pve2/qemu"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"vmid": 100, "status": "running"},
                    {"vmid": "101", "status": "stopped"}
                ]
            })))
            .mount(&server)
            .await;

        let client = logged_in_client(&server).await;
        let guests = client
            .guests_on("pve2", GuestKind::FullVm)
            .await
            .expect("guest list must succeed");
        assert_eq!(guests.len(), 2);
        assert!(guests[0].running);
        assert_eq!(guests[1].vmid, 101);
        assert!(!guests[1].running);
    }

    #[tokio::test]
    async fn resume_posts_to_the_status_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/nodes/pve2/qemu/100/status/resume"))
            .and(header("CSRFPreventionToken", "csrf-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": null})))
            .expect(1)
            .mount(&server)
            .await;

        let client = logged_in_client(&server).await;
        client
            .resume("pve2", 100)
            .await
            .expect("resume must succeed");
    }

    #[tokio::test]
    async fn expired_ticket_maps_to_an_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cluster/status"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = logged_in_client(&server).await;
        let err = client
            .cluster_status()
            .await
            .expect_err("expired ticket must fail");
        assert!(matches!(err, GatewayError::Auth { .. }));
    }
}
