// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Driving the cloud control plane through the `openstack` client.
//!
//! Every resource created here is returned wrapped in a guard that deletes
//! it when dropped, so a scenario cleans up after itself in reverse order of
//! creation whether it passes, fails or panics.

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use remote_capture::config::CloudConfig;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::warn;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_secs(3);

struct Inner {
    cfg: CloudConfig,
    log: Logger,
}

/// A handle on the control plane. Cheap to clone.
#[derive(Clone)]
pub struct Cloud {
    inner: Arc<Inner>,
}

impl Cloud {
    pub fn new(cfg: CloudConfig, log: &Logger) -> Self {
        let log = log.new(slog::o!("component" => "cloud"));
        Self { inner: Arc::new(Inner { cfg, log }) }
    }

    pub fn config(&self) -> &CloudConfig {
        &self.inner.cfg
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.inner.cfg.openstack);
        if let Some(cloud) = &self.inner.cfg.cloud {
            cmd.args(["--os-cloud", cloud]);
        }
        cmd.args(args);
        cmd
    }

    /// Run a client command for its side effect.
    pub fn run(&self, args: &[&str]) -> Result<String> {
        debug!(self.inner.log, "openstack"; "args" => ?args);
        let out = self.command(args).output().with_context(|| {
            format!("running {}", self.inner.cfg.openstack.display())
        })?;

        if !out.status.success() {
            bail!(
                "openstack {} failed ({}): {}",
                args.join(" "),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    /// Run a client command and decode its JSON output.
    pub fn json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let mut args = args.to_vec();
        args.extend(["-f", "json"]);
        let text = self.run(&args)?;
        serde_json::from_str(&text).with_context(|| {
            format!("decoding output of openstack {}", args.join(" "))
        })
    }

    fn guard(
        &self,
        kind: &'static str,
        id: &str,
        delete: &[&str],
    ) -> Resource {
        let mut delete: Vec<String> =
            delete.iter().map(|s| s.to_string()).collect();
        delete.push(id.to_string());
        Resource { cloud: self.clone(), kind, id: id.to_string(), delete }
    }

    pub fn create_network(&self, name: &str) -> Result<Network> {
        let net: NetworkInfo = self.json(&["network", "create", name])?;
        info!(self.inner.log, "created network";
            "name" => name,
            "id" => &net.id,
            "segmentation_id" => ?net.segmentation_id
        );
        let guard = self.guard("network", &net.id, &["network", "delete"]);
        Ok(Network { info: net, _guard: guard })
    }

    pub fn show_network(&self, id: &str) -> Result<NetworkInfo> {
        self.json(&["network", "show", id])
    }

    pub fn create_subnet(
        &self,
        network: &Network,
        name: &str,
        cidr: &str,
    ) -> Result<Subnet> {
        let created: Created = self.json(&[
            "subnet",
            "create",
            name,
            "--network",
            network.info.id.as_str(),
            "--subnet-range",
            cidr,
        ])?;
        let guard = self.guard("subnet", &created.id, &["subnet", "delete"]);
        Ok(Subnet { id: created.id, cidr: cidr.to_string(), _guard: guard })
    }

    /// Create a router with its gateway on the external network.
    pub fn create_router(&self, name: &str) -> Result<Router> {
        let created: Created = self.json(&["router", "create", name])?;
        let guard = self.guard("router", &created.id, &["router", "delete"]);
        self.run(&[
            "router",
            "set",
            created.id.as_str(),
            "--external-gateway",
            self.inner.cfg.external_network.as_str(),
        ])?;
        Ok(Router { id: created.id, _guard: guard })
    }

    pub fn router_add_subnet(
        &self,
        router: &Router,
        subnet: &Subnet,
    ) -> Result<RouterInterface> {
        self.run(&[
            "router",
            "add",
            "subnet",
            router.id.as_str(),
            subnet.id.as_str(),
        ])?;
        let guard = Resource {
            cloud: self.clone(),
            kind: "router interface",
            id: format!("{}/{}", router.id, subnet.id),
            delete: vec![
                "router".into(),
                "remove".into(),
                "subnet".into(),
                router.id.clone(),
                subnet.id.clone(),
            ],
        };
        Ok(RouterInterface { _guard: guard })
    }

    /// Create a key pair, keeping the private half for logging into
    /// instances.
    pub fn create_keypair(&self, name: &str) -> Result<Keypair> {
        let kp: KeypairInfo = self.json(&["keypair", "create", name])?;
        let private_key = kp
            .private_key
            .ok_or_else(|| anyhow!("keypair {name} has no private key"))?;
        let guard = self.guard("keypair", name, &["keypair", "delete"]);
        Ok(Keypair { name: name.to_string(), private_key, _guard: guard })
    }

    /// Create a security group admitting SSH and ICMP.
    pub fn create_sec_group_for_ssh(
        &self,
        name: &str,
    ) -> Result<SecurityGroup> {
        let created: Created =
            self.json(&["security", "group", "create", name])?;
        let guard = self.guard(
            "security group",
            &created.id,
            &["security", "group", "delete"],
        );
        for rule in [
            &["--protocol", "tcp", "--dst-port", "22"][..],
            &["--protocol", "icmp"][..],
        ] {
            let mut args =
                vec!["security", "group", "rule", "create", "--ingress"];
            args.extend_from_slice(rule);
            args.push(created.id.as_str());
            self.run(&args)?;
        }
        Ok(SecurityGroup { id: created.id, _guard: guard })
    }

    /// Create a flavor with extra properties, e.g. `hw:mem_page_size=2048`.
    pub fn create_flavor(
        &self,
        name: &str,
        ram_mb: u64,
        vcpus: u32,
        disk_gb: u32,
        properties: &[(&str, &str)],
    ) -> Result<Flavor> {
        let (ram, vcpus, disk) =
            (ram_mb.to_string(), vcpus.to_string(), disk_gb.to_string());
        let props: Vec<String> =
            properties.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut args = vec![
            "flavor",
            "create",
            name,
            "--ram",
            ram.as_str(),
            "--vcpus",
            vcpus.as_str(),
            "--disk",
            disk.as_str(),
        ];
        for p in &props {
            args.extend(["--property", p.as_str()]);
        }

        let created: Created = self.json(&args)?;
        let guard = self.guard("flavor", &created.id, &["flavor", "delete"]);
        Ok(Flavor { id: created.id, ram_mb, _guard: guard })
    }

    /// Create a host aggregate with `property` set and `hosts` in it.
    pub fn create_aggregate(
        &self,
        name: &str,
        property: (&str, &str),
        hosts: &[String],
    ) -> Result<Aggregate> {
        let prop = format!("{}={}", property.0, property.1);
        let created: CreatedNumeric = self.json(&[
            "aggregate",
            "create",
            name,
            "--property",
            prop.as_str(),
        ])?;
        let mut agg = Aggregate {
            cloud: self.clone(),
            id: created.id.to_string(),
            hosts: vec![],
        };
        for host in hosts {
            let args =
                ["aggregate", "add", "host", agg.id.as_str(), host.as_str()];
            self.run(&args)?;
            agg.hosts.push(host.clone());
        }
        Ok(agg)
    }

    /// Boot a server and wait for it to become active.
    pub fn create_server(&self, req: &ServerRequest) -> Result<Server> {
        let nic = format!("net-id={}", req.network_id);
        let flavor = req.flavor.unwrap_or(self.inner.cfg.flavor.as_str());
        let mut args = vec![
            "server",
            "create",
            req.name,
            "--image",
            self.inner.cfg.image.as_str(),
            "--flavor",
            flavor,
            "--key-name",
            req.key_name,
            "--security-group",
            req.security_group,
            "--nic",
            nic.as_str(),
        ];
        if let Some(zone) = &req.availability_zone {
            args.extend(["--availability-zone", zone.as_str()]);
        }

        let created: Created = self.json(&args)?;
        let guard = self.guard(
            "server",
            &created.id,
            &["server", "delete", "--wait"],
        );
        let server = Server {
            id: created.id,
            name: req.name.to_string(),
            _guard: guard,
        };
        self.wait_for_status(&server, "ACTIVE")?;
        Ok(server)
    }

    pub fn show_server(&self, server: &Server) -> Result<ServerInfo> {
        self.json(&["server", "show", server.id.as_str()])
    }

    /// Poll until `server` reaches `status`. A server in `ERROR` fails
    /// immediately.
    pub fn wait_for_status(
        &self,
        server: &Server,
        status: &str,
    ) -> Result<ServerInfo> {
        let timeout = Duration::from_secs(self.inner.cfg.server_timeout_secs);
        let start = Instant::now();
        loop {
            let info = self.show_server(server)?;
            if info.status == status {
                info!(self.inner.log, "server ready";
                    "name" => &server.name,
                    "status" => &info.status,
                    "host" => ?info.host
                );
                return Ok(info);
            }
            if info.status == "ERROR" {
                bail!("server {} went to ERROR", server.name);
            }
            if start.elapsed() > timeout {
                bail!(
                    "server {} still {} after {timeout:?} waiting for {status}",
                    server.name,
                    info.status
                );
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Cold migrate `server` and confirm the move.
    pub fn migrate(&self, server: &Server) -> Result<ServerInfo> {
        self.run(&["server", "migrate", server.id.as_str()])?;
        self.wait_for_status(server, "VERIFY_RESIZE")?;
        self.run(&["server", "resize", "confirm", server.id.as_str()])?;
        self.wait_for_status(server, "ACTIVE")
    }

    /// Hosts of the L3 agents serving `router`.
    pub fn l3_agent_hosts(&self, router: &Router) -> Result<Vec<String>> {
        let agents: Vec<Agent> = self.json(&[
            "network",
            "agent",
            "list",
            "--router",
            router.id.as_str(),
        ])?;
        Ok(agents.into_iter().map(|a| a.host).collect())
    }

    /// Hosts of the DHCP agents serving `network`.
    pub fn dhcp_agent_hosts(&self, network: &Network) -> Result<Vec<String>> {
        let agents: Vec<Agent> = self.json(&[
            "network",
            "agent",
            "list",
            "--agent-type",
            "dhcp",
            "--network",
            network.info.id.as_str(),
        ])?;
        Ok(agents.into_iter().map(|a| a.host).collect())
    }

    /// Enabled, running compute hosts of availability zone `zone`.
    pub fn compute_hosts(&self, zone: &str) -> Result<Vec<String>> {
        let services: Vec<ComputeService> = self.json(&[
            "compute",
            "service",
            "list",
            "--service",
            "nova-compute",
        ])?;
        Ok(services
            .into_iter()
            .filter(|s| s.zone == zone)
            .filter(|s| s.state == "up" && s.status == "enabled")
            .map(|s| s.host)
            .collect())
    }
}

/// A control plane object deleted on drop.
pub struct Resource {
    cloud: Cloud,
    kind: &'static str,
    id: String,
    delete: Vec<String>,
}

impl Resource {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        let log = &self.cloud.inner.log;
        if self.cloud.inner.cfg.keep_resources {
            info!(log, "keeping resource";
                "kind" => self.kind,
                "id" => &self.id
            );
            return;
        }

        let args: Vec<&str> = self.delete.iter().map(String::as_str).collect();
        match self.cloud.run(&args) {
            Ok(_) => {
                debug!(log, "deleted"; "kind" => self.kind, "id" => &self.id)
            }
            Err(e) => warn!(log, "failed to delete resource";
                "kind" => self.kind,
                "id" => &self.id,
                "error" => %e
            ),
        }
    }
}

#[derive(Deserialize)]
struct Created {
    id: String,
}

#[derive(Deserialize)]
struct CreatedNumeric {
    id: u64,
}

#[derive(Deserialize)]
struct KeypairInfo {
    #[serde(default)]
    private_key: Option<String>,
}

#[derive(Deserialize)]
struct Agent {
    #[serde(rename = "Host")]
    host: String,
}

#[derive(Deserialize)]
struct ComputeService {
    #[serde(rename = "Host")]
    host: String,
    #[serde(rename = "Zone")]
    zone: String,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "State")]
    state: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
    #[serde(
        rename = "provider:network_type",
        alias = "provider_network_type",
        default
    )]
    pub network_type: Option<String>,
    #[serde(
        rename = "provider:segmentation_id",
        alias = "provider_segmentation_id",
        default
    )]
    pub segmentation_id: Option<u32>,
}

pub struct Network {
    pub info: NetworkInfo,
    _guard: Resource,
}

impl Network {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// The network's VXLAN VNI.
    pub fn vni(&self) -> Result<tunnel_api::Vni> {
        let id = self.info.segmentation_id.ok_or_else(|| {
            anyhow!("network {} has no segmentation id", self.info.name)
        })?;
        tunnel_api::Vni::new(id).map_err(|e| anyhow!(e))
    }
}

pub struct Subnet {
    pub id: String,
    pub cidr: String,
    _guard: Resource,
}

pub struct Router {
    pub id: String,
    _guard: Resource,
}

pub struct RouterInterface {
    _guard: Resource,
}

pub struct Keypair {
    pub name: String,
    pub private_key: String,
    _guard: Resource,
}

pub struct SecurityGroup {
    pub id: String,
    _guard: Resource,
}

pub struct Flavor {
    pub id: String,
    pub ram_mb: u64,
    _guard: Resource,
}

/// A host aggregate. Its hosts are removed before it is deleted.
pub struct Aggregate {
    cloud: Cloud,
    pub id: String,
    pub hosts: Vec<String>,
}

impl Drop for Aggregate {
    fn drop(&mut self) {
        if self.cloud.inner.cfg.keep_resources {
            return;
        }

        for host in &self.hosts {
            let id = self.id.as_str();
            let args = ["aggregate", "remove", "host", id, host.as_str()];
            if let Err(e) = self.cloud.run(&args) {
                warn!(self.cloud.inner.log, "failed to remove aggregate host";
                    "host" => host,
                    "error" => %e
                );
            }
        }
        let args = ["aggregate", "delete", self.id.as_str()];
        if let Err(e) = self.cloud.run(&args) {
            warn!(self.cloud.inner.log, "failed to delete aggregate";
                "id" => &self.id,
                "error" => %e
            );
        }
    }
}

pub struct ServerRequest<'a> {
    pub name: &'a str,
    pub network_id: &'a str,
    pub key_name: &'a str,
    pub security_group: &'a str,
    pub flavor: Option<&'a str>,
    /// `zone:host` to pin the server to a host.
    pub availability_zone: Option<String>,
}

pub struct Server {
    pub id: String,
    pub name: String,
    _guard: Resource,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerInfo {
    pub status: String,
    #[serde(rename = "OS-EXT-SRV-ATTR:host", default)]
    pub host: Option<String>,
    #[serde(rename = "OS-EXT-SRV-ATTR:instance_name", default)]
    pub instance_name: Option<String>,
    #[serde(default)]
    pub addresses: serde_json::Value,
}

impl ServerInfo {
    pub fn host(&self) -> Result<&str> {
        self.host.as_deref().ok_or_else(|| anyhow!("server has no host"))
    }

    pub fn instance_name(&self) -> Result<&str> {
        self.instance_name
            .as_deref()
            .ok_or_else(|| anyhow!("server has no libvirt instance name"))
    }

    /// Addresses by network name. Older clients print `net=ip, ip; net2=ip`
    /// where newer ones print a map of lists.
    pub fn addresses(&self) -> Vec<(String, String)> {
        match &self.addresses {
            serde_json::Value::Object(map) => map
                .iter()
                .flat_map(|(net, ips)| {
                    let ips = match ips {
                        serde_json::Value::Array(ips) => ips
                            .iter()
                            .filter_map(|ip| ip.as_str().map(String::from))
                            .collect(),
                        serde_json::Value::String(ip) => vec![ip.clone()],
                        _ => vec![],
                    };
                    ips.into_iter().map(move |ip| (net.clone(), ip))
                })
                .collect(),

            serde_json::Value::String(s) => s
                .split(';')
                .filter_map(|part| part.split_once('='))
                .flat_map(|(net, ips)| {
                    ips.split(',')
                        .map(str::trim)
                        .filter(|ip| !ip.is_empty())
                        .map(move |ip| (net.trim().to_string(), ip.to_string()))
                })
                .collect(),

            _ => vec![],
        }
    }

    /// The first IPv4 address the server holds.
    pub fn fixed_ip(&self) -> Result<std::net::Ipv4Addr> {
        self.addresses()
            .into_iter()
            .find_map(|(_, ip)| ip.parse().ok())
            .ok_or_else(|| anyhow!("server has no IPv4 address"))
    }
}
