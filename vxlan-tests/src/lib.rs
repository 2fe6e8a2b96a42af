// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Orchestration for overlay network scenarios run against a deployed cloud.
//!
//! A [`Harness`] is built from the suite configuration and bundles what a
//! scenario needs: the node inventory, SSH access to nodes, the control
//! plane client, and packet capture.

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use rand::Rng;
use remote_capture::artifact::CaptureArtifact;
use remote_capture::capture::with_capture;
use remote_capture::config::Config;
use remote_capture::config::TraceConfig;
use remote_capture::env::Environment;
use remote_capture::env::Node;
use remote_capture::hugepages;
use remote_capture::hugepages::NumaHugePages;
use remote_capture::ovs;
use remote_capture::ovs::VswitchState;
use remote_capture::remote::ExecOutput;
use remote_capture::remote::Remote;
use remote_capture::remote::RemoteCmd;
use remote_capture::remote::RemoteError;
use remote_capture::remote::SshRemote;
use remote_capture::trace::TraceQuery;
use slog::Logger;
use slog::info;
use slog::warn;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

pub mod cloud;

pub use cloud::Cloud;
pub use cloud::Keypair;
pub use cloud::Network;
pub use cloud::Router;
pub use cloud::RouterInterface;
pub use cloud::SecurityGroup;
pub use cloud::Server;
pub use cloud::ServerRequest;
pub use cloud::Subnet;

/// The availability zone scenarios place servers in.
pub const ZONE: &str = "nova";

/// Return early from a scenario, with a log line, when the deployment lacks
/// a capability the scenario depends on.
#[macro_export]
macro_rules! skip_unless {
    ($harness:expr, $cond:expr, $what:expr) => {
        if !$cond {
            slog::warn!($harness.log, "skipping scenario";
                "requirement" => $what
            );
            return Ok(());
        }
    };
}

/// A resource name unlikely to collide with a concurrent run.
pub fn unique_name(prefix: &str) -> String {
    let suffix: u32 = rand::rng().random_range(0..0x100_0000);
    format!("{prefix}-{suffix:06x}")
}

/// Call `f` every `interval` until it returns true or `timeout` passes.
/// Returns the last answer.
pub fn poll_until<F>(
    timeout: Duration,
    interval: Duration,
    mut f: F,
) -> Result<bool>
where
    F: FnMut() -> Result<bool>,
{
    let start = Instant::now();
    loop {
        if f()? {
            return Ok(true);
        }
        if start.elapsed() >= timeout {
            return Ok(false);
        }
        std::thread::sleep(interval);
    }
}

/// The access every scenario instance is booted with.
pub struct Fixture {
    pub sec_group: SecurityGroup,
    pub key: Keypair,
}

/// A tenant network with one subnet, optionally attached to a router.
///
/// Fields drop in order, so the router interface goes before the subnet and
/// the subnet before the network.
pub struct Segment {
    pub interface: Option<RouterInterface>,
    pub subnet: Subnet,
    pub network: Network,
}

/// A trace query over the decoder `cfg` names. Fails when the decoder is
/// not installed, so a scenario that inspects traffic cannot pass without
/// it.
pub fn trace_query(cfg: &TraceConfig, log: &Logger) -> Result<TraceQuery> {
    let tshark = cfg.decoder().context("tool missing")?;
    tshark.ensure_installed().context("tool missing")?;
    Ok(TraceQuery::new(tshark, log))
}

/// A file written to a node, removed again when dropped.
pub struct RemoteFile<'a> {
    remote: &'a dyn Remote,
    host: String,
    path: String,
    log: Logger,
}

impl<'a> RemoteFile<'a> {
    /// Write `contents` to `path` on `host`, readable only by its owner.
    pub fn create(
        remote: &'a dyn Remote,
        host: &str,
        path: &str,
        contents: &str,
        log: &Logger,
    ) -> Result<Self> {
        let cmd = RemoteCmd::new("sh")
            .arg("-c")
            .arg("umask 077; printf '%s\\n' \"$1\" > \"$2\"")
            .args(["sh", contents, path]);

        // Guard before writing so a partial write is removed as well.
        let file = Self {
            remote,
            host: host.to_string(),
            path: path.to_string(),
            log: log.clone(),
        };
        remote.execute(host, &cmd)?.check(host, &cmd)?;
        Ok(file)
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for RemoteFile<'_> {
    fn drop(&mut self) {
        let cmd = RemoteCmd::new("rm").args(["-f", self.path.as_str()]);
        let res = self
            .remote
            .execute(&self.host, &cmd)
            .and_then(|out| out.check(&self.host, &cmd).map(|_| ()));
        if let Err(e) = res {
            warn!(self.log, "failed to remove remote file";
                "host" => &self.host,
                "path" => &self.path,
                "error" => %e
            );
        }
    }
}

pub struct Harness {
    pub cfg: Config,
    pub log: Logger,
    pub remote: Arc<SshRemote>,
    pub cloud: Cloud,
    pub env: Environment,
    scratch: tempfile::TempDir,
}

impl Harness {
    /// Build a harness from the file named by `VXLAN_TESTS_CONFIG`.
    pub fn new() -> Result<Self> {
        let cfg = Config::from_env()?;
        let log = remote_capture::log::init();
        let remote = Arc::new(SshRemote::new(cfg.ssh.clone(), &log));
        let cloud = Cloud::new(cfg.cloud.clone(), &log);
        let env = cfg.environment.clone();
        let scratch =
            tempfile::Builder::new().prefix("vxlan-tests").tempdir()?;
        info!(log, "harness ready";
            "nodes" => env.nodes.len(),
            "segmentation" => ?env.segmentation,
            "artifacts" => %scratch.path().display()
        );
        Ok(Self { cfg, log, remote, cloud, env, scratch })
    }

    /// A trace query over the configured decoder.
    pub fn trace(&self) -> Result<TraceQuery> {
        trace_query(&self.cfg.trace, &self.log)
    }

    /// Where a capture named `name` is retrieved to.
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.scratch.path().join(format!("{name}.pcap"))
    }

    pub fn fixture(&self) -> Result<Fixture> {
        let sec_group =
            self.cloud.create_sec_group_for_ssh(&unique_name("ssh"))?;
        let key = self.cloud.create_keypair(&unique_name("instancekey"))?;
        Ok(Fixture { sec_group, key })
    }

    /// Create network `name` with subnet `cidr`, attached to `router` when
    /// one is given.
    pub fn segment(
        &self,
        name: &str,
        cidr: &str,
        router: Option<&Router>,
    ) -> Result<Segment> {
        let network = self.cloud.create_network(&unique_name(name))?;
        let subnet = self.cloud.create_subnet(
            &network,
            &format!("{}__subnet", network.info.name),
            cidr,
        )?;
        let interface = match router {
            Some(router) => {
                Some(self.cloud.router_add_subnet(router, &subnet)?)
            }
            None => None,
        };
        Ok(Segment { interface, subnet, network })
    }

    /// Boot a server on `segment`, pinned to compute `host` when one is
    /// given.
    pub fn boot(
        &self,
        name: &str,
        segment: &Segment,
        fixture: &Fixture,
        host: Option<&str>,
        flavor: Option<&str>,
    ) -> Result<Server> {
        self.cloud.create_server(&ServerRequest {
            name: &unique_name(name),
            network_id: segment.network.id(),
            key_name: &fixture.key.name,
            security_group: &fixture.sec_group.id,
            flavor,
            availability_zone: host.map(|h| format!("{ZONE}:{h}")),
        })
    }

    /// The node the control plane calls `host`.
    pub fn node(&self, host: &str) -> Result<&Node> {
        Ok(self.env.find_node_by_fqdn(host)?)
    }

    /// Run `body` while capturing tunnel traffic on `node`.
    pub fn capture<T, F>(
        &self,
        node: &Node,
        name: &str,
        body: F,
    ) -> Result<(T, CaptureArtifact)>
    where
        F: FnOnce() -> Result<T>,
    {
        with_capture(
            self.remote.clone(),
            &node.ip,
            &self.cfg.capture,
            &self.artifact_path(name),
            &self.log,
            body,
        )
    }

    pub fn ovs(&self, node: &Node) -> Result<VswitchState> {
        Ok(ovs::show(self.remote.as_ref(), &node.ip)?)
    }

    pub fn huge_pages(
        &self,
        node: &Node,
        size_kb: u64,
    ) -> Result<NumaHugePages> {
        Ok(hugepages::read(self.remote.as_ref(), &node.ip, size_kb)?)
    }

    /// The huge page size backing `server`, read from libvirt on its
    /// hypervisor.
    pub fn instance_page_size_kb(&self, server: &Server) -> Result<u64> {
        let info = self.cloud.show_server(server)?;
        let node = self.node(info.host()?)?;
        Ok(hugepages::instance_page_size_kb(
            self.remote.as_ref(),
            &node.ip,
            info.instance_name()?,
        )?)
    }

    /// Ping `ip` from inside the namespace of `router`, on a node hosting
    /// one of its L3 agents.
    pub fn router_ping(&self, router: &Router, ip: Ipv4Addr) -> Result<()> {
        let hosts = self.cloud.l3_agent_hosts(router)?;
        let host = hosts
            .first()
            .ok_or_else(|| anyhow!("router {} has no L3 agent", router.id))?;
        let node = self.node(host)?;

        let cmd = RemoteCmd::new("ip")
            .args(["netns", "exec"])
            .arg(format!("qrouter-{}", router.id))
            .args(["ping", "-c", "3"])
            .arg(ip);
        let out = self.remote.execute(&node.ip, &cmd)?;
        out.check(&node.ip, &cmd)?;
        Ok(())
    }

    /// Run `cmd` in `server` over SSH, from the DHCP namespace of `network`
    /// on a node hosting one of its DHCP agents. Retries while the guest is
    /// still booting.
    pub fn run_on_vm(
        &self,
        server: &Server,
        network: &Network,
        key: &Keypair,
        cmd: &str,
    ) -> Result<ExecOutput> {
        let hosts = self.cloud.dhcp_agent_hosts(network)?;
        let host = hosts.first().ok_or_else(|| {
            anyhow!("network {} has no DHCP agent", network.info.name)
        })?;
        let node = self.node(host)?;
        let ip = self.cloud.show_server(server)?.fixed_ip()?;

        let key_file = RemoteFile::create(
            self.remote.as_ref(),
            &node.ip,
            &format!("/tmp/{}.pem", unique_name(&key.name)),
            &key.private_key,
            &self.log,
        )?;

        let ssh = RemoteCmd::new("ip")
            .args(["netns", "exec"])
            .arg(format!("qdhcp-{}", network.id()))
            .args(["ssh", "-i", key_file.path()])
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "ConnectTimeout=10"])
            .arg(format!("{}@{ip}", self.cloud.config().vm_user))
            .arg(cmd);

        let timeout =
            Duration::from_secs(self.cloud.config().server_timeout_secs);
        let start = Instant::now();
        loop {
            match self.remote.execute(&node.ip, &ssh) {
                Ok(out) => return Ok(out),
                // ssh into the guest failed, most likely still booting
                Err(RemoteError::Connect { .. })
                    if start.elapsed() < timeout =>
                {
                    std::thread::sleep(Duration::from_secs(5));
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("running `{cmd}` on {}", server.name)
                    });
                }
            }
        }
    }

    /// Ping `ip` from `server`; at least one reply must come back.
    pub fn ping_from_vm(
        &self,
        server: &Server,
        network: &Network,
        key: &Keypair,
        ip: Ipv4Addr,
    ) -> Result<()> {
        let out =
            self.run_on_vm(server, network, key, &format!("ping -c 3 {ip}"))?;
        if !out.success() {
            bail!(
                "{} could not ping {ip}:\n{}{}",
                server.name,
                out.stdout,
                out.stderr
            );
        }
        Ok(())
    }
}

/// The number of huge pages of `page_kb` a guest with `ram_mb` of memory
/// occupies.
pub fn pages_per_instance(ram_mb: u64, page_kb: u64) -> u64 {
    ram_mb * 1024 / page_kb
}

#[cfg(test)]
mod test {
    use super::*;
    use capture_test_utils::Event;
    use capture_test_utils::FakeRemote;
    use remote_capture::trace::QueryError;

    #[test]
    fn unique_names() {
        let a = unique_name("net01");
        assert!(a.starts_with("net01-"));
        assert_eq!(a.len(), "net01-".len() + 6);
    }

    #[test]
    fn huge_page_accounting() {
        // A 1024-page pool of 2M pages loses a quarter per 512M guest.
        let per = pages_per_instance(512, 2048);
        assert_eq!(per, 256);
        assert_eq!([0, 1, 2].map(|n| 1024 - n * per), [1024, 768, 512]);
    }

    #[test]
    fn poll_gives_up() {
        let mut calls = 0;
        let done = poll_until(Duration::ZERO, Duration::ZERO, || {
            calls += 1;
            Ok(false)
        })
        .unwrap();
        assert!(!done);
        assert_eq!(calls, 1);

        let done =
            poll_until(Duration::ZERO, Duration::ZERO, || Ok(true)).unwrap();
        assert!(done);
    }

    #[test]
    fn missing_decoder_fails_the_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TraceConfig {
            tshark: Some(dir.path().join("tshark")),
            port: None,
        };
        let log = remote_capture::log::discard();

        let err = trace_query(&cfg, &log).err().unwrap();
        assert!(err.to_string().contains("tool missing"), "{err}");
        assert!(matches!(
            err.downcast_ref::<QueryError>(),
            Some(QueryError::ToolMissing { .. })
        ));
    }

    #[test]
    fn remote_file_removed_on_drop() {
        let remote = FakeRemote::new();
        let log = remote_capture::log::discard();

        let file = RemoteFile::create(
            &remote,
            "node-1",
            "/tmp/key.pem",
            "PRIVATE",
            &log,
        )
        .unwrap();
        assert_eq!(file.path(), "/tmp/key.pem");
        assert_eq!(remote.events(), [Event::Exec("sh".to_string())]);

        drop(file);
        assert_eq!(
            remote.events(),
            [Event::Exec("sh".to_string()), Event::Exec("rm".to_string())]
        );
    }

    #[test]
    fn remote_file_removed_when_use_fails() {
        let remote = FakeRemote::new();
        let log = remote_capture::log::discard();

        let res = (|| -> Result<()> {
            let _file =
                RemoteFile::create(&remote, "node-1", "/tmp/k", "K", &log)?;
            bail!("ssh refused");
        })();
        assert!(res.is_err());
        assert_eq!(remote.count(&Event::Exec("rm".to_string())), 1);
    }
}
