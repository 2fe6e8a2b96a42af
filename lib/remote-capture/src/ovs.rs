// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Open vSwitch state as reported by `ovs-vsctl show`.

use crate::remote::Remote;
use crate::remote::RemoteCmd;
use crate::remote::RemoteError;
use std::collections::BTreeMap;

/// Interface types that carry overlay traffic.
const TUNNEL_TYPES: &[&str] = &["vxlan", "gre", "geneve", "stt"];

/// A tunnel port on one of the bridges.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Tunnel {
    pub bridge: String,
    pub port: String,
    pub kind: String,
    pub local_ip: Option<String>,
    pub remote_ip: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct VswitchState {
    bridges: Vec<String>,
    tunnels: Vec<Tunnel>,
}

#[derive(Default)]
struct PendingIface {
    port: String,
    kind: Option<String>,
    options: BTreeMap<String, String>,
}

impl VswitchState {
    /// Parse the output of `ovs-vsctl show`.
    ///
    /// The output is an indented tree; only `Bridge`, `Port`, `Interface`,
    /// `type:` and `options:` lines are of interest.
    pub fn parse(text: &str) -> Self {
        let mut state = Self::default();
        let mut bridge: Option<String> = None;
        let mut port = String::new();
        let mut iface: Option<PendingIface> = None;

        for line in text.lines() {
            let line = line.trim();
            if let Some(name) = line.strip_prefix("Bridge ") {
                state.flush(bridge.as_deref(), iface.take());
                let name = unquote(name).to_string();
                state.bridges.push(name.clone());
                bridge = Some(name);
            } else if let Some(name) = line.strip_prefix("Port ") {
                state.flush(bridge.as_deref(), iface.take());
                port = unquote(name).to_string();
            } else if line.starts_with("Interface ") {
                state.flush(bridge.as_deref(), iface.take());
                iface = Some(PendingIface {
                    port: port.clone(),
                    ..Default::default()
                });
            } else if let Some(kind) = line.strip_prefix("type:") {
                if let Some(iface) = iface.as_mut() {
                    iface.kind = Some(unquote(kind.trim()).to_string());
                }
            } else if let Some(opts) = line.strip_prefix("options:") {
                if let Some(iface) = iface.as_mut() {
                    iface.options = parse_options(opts);
                }
            } else if line.starts_with("ovs_version:") {
                state.flush(bridge.as_deref(), iface.take());
                bridge = None;
            }
        }
        state.flush(bridge.as_deref(), iface.take());

        state
    }

    fn flush(&mut self, bridge: Option<&str>, iface: Option<PendingIface>) {
        let (Some(bridge), Some(mut iface)) = (bridge, iface) else {
            return;
        };

        let is_tunnel = iface
            .kind
            .as_deref()
            .is_some_and(|k| TUNNEL_TYPES.contains(&k))
            || iface.options.contains_key("remote_ip");
        if !is_tunnel {
            return;
        }

        self.tunnels.push(Tunnel {
            bridge: bridge.to_string(),
            port: iface.port,
            kind: iface.kind.unwrap_or_default(),
            local_ip: iface.options.remove("local_ip"),
            remote_ip: iface.options.remove("remote_ip"),
        });
    }

    pub fn bridges(&self) -> &[String] {
        &self.bridges
    }

    pub fn has_bridge(&self, name: &str) -> bool {
        self.bridges.iter().any(|b| b == name)
    }

    pub fn tunnels(&self) -> &[Tunnel] {
        &self.tunnels
    }

    pub fn has_tunnels(&self) -> bool {
        !self.tunnels.is_empty()
    }

    pub fn remote_ips(&self) -> Vec<&str> {
        self.tunnels.iter().filter_map(|t| t.remote_ip.as_deref()).collect()
    }

    /// Whether any tunnel terminates at one of `addrs`.
    pub fn has_tunnel_to<S: AsRef<str>>(&self, addrs: &[S]) -> bool {
        let remotes = self.remote_ips();
        addrs.iter().any(|a| remotes.contains(&a.as_ref()))
    }
}

fn unquote(s: &str) -> &str {
    s.trim().trim_matches('"')
}

/// Parse `{df_default="true", in_key=flow, remote_ip="192.168.2.3"}`.
fn parse_options(s: &str) -> BTreeMap<String, String> {
    let s = s.trim().trim_start_matches('{').trim_end_matches('}');
    s.split(',')
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), unquote(v).to_string()))
        .collect()
}

/// Read the virtual switch state of `host`.
pub fn show(
    remote: &dyn Remote,
    host: &str,
) -> Result<VswitchState, RemoteError> {
    let cmd = RemoteCmd::new("ovs-vsctl").arg("show");
    let out = remote.execute(host, &cmd)?;
    out.check(host, &cmd)?;
    Ok(VswitchState::parse(&out.stdout))
}
