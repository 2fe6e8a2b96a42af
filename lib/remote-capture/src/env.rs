// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The deployment under test: its nodes, their roles and addresses, and the
//! capabilities scenarios gate on.

use serde::Deserialize;
use thiserror::Error;
use tunnel_api::NodeRole;
use tunnel_api::Segmentation;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("no node with fqdn {0}")]
    UnknownNode(String),
}

/// An address a node holds on one of the deployment's networks.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NodeNetwork {
    pub name: String,
    /// Address in CIDR notation, e.g. `192.168.2.3/24`.
    #[serde(default)]
    pub ip: Option<String>,
}

/// A cluster node.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Node {
    pub fqdn: String,
    /// The address used to reach the node over SSH.
    pub ip: String,
    #[serde(default)]
    pub roles: Vec<NodeRole>,
    #[serde(default)]
    pub networks: Vec<NodeNetwork>,
}

impl Node {
    /// All addresses held by this node, without prefix lengths.
    pub fn ip_list(&self) -> Vec<String> {
        let mut ips: Vec<String> = self
            .networks
            .iter()
            .filter_map(|n| n.ip.as_deref())
            .map(|ip| ip.split('/').next().unwrap_or(ip).to_string())
            .collect();
        if !ips.contains(&self.ip) {
            ips.push(self.ip.clone());
        }
        ips
    }

    pub fn has_role(&self, role: &NodeRole) -> bool {
        self.roles.contains(role)
    }

    fn answers_to(&self, name: &str) -> bool {
        self.fqdn == name
            || self
                .fqdn
                .strip_prefix(name)
                .is_some_and(|rest| rest.starts_with('.'))
    }
}

fn default_segmentation() -> Segmentation {
    Segmentation::Vxlan
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Environment {
    #[serde(default = "default_segmentation")]
    pub segmentation: Segmentation,

    /// Whether the L2 population mechanism driver is enabled.
    #[serde(default)]
    pub l2pop: bool,

    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            segmentation: default_segmentation(),
            l2pop: false,
            nodes: vec![],
        }
    }
}

impl Environment {
    /// Map a host name, as reported by the control plane, to its node. A
    /// short host name matches the node whose fqdn it is the first label of.
    pub fn find_node_by_fqdn(&self, fqdn: &str) -> Result<&Node, EnvError> {
        self.nodes
            .iter()
            .find(|n| n.fqdn == fqdn)
            .or_else(|| self.nodes.iter().find(|n| n.answers_to(fqdn)))
            .ok_or_else(|| EnvError::UnknownNode(fqdn.to_string()))
    }

    pub fn nodes_by_role<'a>(
        &'a self,
        role: &'a NodeRole,
    ) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.iter().filter(move |n| n.has_role(role))
    }

    pub fn controllers(&self) -> Vec<&Node> {
        self.nodes_by_role(&NodeRole::Controller).collect()
    }

    pub fn computes(&self) -> Vec<&Node> {
        self.nodes_by_role(&NodeRole::Compute).collect()
    }

    pub fn is_vxlan(&self) -> bool {
        self.segmentation == Segmentation::Vxlan
    }

    pub fn is_vlan(&self) -> bool {
        self.segmentation == Segmentation::Vlan
    }

    pub fn is_l2pop(&self) -> bool {
        self.l2pop
    }

    pub fn has_computes(&self, n: usize) -> bool {
        self.computes().len() >= n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENV: &str = r#"
        segmentation = "vxlan"
        l2pop = true

        [[nodes]]
        fqdn = "node-1.test.domain.local"
        ip = "10.109.0.3"
        roles = ["controller"]
        networks = [
            { name = "management", ip = "192.168.0.3/24" },
            { name = "private", ip = "192.168.2.3/24" },
            { name = "storage" },
        ]

        [[nodes]]
        fqdn = "node-4.test.domain.local"
        ip = "10.109.0.6"
        roles = ["compute", "cinder"]
        networks = [{ name = "private", ip = "192.168.2.6/24" }]

        [[nodes]]
        fqdn = "node-5.test.domain.local"
        ip = "10.109.0.7"
        roles = ["compute"]
    "#;

    fn env() -> Environment {
        toml::from_str(ENV).unwrap()
    }

    #[test]
    fn capabilities() {
        let env = env();
        assert!(env.is_vxlan());
        assert!(!env.is_vlan());
        assert!(env.is_l2pop());
        assert!(env.has_computes(2));
        assert!(!env.has_computes(3));
        assert_eq!(env.controllers().len(), 1);
    }

    #[test]
    fn ip_list_strips_prefixes() {
        let env = env();
        let ctl = env.controllers()[0];
        assert_eq!(
            ctl.ip_list(),
            ["192.168.0.3", "192.168.2.3", "10.109.0.3"]
        );
        let bare = env.find_node_by_fqdn("node-5.test.domain.local").unwrap();
        assert_eq!(bare.ip_list(), ["10.109.0.7"]);
    }

    #[test]
    fn lookup_by_name() {
        let env = env();
        let node = env.find_node_by_fqdn("node-4.test.domain.local").unwrap();
        assert_eq!(node.ip, "10.109.0.6");
        assert_eq!(env.find_node_by_fqdn("node-4").unwrap(), node);
        assert!(env.find_node_by_fqdn("node-4.test").is_ok());
        assert!(env.find_node_by_fqdn("node-").is_err());
        assert!(matches!(
            env.find_node_by_fqdn("node-9"),
            Err(EnvError::UnknownNode(name)) if name == "node-9"
        ));
    }

    #[test]
    fn roles() {
        let env = env();
        let cinder = NodeRole::Other("cinder".into());
        let names: Vec<_> =
            env.nodes_by_role(&cinder).map(|n| n.fqdn.as_str()).collect();
        assert_eq!(names, ["node-4.test.domain.local"]);
        assert_eq!(env.computes().len(), 2);
    }

    #[test]
    fn empty_environment() {
        let env: Environment = toml::from_str("").unwrap();
        assert!(env.is_vxlan());
        assert!(!env.is_l2pop());
        assert!(!env.has_computes(1));
    }
}
