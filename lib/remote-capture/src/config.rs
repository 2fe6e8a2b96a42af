// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Suite configuration.
//!
//! Everything lives in one TOML file, located via `VXLAN_TESTS_CONFIG`:
//!
//! ```toml
//! [ssh]
//! user = "root"
//! identity_files = ["/root/.ssh/id_rsa"]
//!
//! [capture]
//! interface = "any"
//!
//! [trace]
//! tshark = "/usr/bin/tshark"
//!
//! [cloud]
//! cloud = "fuel"
//! external_network = "admin_floating_net"
//!
//! [environment]
//! segmentation = "vxlan"
//! l2pop = true
//!
//! [[environment.nodes]]
//! fqdn = "node-1.test.domain.local"
//! ip = "10.109.0.3"
//! roles = ["controller"]
//! ```
//!
//! Every table is optional.

use crate::capture::CaptureSpec;
use crate::env::Environment;
use crate::remote::SshConfig;
use crate::trace::QueryError;
use crate::trace::Tshark;
use serde::Deserialize;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "VXLAN_TESTS_CONFIG";

/// Used when `VXLAN_TESTS_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "vxlan-tests.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceConfig {
    /// Decoder binary; searched for on `PATH` when unset.
    #[serde(default)]
    pub tshark: Option<PathBuf>,

    /// UDP port decoded as VXLAN, if not the standard one.
    #[serde(default)]
    pub port: Option<u16>,
}

impl TraceConfig {
    pub fn decoder(&self) -> Result<Tshark, QueryError> {
        let tshark = match &self.tshark {
            Some(path) => Tshark::at(path),
            None => Tshark::locate()?,
        };
        Ok(match self.port {
            Some(port) => tshark.with_port(port),
            None => tshark,
        })
    }
}

fn default_openstack() -> PathBuf {
    PathBuf::from("openstack")
}

fn default_external_network() -> String {
    "admin_floating_net".to_string()
}

fn default_image() -> String {
    "TestVM".to_string()
}

fn default_flavor() -> String {
    "m1.micro".to_string()
}

fn default_vm_user() -> String {
    "cirros".to_string()
}

fn default_server_timeout_secs() -> u64 {
    300
}

/// How to reach the cloud control plane.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudConfig {
    /// The orchestration client binary.
    #[serde(default = "default_openstack")]
    pub openstack: PathBuf,

    /// Passed as `--os-cloud` when set; otherwise the client reads the usual
    /// `OS_*` environment variables.
    #[serde(default)]
    pub cloud: Option<String>,

    #[serde(default = "default_external_network")]
    pub external_network: String,

    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default = "default_flavor")]
    pub flavor: String,

    /// Guest login used to run commands in instances.
    #[serde(default = "default_vm_user")]
    pub vm_user: String,

    #[serde(default = "default_server_timeout_secs")]
    pub server_timeout_secs: u64,

    /// Leave created resources behind for inspection.
    #[serde(default)]
    pub keep_resources: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            openstack: default_openstack(),
            cloud: None,
            external_network: default_external_network(),
            image: default_image(),
            flavor: default_flavor(),
            vm_user: default_vm_user(),
            server_timeout_secs: default_server_timeout_secs(),
            keep_resources: false,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub capture: CaptureSpec,

    #[serde(default)]
    pub trace: TraceConfig,

    #[serde(default)]
    pub cloud: CloudConfig,

    #[serde(default)]
    pub environment: Environment,
}

impl Config {
    pub fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| {
            ConfigError::Read { path: path.to_path_buf(), source }
        })?;
        Self::parse(path, &text)
    }

    /// Load the file named by `VXLAN_TESTS_CONFIG`, or `vxlan-tests.toml` in
    /// the working directory.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Self::env_path())
    }

    pub fn env_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_api::NodeRole;
    use tunnel_api::VXLAN_PORT;

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg = Config::parse(Path::new("empty.toml"), "").unwrap();
        assert_eq!(cfg.ssh.user, "root");
        assert_eq!(cfg.ssh.port, 22);
        assert_eq!(cfg.capture, CaptureSpec::default());
        assert_eq!(cfg.capture.port, VXLAN_PORT);
        assert!(cfg.trace.tshark.is_none());
        assert_eq!(cfg.cloud.openstack, PathBuf::from("openstack"));
        assert!(!cfg.cloud.keep_resources);
        assert!(cfg.environment.nodes.is_empty());
    }

    #[test]
    fn full_file() {
        let text = r#"
            [ssh]
            user = "admin"
            port = 2222
            identity_files = ["/keys/a", "/keys/b"]

            [capture]
            interface = "br-ex"
            startup_grace_ms = 250

            [trace]
            tshark = "/opt/wireshark/bin/tshark"

            [cloud]
            cloud = "lab"
            keep_resources = true

            [environment]
            l2pop = true

            [[environment.nodes]]
            fqdn = "node-2.lab"
            ip = "10.0.0.2"
            roles = ["compute"]
        "#;
        let cfg = Config::parse(Path::new("full.toml"), text).unwrap();
        assert_eq!(cfg.ssh.user, "admin");
        assert_eq!(cfg.ssh.identity_files.len(), 2);
        assert_eq!(cfg.capture.interface, "br-ex");
        assert_eq!(cfg.capture.port, VXLAN_PORT);
        assert_eq!(cfg.capture.startup_grace_ms, 250);
        assert_eq!(
            cfg.trace.decoder().unwrap().path(),
            Path::new("/opt/wireshark/bin/tshark")
        );
        assert_eq!(cfg.cloud.cloud.as_deref(), Some("lab"));
        assert!(cfg.cloud.keep_resources);
        assert!(cfg.environment.is_l2pop());
        assert!(cfg.environment.nodes[0].has_role(&NodeRole::Compute));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::parse(Path::new("typo.toml"), "[ssh]\nusr = \"x\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("typo.toml"));
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
