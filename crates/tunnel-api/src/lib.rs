// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Overlay types shared by the capture harness, its tooling and the
//! scenario suites.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

/// The IANA-assigned UDP destination port for VXLAN.
pub const VXLAN_PORT: u16 = 4789;

const VNI_MAX: u32 = 0x00_FF_FF_FF;

/// A VXLAN Network Identifier.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
#[serde(try_from = "u32", into = "u32")]
pub struct Vni {
    // A VNI is 24-bit. The bytes are in network order.
    inner: [u8; 3],
}

impl Vni {
    /// Attempt to create a new VNI from any value which can be
    /// converted to a `u32`.
    ///
    /// # Errors
    ///
    /// Returns an error when the value exceeds the 24-bit maximum.
    pub fn new<N: Into<u32>>(val: N) -> Result<Vni, String> {
        let val = val.into();
        if val > VNI_MAX {
            return Err(format!("VNI value exceeds maximum: {val}"));
        }

        let be_bytes = val.to_be_bytes();
        Ok(Vni { inner: [be_bytes[1], be_bytes[2], be_bytes[3]] })
    }

    /// Return the bytes that represent this VNI. The bytes are in
    /// network order.
    pub fn bytes(&self) -> [u8; 3] {
        self.inner
    }
}

impl From<Vni> for u32 {
    fn from(vni: Vni) -> u32 {
        let bytes = vni.inner;
        u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
    }
}

impl TryFrom<u32> for Vni {
    type Error = String;

    fn try_from(val: u32) -> Result<Self, Self::Error> {
        Self::new(val)
    }
}

impl FromStr for Vni {
    type Err = String;

    fn from_str(val: &str) -> Result<Self, Self::Err> {
        let n = val.trim().parse::<u32>().map_err(|e| e.to_string())?;
        Self::new(n)
    }
}

impl Display for Vni {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

/// The role a deployment assigns to a node.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum NodeRole {
    Controller,
    Compute,
    Other(String),
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" => Err("empty node role".to_string()),
            "controller" => Ok(NodeRole::Controller),
            "compute" => Ok(NodeRole::Compute),
            other => Ok(NodeRole::Other(other.to_string())),
        }
    }
}

impl Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NodeRole::Controller => write!(f, "controller"),
            NodeRole::Compute => write!(f, "compute"),
            NodeRole::Other(role) => write!(f, "{role}"),
        }
    }
}

impl<'de> Deserialize<'de> for NodeRole {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for NodeRole {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

/// How tenant networks are segmented on the underlay.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Segmentation {
    Vxlan,
    Vlan,
    Gre,
}

impl FromStr for Segmentation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vxlan" | "tun" => Ok(Segmentation::Vxlan),
            "vlan" => Ok(Segmentation::Vlan),
            "gre" => Ok(Segmentation::Gre),
            _ => Err(format!("invalid segmentation type: {s}")),
        }
    }
}

impl Display for Segmentation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Segmentation::Vxlan => "vxlan",
            Segmentation::Vlan => "vlan",
            Segmentation::Gre => "gre",
        };

        write!(f, "{s}")
    }
}
