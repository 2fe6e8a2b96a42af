// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Remote packet capture and trace queries for overlay network tests.
//!
//! A [`capture::CaptureSession`] runs `tcpdump` on a cluster node for the
//! duration of a test action and copies the resulting file back as a
//! [`artifact::CaptureArtifact`]. A [`trace::TraceQuery`] then answers
//! questions about it: does all encapsulated traffic carry a given VNI, was
//! there any ARP between two guests, did ICMP flow between them.
//!
//! The remaining modules describe the deployment being tested and read
//! node state that scenarios gate on.

pub mod artifact;
pub mod capture;
pub mod config;
pub mod env;
pub mod hugepages;
pub mod log;
pub mod ovs;
pub mod remote;
pub mod trace;

pub use tunnel_api::NodeRole;
pub use tunnel_api::Segmentation;
pub use tunnel_api::VXLAN_PORT;
pub use tunnel_api::Vni;
