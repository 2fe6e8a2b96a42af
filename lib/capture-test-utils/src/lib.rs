// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Common routines for capture and trace integration tests.

pub mod decoder;
pub mod frames;
pub mod pcap;
pub mod remote;

pub use decoder::ScriptedDecoder;
pub use frames::Endpoint;
pub use pcap::PcapBuilder;
pub use remote::CaptureBehavior;
pub use remote::Event;
pub use remote::FakeRemote;
