// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Routines for building packet capture files.

use pcap_parser::Linktype;
use pcap_parser::ToVec;
use pcap_parser::pcap::LegacyPcapBlock;
use pcap_parser::pcap::PcapHeader;
use std::fs::File;
use std::io::Write;
use std::path::Path;

fn header(network: Linktype) -> Vec<u8> {
    let mut hdr = PcapHeader {
        magic_number: 0xa1b2c3d4,
        version_major: 2,
        version_minor: 4,
        thiszone: 0,
        sigfigs: 0,
        snaplen: 262144,
        network,
    };

    hdr.to_vec().unwrap()
}

fn block(ts_sec: u32, frame: &[u8]) -> Vec<u8> {
    let mut block = LegacyPcapBlock {
        ts_sec,
        ts_usec: 7777,
        caplen: frame.len() as u32,
        origlen: frame.len() as u32,
        data: frame,
    };

    block.to_vec().unwrap()
}

/// Build a packet capture file from a series of Ethernet frames.
pub struct PcapBuilder {
    file: File,
    count: u32,
}

impl PcapBuilder {
    /// Create a new pcap builder, writing all captures to `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let mut file = File::create(path).unwrap();
        file.write_all(&header(Linktype::ETHERNET)).unwrap();
        Self { file, count: 0 }
    }

    /// Add a frame to the capture.
    pub fn add_frame(&mut self, frame: &[u8]) -> &mut Self {
        self.count += 1;
        self.file.write_all(&block(self.count, frame)).unwrap();
        self
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// The bytes of a capture file holding `frames`, as produced by `tcpdump`
/// and copied back by a fake remote.
pub fn capture_bytes<'a>(
    frames: impl IntoIterator<Item = &'a [u8]>,
) -> Vec<u8> {
    let mut bytes = header(Linktype::ETHERNET);
    for (i, frame) in frames.into_iter().enumerate() {
        bytes.extend(block(i as u32 + 1, frame));
    }
    bytes
}
