// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Retrieved capture files.

use pcap_parser::Linktype;
use pcap_parser::pcap;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureArtifactError {
    #[error("capture artifact {path} is unavailable: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("capture artifact {path} is not a file")]
    NotAFile { path: PathBuf },

    #[error("capture artifact {path} is not a pcap file: {reason}")]
    BadHeader { path: PathBuf, reason: String },
}

/// A capture file copied back from a remote host.
///
/// The harness never writes to an artifact after retrieving it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CaptureArtifact {
    path: PathBuf,
}

/// Container-level facts about an artifact.
#[derive(Clone, Debug)]
pub struct CaptureSummary {
    pub linktype: Linktype,
    pub snaplen: u32,
    pub nanosecond: bool,
    pub packets: usize,
    pub bytes: u64,
    /// The file ends in the middle of a record.
    pub truncated: bool,
}

impl CaptureArtifact {
    /// Refer to an existing capture file.
    pub fn open(
        path: impl Into<PathBuf>,
    ) -> Result<Self, CaptureArtifactError> {
        let path = path.into();
        let meta = std::fs::metadata(&path).map_err(|source| {
            CaptureArtifactError::Unavailable { path: path.clone(), source }
        })?;
        if !meta.is_file() {
            return Err(CaptureArtifactError::NotAFile { path });
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(&self, source: std::io::Error) -> CaptureArtifactError {
        CaptureArtifactError::Unavailable { path: self.path.clone(), source }
    }

    pub fn len(&self) -> Result<u64, CaptureArtifactError> {
        std::fs::metadata(&self.path)
            .map(|m| m.len())
            .map_err(|source| self.unavailable(source))
    }

    pub fn is_empty(&self) -> Result<bool, CaptureArtifactError> {
        self.len().map(|len| len == 0)
    }

    /// Walk the legacy pcap container written by `tcpdump -w`.
    pub fn summary(&self) -> Result<CaptureSummary, CaptureArtifactError> {
        let data =
            std::fs::read(&self.path).map_err(|s| self.unavailable(s))?;

        let (mut rest, hdr) = pcap::parse_pcap_header(&data).map_err(|e| {
            CaptureArtifactError::BadHeader {
                path: self.path.clone(),
                reason: format!("{e:?}"),
            }
        })?;

        let mut packets = 0;
        let mut truncated = false;
        while !rest.is_empty() {
            let parsed = if hdr.is_bigendian() {
                pcap::parse_pcap_frame_be(rest)
            } else {
                pcap::parse_pcap_frame(rest)
            };

            match parsed {
                Ok((next, _block)) => {
                    packets += 1;
                    rest = next;
                }
                Err(_) => {
                    truncated = true;
                    break;
                }
            }
        }

        Ok(CaptureSummary {
            linktype: hdr.network,
            snaplen: hdr.snaplen,
            nanosecond: hdr.is_nanosecond_precision(),
            packets,
            bytes: data.len() as u64,
            truncated,
        })
    }
}
