// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Querying retrieved captures.
//!
//! Decoding is delegated to an external tool, normally `tshark`, told to
//! treat the tunnel port as VXLAN so that filters can reach both the
//! encapsulation header and the inner frame.

use crate::artifact::CaptureArtifact;
use slog::Logger;
use slog::debug;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::fmt;
use std::fmt::Display;
use std::net::Ipv4Addr;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;
use tunnel_api::VXLAN_PORT;
use tunnel_api::Vni;

/// Errors related to running the trace decoder. These are setup problems,
/// never a statement about the traffic in a capture.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("trace decoder `{tool}` not found in {searched}")]
    ToolMissing { tool: String, searched: String },

    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed ({status}): {stderr}")]
    DecoderFailed { tool: PathBuf, status: String, stderr: String },
}

/// The outcome of a failed check.
#[derive(Debug, Error)]
pub enum CheckError {
    /// The capture does not look the way the check expects. `output` is the
    /// decoder output that led to the verdict.
    #[error("{check}\n{output}")]
    Violated { check: String, output: String },

    #[error(transparent)]
    Query(#[from] QueryError),
}

impl CheckError {
    pub fn is_violation(&self) -> bool {
        matches!(self, CheckError::Violated { .. })
    }
}

/// A record filter, rendered as a decoder display filter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Predicate {
    /// Encapsulated records whose VNI is not the given one.
    VniNot(Vni),

    /// ARP records between a pair of protocol addresses.
    ArpBetween { src: Ipv4Addr, dst: Ipv4Addr },

    /// ICMP records between a pair of addresses.
    IcmpBetween { src: Ipv4Addr, dst: Ipv4Addr },

    /// A display filter passed through as is.
    Raw(String),
}

impl Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Predicate::VniNot(vni) => write!(f, "vxlan.vni != {vni}"),
            Predicate::ArpBetween { src, dst } => write!(
                f,
                "arp.src.proto_ipv4 == {src} and arp.dst.proto_ipv4 == {dst}"
            ),
            Predicate::IcmpBetween { src, dst } => {
                write!(f, "icmp and ip.src == {src} and ip.dst == {dst}")
            }
            Predicate::Raw(filter) => write!(f, "{filter}"),
        }
    }
}

/// Something that can list the records of a capture matching a filter.
pub trait TraceDecoder: Send + Sync {
    /// Return the records of `artifact` matching `filter`, one per line, in
    /// capture order. Must not modify the artifact.
    fn decode(
        &self,
        artifact: &Path,
        filter: &str,
    ) -> Result<Vec<String>, QueryError>;
}

/// The `tshark` command line decoder.
#[derive(Clone, Debug)]
pub struct Tshark {
    path: PathBuf,
    port: u16,
}

impl Tshark {
    pub const NAME: &'static str = "tshark";

    /// Find `tshark` on `PATH`.
    pub fn locate() -> Result<Self, QueryError> {
        Self::locate_in(std::env::var_os("PATH").unwrap_or_default())
    }

    /// Find `tshark` in a `PATH`-style list of directories.
    pub fn locate_in(paths: impl AsRef<OsStr>) -> Result<Self, QueryError> {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(Self::NAME))
            .find(|candidate| is_executable(candidate))
            .map(Self::at)
            .ok_or_else(|| QueryError::ToolMissing {
                tool: Self::NAME.to_string(),
                searched: paths.as_ref().to_string_lossy().into_owned(),
            })
    }

    /// Use the `tshark` binary at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), port: VXLAN_PORT }
    }

    /// Decode a port other than the standard one as VXLAN.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fail with [`QueryError::ToolMissing`] unless the binary exists and
    /// is executable.
    pub fn ensure_installed(&self) -> Result<(), QueryError> {
        if is_executable(&self.path) {
            Ok(())
        } else {
            Err(QueryError::ToolMissing {
                tool: Self::NAME.to_string(),
                searched: self.path.display().to_string(),
            })
        }
    }

    fn args(&self, artifact: &Path, filter: &str) -> Vec<OsString> {
        vec![
            "-d".into(),
            format!("udp.port=={},vxlan", self.port).into(),
            "-r".into(),
            artifact.into(),
            "-Y".into(),
            filter.into(),
        ]
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

impl TraceDecoder for Tshark {
    fn decode(
        &self,
        artifact: &Path,
        filter: &str,
    ) -> Result<Vec<String>, QueryError> {
        let out = Command::new(&self.path)
            .args(self.args(artifact, filter))
            .output()
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::NotFound => QueryError::ToolMissing {
                    tool: Self::NAME.to_string(),
                    searched: self.path.display().to_string(),
                },
                _ => QueryError::Spawn { tool: self.path.clone(), source },
            })?;

        if !out.status.success() {
            return Err(QueryError::DecoderFailed {
                tool: self.path.clone(),
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.trim().is_empty())
            .map(String::from)
            .collect())
    }
}

/// Runs predicates and checks against retrieved captures.
pub struct TraceQuery<D = Tshark> {
    decoder: D,
    log: Logger,
}

impl<D: TraceDecoder> TraceQuery<D> {
    pub fn new(decoder: D, log: &Logger) -> Self {
        Self { decoder, log: log.new(slog::o!("component" => "trace")) }
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Return the records of `artifact` matching `pred`.
    pub fn query(
        &self,
        artifact: &CaptureArtifact,
        pred: &Predicate,
    ) -> Result<Vec<String>, QueryError> {
        let filter = pred.to_string();
        let records = self.decoder.decode(artifact.path(), &filter)?;
        debug!(self.log, "query";
            "artifact" => %artifact.path().display(),
            "filter" => &filter,
            "matches" => records.len()
        );
        Ok(records)
    }

    /// Pass when every encapsulated record carries `vni`.
    pub fn check_all_traffic_has_vni(
        &self,
        artifact: &CaptureArtifact,
        vni: Vni,
    ) -> Result<(), CheckError> {
        let records = self.query(artifact, &Predicate::VniNot(vni))?;
        if records.is_empty() {
            return Ok(());
        }

        Err(CheckError::Violated {
            check: format!(
                "{} contains records with a VNI other than {vni}",
                artifact.path().display()
            ),
            output: records.join("\n"),
        })
    }

    /// Pass when there is no ARP from `src` about `dst`.
    pub fn check_no_arp_traffic(
        &self,
        artifact: &CaptureArtifact,
        src: Ipv4Addr,
        dst: Ipv4Addr,
    ) -> Result<(), CheckError> {
        let records =
            self.query(artifact, &Predicate::ArpBetween { src, dst })?;
        if records.is_empty() {
            return Ok(());
        }

        Err(CheckError::Violated {
            check: format!(
                "{} contains ARP traffic from {src} to {dst}",
                artifact.path().display()
            ),
            output: records.join("\n"),
        })
    }

    /// Pass when at least one ICMP record went from `src` to `dst`.
    pub fn check_icmp_traffic(
        &self,
        artifact: &CaptureArtifact,
        src: Ipv4Addr,
        dst: Ipv4Addr,
    ) -> Result<(), CheckError> {
        let pred = Predicate::IcmpBetween { src, dst };
        let records = self.query(artifact, &pred)?;
        if !records.is_empty() {
            return Ok(());
        }

        Err(CheckError::Violated {
            check: format!(
                "{} contains no ICMP traffic from {src} to {dst}",
                artifact.path().display()
            ),
            output: format!("(no records match `{pred}`)"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_filters() {
        let vni = Vni::new(1701u32).unwrap();
        let a = Ipv4Addr::new(10, 1, 1, 3);
        let b = Ipv4Addr::new(10, 1, 2, 4);

        assert_eq!(Predicate::VniNot(vni).to_string(), "vxlan.vni != 1701");
        assert_eq!(
            Predicate::ArpBetween { src: a, dst: b }.to_string(),
            "arp.src.proto_ipv4 == 10.1.1.3 and arp.dst.proto_ipv4 == 10.1.2.4"
        );
        assert_eq!(
            Predicate::IcmpBetween { src: a, dst: b }.to_string(),
            "icmp and ip.src == 10.1.1.3 and ip.dst == 10.1.2.4"
        );
        assert_eq!(Predicate::Raw("udp".into()).to_string(), "udp");
    }

    #[test]
    fn tshark_args() {
        let tshark = Tshark::at("/usr/bin/tshark");
        let args = tshark.args(Path::new("/tmp/vxlan.log"), "arp");
        assert_eq!(
            args,
            ["-d", "udp.port==4789,vxlan", "-r", "/tmp/vxlan.log", "-Y", "arp"]
                .map(OsString::from)
        );

        let args = tshark.with_port(8472).args(Path::new("x"), "icmp");
        assert_eq!(args[1], OsString::from("udp.port==8472,vxlan"));
    }

    #[test]
    fn locate_in_empty_search_path() {
        let dir = tempfile::tempdir().unwrap();
        match Tshark::locate_in(dir.path()) {
            Err(QueryError::ToolMissing { tool, searched }) => {
                assert_eq!(tool, "tshark");
                assert_eq!(searched, dir.path().to_string_lossy());
            }
            other => panic!("expected ToolMissing, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn locate_in_finds_executables_only() {
        use std::os::unix::fs::PermissionsExt;

        let plain = tempfile::tempdir().unwrap();
        std::fs::write(plain.path().join("tshark"), "").unwrap();

        let exec = tempfile::tempdir().unwrap();
        let bin = exec.path().join("tshark");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755))
            .unwrap();

        let paths =
            std::env::join_paths([plain.path(), exec.path()]).unwrap();
        let tshark = Tshark::locate_in(&paths).unwrap();
        assert_eq!(tshark.path(), bin);
    }

    #[cfg(unix)]
    #[test]
    fn installed_check() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Tshark::at(dir.path().join("tshark"));
        assert!(matches!(
            missing.ensure_installed(),
            Err(QueryError::ToolMissing { .. })
        ));

        std::fs::write(missing.path(), "").unwrap();
        assert!(missing.ensure_installed().is_err());

        let found = Tshark::locate();
        if let Ok(tshark) = found {
            tshark.ensure_installed().unwrap();
        }
    }
}
