// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Support routines for `tracectl`.

use anyhow::Context;
use remote_capture::artifact::CaptureSummary;
use remote_capture::config::Config;
use std::io::Write;
use std::path::Path;
use tabwriter::TabWriter;

/// Load the configuration named on the command line. Without one, use
/// `VXLAN_TESTS_CONFIG` if that file exists, and built-in defaults
/// otherwise.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    if let Some(path) = path {
        return Config::load(path)
            .with_context(|| format!("loading {}", path.display()));
    }

    let path = Config::env_path();
    if path.exists() {
        Ok(Config::load(&path)?)
    } else {
        Ok(Config::default())
    }
}

/// Print capture summaries.
pub fn print_summaries(
    rows: &[(&Path, CaptureSummary)],
) -> std::io::Result<()> {
    print_summaries_into(&mut std::io::stdout(), rows)
}

/// Print capture summaries into a given writer.
pub fn print_summaries_into(
    writer: &mut impl Write,
    rows: &[(&Path, CaptureSummary)],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "ARTIFACT\tLINKTYPE\tSNAPLEN\tPACKETS\tBYTES\tNOTE")?;

    for (path, s) in rows {
        let note = if s.truncated { "truncated" } else { "" };
        writeln!(
            t,
            "{}\t{:?}\t{}\t{}\t{}\t{}",
            path.display(),
            s.linktype,
            s.snaplen,
            s.packets,
            s.bytes,
            note,
        )?;
    }
    t.flush()
}

/// Print decoder records, one per line.
pub fn print_records_into(
    writer: &mut impl Write,
    records: &[String],
) -> std::io::Result<()> {
    for r in records {
        writeln!(writer, "{r}")?;
    }
    writer.flush()
}

#[cfg(test)]
mod test {
    use super::*;
    use capture_test_utils::pcap::capture_bytes;
    use remote_capture::artifact::CaptureArtifact;

    #[test]
    fn summary_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pcap");
        std::fs::write(&path, capture_bytes([&[0u8; 60][..], &[0u8; 42][..]]))
            .unwrap();
        let summary = CaptureArtifact::open(&path).unwrap().summary().unwrap();

        let mut out = vec![];
        print_summaries_into(&mut out, &[(path.as_path(), summary)]).unwrap();
        let out = String::from_utf8(out).unwrap();
        let mut lines = out.lines();

        let header: Vec<_> = lines.next().unwrap().split_whitespace().collect();
        assert_eq!(
            header,
            ["ARTIFACT", "LINKTYPE", "SNAPLEN", "PACKETS", "BYTES", "NOTE"]
        );
        let row: Vec<_> = lines.next().unwrap().split_whitespace().collect();
        assert_eq!(row[0], path.display().to_string());
        assert_eq!(row[3], "2");
        assert!(lines.next().is_none());
    }

    #[test]
    fn explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(load_config(Some(&missing)).is_err());

        let path = dir.path().join("cfg.toml");
        std::fs::write(&path, "[ssh]\nuser = \"ops\"\n").unwrap();
        assert_eq!(load_config(Some(&path)).unwrap().ssh.user, "ops");
    }
}
