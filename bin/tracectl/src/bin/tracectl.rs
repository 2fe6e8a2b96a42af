// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use std::net::Ipv4Addr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use slog::info;

use remote_capture::artifact::CaptureArtifact;
use remote_capture::capture::CaptureSession;
use remote_capture::remote::SshRemote;
use remote_capture::trace::Predicate;
use remote_capture::trace::TraceQuery;
use remote_capture::trace::Tshark;
use tracectl::load_config;
use tracectl::print_records_into;
use tracectl::print_summaries;
use tunnel_api::Vni;

/// Capture and inspect VXLAN traffic on cluster nodes
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Suite configuration file (default: $VXLAN_TESTS_CONFIG, then
    /// vxlan-tests.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// The tshark binary to decode with
    #[arg(long, global = true)]
    tshark: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the records of a capture matching a display filter.
    Query {
        artifact: PathBuf,

        #[arg(long, short)]
        filter: String,
    },

    /// Check that all encapsulated traffic carries a VNI.
    CheckVni { artifact: PathBuf, vni: Vni },

    /// Check that there is no ARP between two addresses.
    CheckNoArp {
        artifact: PathBuf,

        #[command(flatten)]
        pair: Pair,
    },

    /// Check that ICMP flowed between two addresses.
    CheckIcmp {
        artifact: PathBuf,

        #[command(flatten)]
        pair: Pair,
    },

    /// Summarize capture files.
    Summary {
        #[arg(required = true)]
        artifacts: Vec<PathBuf>,
    },

    /// Capture on a node for a fixed time and copy the file back.
    Capture {
        /// Address of the node to capture on.
        #[arg(long)]
        host: String,

        /// Where to write the capture locally.
        #[arg(long)]
        out: PathBuf,

        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

#[derive(Debug, clap::Args)]
struct Pair {
    #[arg(long)]
    src: Ipv4Addr,

    #[arg(long)]
    dst: Ipv4Addr,
}

fn open(path: &Path) -> anyhow::Result<CaptureArtifact> {
    CaptureArtifact::open(path)
        .with_context(|| format!("opening {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;
    let log = remote_capture::log::init();

    let decoder = || -> anyhow::Result<TraceQuery<Tshark>> {
        let tshark = match &cli.tshark {
            Some(path) => Tshark::at(path),
            None => cfg.trace.decoder()?,
        };
        Ok(TraceQuery::new(tshark, &log))
    };

    match &cli.cmd {
        Command::Query { artifact, filter } => {
            let records = decoder()?
                .query(&open(artifact)?, &Predicate::Raw(filter.clone()))?;
            print_records_into(&mut std::io::stdout(), &records)?;
        }

        Command::CheckVni { artifact, vni } => {
            decoder()?.check_all_traffic_has_vni(&open(artifact)?, *vni)?;
            println!("ok: all traffic carries VNI {vni}");
        }

        Command::CheckNoArp { artifact, pair } => {
            decoder()?.check_no_arp_traffic(
                &open(artifact)?,
                pair.src,
                pair.dst,
            )?;
            println!("ok: no ARP from {} to {}", pair.src, pair.dst);
        }

        Command::CheckIcmp { artifact, pair } => {
            decoder()?.check_icmp_traffic(
                &open(artifact)?,
                pair.src,
                pair.dst,
            )?;
            println!("ok: ICMP from {} to {}", pair.src, pair.dst);
        }

        Command::Summary { artifacts } => {
            let mut rows = vec![];
            for path in artifacts {
                rows.push((path.as_path(), open(path)?.summary()?));
            }
            print_summaries(&rows)?;
        }

        Command::Capture { host, out, seconds } => {
            let remote = Arc::new(SshRemote::new(cfg.ssh.clone(), &log));
            let session =
                CaptureSession::start(remote, host, &cfg.capture, &log)?;
            info!(log, "capturing"; "host" => host, "seconds" => seconds);
            std::thread::sleep(Duration::from_secs(*seconds));
            let artifact = session.finish(out)?;
            print_summaries(&[(artifact.path(), artifact.summary()?)])?;
        }
    }

    Ok(())
}
