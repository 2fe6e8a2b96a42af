// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Reading huge page pools and guest memory backing on compute nodes.

use crate::remote::Remote;
use crate::remote::RemoteCmd;
use crate::remote::RemoteError;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HugePageError {
    #[error("unexpected huge page data: {0}")]
    Parse(String),

    #[error("instance {0} is not backed by huge pages")]
    NotBacked(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// The pool of huge pages of one size on one NUMA node.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HugePageCounts {
    pub total: u64,
    pub free: u64,
}

impl HugePageCounts {
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }
}

/// Huge page pools of one page size, by NUMA node.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NumaHugePages {
    pub size_kb: u64,
    pub nodes: BTreeMap<u32, HugePageCounts>,
}

impl NumaHugePages {
    pub fn total(&self) -> u64 {
        self.nodes.values().map(|c| c.total).sum()
    }

    pub fn free(&self) -> u64 {
        self.nodes.values().map(|c| c.free).sum()
    }

    pub fn used(&self) -> u64 {
        self.total().saturating_sub(self.free())
    }

    /// Parse `grep -H` output over the per-node sysfs counters, i.e. lines
    /// like
    ///
    /// ```text
    /// /sys/devices/system/node/node0/hugepages/hugepages-2048kB/free_hugepages:512
    /// ```
    ///
    /// Every node must report both `nr_hugepages` and `free_hugepages`.
    pub fn parse(size_kb: u64, text: &str) -> Result<Self, HugePageError> {
        let mut seen: BTreeMap<u32, (Option<u64>, Option<u64>)> =
            BTreeMap::new();

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (path, value) = line
                .rsplit_once(':')
                .ok_or_else(|| HugePageError::Parse(line.to_string()))?;
            let value: u64 = value
                .trim()
                .parse()
                .map_err(|_| HugePageError::Parse(line.to_string()))?;

            let node = path
                .split('/')
                .find_map(|c| c.strip_prefix("node")?.parse::<u32>().ok())
                .ok_or_else(|| HugePageError::Parse(line.to_string()))?;
            let (total, free) = seen.entry(node).or_default();

            match path.rsplit('/').next() {
                Some("nr_hugepages") => *total = Some(value),
                Some("free_hugepages") => *free = Some(value),
                // surplus_hugepages and friends
                _ => {}
            }
        }

        let mut nodes = BTreeMap::new();
        for (node, counters) in seen {
            let (Some(total), Some(free)) = counters else {
                return Err(HugePageError::Parse(format!(
                    "node{node} lacks nr_hugepages or free_hugepages"
                )));
            };
            nodes.insert(node, HugePageCounts { total, free });
        }

        Ok(Self { size_kb, nodes })
    }
}

/// Read the huge page pools of size `size_kb` on every NUMA node of `host`.
pub fn read(
    remote: &dyn Remote,
    host: &str,
    size_kb: u64,
) -> Result<NumaHugePages, HugePageError> {
    let script = format!(
        "grep -H . /sys/devices/system/node/node*/hugepages/\
         hugepages-{size_kb}kB/*_hugepages"
    );
    let cmd = RemoteCmd::new("sh").arg("-c").arg(script);
    let out = remote.execute(host, &cmd)?;
    out.check(host, &cmd)?;
    NumaHugePages::parse(size_kb, &out.stdout)
}

/// Extract the page size, in KiB, backing a libvirt domain from its XML
/// definition. Returns `None` if the domain has no `<hugepages>` backing.
pub fn parse_domain_page_size(
    xml: &str,
) -> Result<Option<u64>, HugePageError> {
    let Some(start) = xml.find("<hugepages>") else {
        return Ok(None);
    };
    let section = &xml[start..];
    let end = section.find("</hugepages>").unwrap_or(section.len());
    let section = &section[..end];

    let Some(page) = section.find("<page ").map(|i| &section[i..]) else {
        return Ok(None);
    };
    let page = &page[..page.find('>').unwrap_or(page.len())];

    let size: u64 = attr(page, "size")
        .ok_or_else(|| HugePageError::Parse(page.to_string()))?
        .parse()
        .map_err(|_| HugePageError::Parse(page.to_string()))?;

    // libvirt defaults to KiB.
    let scale = match attr(page, "unit").unwrap_or("KiB") {
        "b" | "bytes" => return Ok(Some(size / 1024)),
        "k" | "KiB" => 1,
        "M" | "MiB" => 1024,
        "G" | "GiB" => 1024 * 1024,
        unit => return Err(HugePageError::Parse(format!("page unit {unit}"))),
    };

    size
        .checked_mul(scale)
        .map(Some)
        .ok_or_else(|| HugePageError::Parse(format!("page size {size}")))
}

fn attr<'a>(elem: &'a str, name: &str) -> Option<&'a str> {
    for quote in ['\'', '"'] {
        let key = format!(" {name}={quote}");
        if let Some(i) = elem.find(&key) {
            let rest = &elem[i + key.len()..];
            return rest.find(quote).map(|end| &rest[..end]);
        }
    }
    None
}

/// The huge page size, in KiB, backing the libvirt domain `instance` on
/// `host`.
pub fn instance_page_size_kb(
    remote: &dyn Remote,
    host: &str,
    instance: &str,
) -> Result<u64, HugePageError> {
    let cmd = RemoteCmd::new("virsh").arg("dumpxml").arg(instance);
    let out = remote.execute(host, &cmd)?;
    out.check(host, &cmd)?;
    parse_domain_page_size(&out.stdout)?
        .ok_or_else(|| HugePageError::NotBacked(instance.to_string()))
}
