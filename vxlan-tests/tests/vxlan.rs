// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use vxlan_tests::Harness;
use vxlan_tests::ZONE;
use vxlan_tests::skip_unless;
use vxlan_tests::unique_name;

#[test]
#[ignore = "needs a deployed cloud"]
fn tunnel_established() -> Result<()> {
    let h = Harness::new()?;
    skip_unless!(h, h.env.is_vxlan(), "vxlan segmentation");
    let trace = h.trace()?;

    let fx = h.fixture()?;
    let router = h.cloud.create_router(&unique_name("router01"))?;
    let hosts = h.cloud.compute_hosts(ZONE)?;
    let compute_host = hosts.first().context("no compute hosts")?;
    let seg = h.segment("net01", "10.1.1.0/24", Some(&router))?;
    let server = h.boot("server01", &seg, &fx, Some(compute_host), None)?;

    let router_host = h
        .cloud
        .l3_agent_hosts(&router)?
        .into_iter()
        .next()
        .context("router has no L3 agent")?;
    let controller = h.node(&router_host)?;
    let compute = h.node(compute_host)?;

    for node in [controller, compute] {
        let ovs = h.ovs(node)?;
        assert!(ovs.has_bridge("br-tun"), "{} has no br-tun", node.fqdn);
    }

    let vm_ip = h.cloud.show_server(&server)?.fixed_ip()?;
    let ((), capture) = h.capture(compute, "vxlan", || {
        h.router_ping(&router, vm_ip)
    })?;

    trace.check_all_traffic_has_vni(&capture, seg.network.vni()?)?;
    Ok(())
}

#[test]
#[ignore = "needs a deployed cloud"]
fn vni_for_icmp_between_instances() -> Result<()> {
    let h = Harness::new()?;
    skip_unless!(h, h.env.is_vxlan(), "vxlan segmentation");
    skip_unless!(h, h.env.has_computes(2), "two or more computes");
    let trace = h.trace()?;

    let fx = h.fixture()?;
    let router = h.cloud.create_router(&unique_name("router01_02"))?;
    let hosts = h.cloud.compute_hosts(ZONE)?;
    let [host1, host2, ..] = hosts.as_slice() else {
        bail!("fewer than two compute hosts are up: {hosts:?}");
    };

    let seg1 = h.segment("net01", "10.1.1.0/24", Some(&router))?;
    let seg2 = h.segment("net02", "10.1.2.0/24", Some(&router))?;
    let server1 = h.boot("server01", &seg1, &fx, Some(host1), None)?;
    let server2 = h.boot("server02", &seg2, &fx, Some(host2), None)?;

    let (vni1, vni2) = (seg1.network.vni()?, seg2.network.vni()?);
    assert_ne!(vni1, vni2, "networks share a segmentation id");

    let ip1 = h.cloud.show_server(&server1)?.fixed_ip()?;
    let ip2 = h.cloud.show_server(&server2)?.fixed_ip()?;
    h.ping_from_vm(&server1, &seg1.network, &fx.key, ip2)?;

    let compute1 = h.node(host1)?;
    let compute2 = h.node(host2)?;
    let (((), vxlan2), vxlan1) = h.capture(compute1, "vxlan1", || {
        h.capture(compute2, "vxlan2", || {
            h.ping_from_vm(&server2, &seg2.network, &fx.key, ip1)
        })
    })?;

    // Each compute only sees the tunnel of the network its instance is on.
    trace.check_all_traffic_has_vni(&vxlan1, vni1)?;
    trace.check_all_traffic_has_vni(&vxlan2, vni2)?;
    Ok(())
}
