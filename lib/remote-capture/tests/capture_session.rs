// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Capture session lifecycle against a fake node.

use anyhow::Result;
use anyhow::anyhow;
use capture_test_utils::CaptureBehavior;
use capture_test_utils::Endpoint;
use capture_test_utils::Event;
use capture_test_utils::FakeRemote;
use capture_test_utils::frames;
use capture_test_utils::pcap::capture_bytes;
use remote_capture::capture::CaptureError;
use remote_capture::capture::CaptureSession;
use remote_capture::capture::CaptureSpec;
use remote_capture::capture::with_capture;
use remote_capture::remote::Remote;
use remote_capture::remote::RemoteCmd;
use remote_capture::remote::RemoteError;
use std::net::Ipv4Addr;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tunnel_api::Vni;

const HOST: &str = "10.109.0.6";

fn spec() -> CaptureSpec {
    CaptureSpec { startup_grace_ms: 50, ..Default::default() }
}

fn scratch() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vxlan.log");
    (dir, path)
}

fn ping(remote: &FakeRemote) -> Result<()> {
    let cmd = RemoteCmd::new("ping").args(["-c", "3", "10.0.0.4"]);
    remote.execute(HOST, &cmd)?;
    Ok(())
}

#[test]
fn success_retrieves_before_terminating() -> Result<()> {
    let a =
        Endpoint::new([0xfa, 0x16, 0x3e, 0, 0, 1], Ipv4Addr::new(10, 0, 0, 3));
    let b =
        Endpoint::new([0xfa, 0x16, 0x3e, 0, 0, 2], Ipv4Addr::new(10, 0, 0, 4));
    let hv1 = Endpoint::new([2, 0, 0, 0, 0, 1], Ipv4Addr::new(192, 168, 2, 6));
    let hv2 = Endpoint::new([2, 0, 0, 0, 0, 2], Ipv4Addr::new(192, 168, 2, 7));
    let vni = Vni::new(1701u32).unwrap();
    let req = frames::gen_icmpv4_echo_req(&a, &b, 1, 1, b"abcd");
    let frame = frames::encap(&hv1, &hv2, 49152, vni, &req);

    let remote =
        Arc::new(FakeRemote::new().artifact(capture_bytes([&frame[..]])));
    let (_dir, local) = scratch();
    let log = remote_capture::log::discard();

    let (_, artifact) =
        with_capture(remote.clone(), HOST, &spec(), &local, &log, || {
            ping(&remote)
        })?;

    assert_eq!(
        remote.events(),
        [
            Event::Start,
            Event::Exec("ping".into()),
            Event::Download,
            Event::Kill,
            Event::CaptureExited,
        ]
    );
    assert_eq!(artifact.path(), local);
    assert_eq!(artifact.summary()?.packets, 1);
    Ok(())
}

#[test]
fn failure_in_scope_tears_down_without_retrieving() {
    let remote = Arc::new(FakeRemote::new());
    let (_dir, local) = scratch();
    let log = remote_capture::log::discard();

    let res: Result<((), _)> =
        with_capture(remote.clone(), HOST, &spec(), &local, &log, || {
            ping(&remote)?;
            Err(anyhow!("instance unreachable"))
        });

    let err = res.unwrap_err();
    assert_eq!(err.to_string(), "instance unreachable");
    assert_eq!(remote.count(&Event::Kill), 1);
    assert_eq!(remote.count(&Event::Download), 0);
    assert!(remote.events().contains(&Event::CaptureExited));
    assert!(!local.exists());
}

#[test]
fn panic_in_scope_tears_down() {
    let remote = Arc::new(FakeRemote::new());
    let (_dir, local) = scratch();
    let log = remote_capture::log::discard();

    let res = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let scope = || -> Result<()> { panic!("assertion failed in scenario") };
        with_capture(remote.clone(), HOST, &spec(), &local, &log, scope)
    }));

    assert!(res.is_err());
    assert_eq!(remote.count(&Event::Kill), 1);
    assert_eq!(remote.count(&Event::Download), 0);
    assert!(remote.wait_for_exit(Duration::from_secs(2)));
}

#[test]
fn start_failure_never_runs_scope() {
    let remote =
        Arc::new(FakeRemote::new().behavior(CaptureBehavior::FailToStart {
            exit_code: 1,
            stderr: "tcpdump: eth9: No such device exists\n".into(),
        }));
    let (_dir, local) = scratch();
    let log = remote_capture::log::discard();

    let mut ran = false;
    let res = with_capture(remote.clone(), HOST, &spec(), &local, &log, || {
        ran = true;
        Ok::<_, anyhow::Error>(())
    });

    assert!(!ran);
    let err = res.unwrap_err();
    match err.downcast_ref::<CaptureError>() {
        Some(CaptureError::StartFailed { host, exit_code, stderr }) => {
            assert_eq!(host, HOST);
            assert_eq!(*exit_code, 1);
            assert_eq!(stderr, "tcpdump: eth9: No such device exists");
        }
        other => panic!("expected StartFailed, got {other:?}"),
    }
    assert_eq!(remote.count(&Event::Download), 0);
}

#[test]
fn background_failure_surfaces_on_finish() {
    let remote =
        Arc::new(FakeRemote::new().behavior(CaptureBehavior::DieAfter {
            after: Duration::from_millis(100),
            exit_code: 1,
            stderr: "tcpdump: pcap_loop: The interface went down".into(),
        }));
    let (_dir, local) = scratch();
    let log = remote_capture::log::discard();

    let session =
        CaptureSession::start(remote.clone(), HOST, &spec(), &log).unwrap();
    assert!(remote.wait_for_exit(Duration::from_secs(2)));

    match session.finish(&local) {
        Err(CaptureError::CaptureFailed { host, reason }) => {
            assert_eq!(host, HOST);
            assert!(reason.contains("interface went down"), "{reason}");
        }
        other => panic!("expected CaptureFailed, got {other:?}"),
    }
    assert_eq!(remote.count(&Event::Download), 1);
    assert_eq!(remote.count(&Event::Kill), 1);
}

#[test]
fn retrieval_failure_still_terminates() {
    let remote = Arc::new(FakeRemote::new().fail_download());
    let (_dir, local) = scratch();
    let log = remote_capture::log::discard();

    let session =
        CaptureSession::start(remote.clone(), HOST, &spec(), &log).unwrap();
    let err = session.finish(&local).unwrap_err();

    assert!(matches!(
        err,
        CaptureError::Remote(RemoteError::Transfer { .. })
    ));
    assert_eq!(remote.count(&Event::Kill), 1);
    assert!(remote.events().contains(&Event::CaptureExited));
}

#[test]
fn kill_failure_is_reported_on_success_path() {
    let remote = Arc::new(FakeRemote::new().fail_kill());
    let (_dir, local) = scratch();
    let log = remote_capture::log::discard();

    let session =
        CaptureSession::start(remote.clone(), HOST, &spec(), &log).unwrap();
    let err = session.finish(&local).unwrap_err();

    assert!(matches!(
        err,
        CaptureError::Remote(RemoteError::Connect { .. })
    ));
    assert_eq!(remote.count(&Event::Download), 1);
    assert_eq!(remote.count(&Event::Kill), 1);
}

#[test]
fn abort_and_drop_kill_once() {
    let log = remote_capture::log::discard();

    let remote = Arc::new(FakeRemote::new());
    let session =
        CaptureSession::start(remote.clone(), HOST, &spec(), &log).unwrap();
    session.abort();
    assert_eq!(remote.count(&Event::Kill), 1);
    assert_eq!(remote.count(&Event::Download), 0);

    let remote = Arc::new(FakeRemote::new());
    let session =
        CaptureSession::start(remote.clone(), HOST, &spec(), &log).unwrap();
    drop(session);
    assert_eq!(remote.count(&Event::Kill), 1);
    assert!(remote.events().contains(&Event::CaptureExited));
}
