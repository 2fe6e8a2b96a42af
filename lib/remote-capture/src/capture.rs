// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Remote capture sessions.
//!
//! A [`CaptureSession`] runs `tcpdump` on a cluster node for as long as the
//! session is alive. The capture runs on a background watcher thread which
//! blocks on the remote command; the calling scenario is free to generate
//! traffic in the meantime. Closing the session retrieves the capture file,
//! terminates the remote process and collects the watcher's result.
//!
//! ```text
//!   start ──> Running ──finish──> Stopping ──> Retrieved
//!               │
//!               └──abort/drop/error──> Failed
//! ```
//!
//! The remote process is terminated exactly once on every exit path:
//! [`CaptureSession::finish`], [`CaptureSession::abort`], or the session
//! simply going out of scope (e.g. a failed assertion unwinding through the
//! scenario). Two sessions must never run on the same host at the same time;
//! they share the capture file path and terminate the capture program by
//! name.

use crate::artifact::CaptureArtifact;
use crate::artifact::CaptureArtifactError;
use crate::remote::ExecOutput;
use crate::remote::Remote;
use crate::remote::RemoteCmd;
use crate::remote::RemoteError;
use serde::Deserialize;
use slog::Logger;
use slog::info;
use slog::warn;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tunnel_api::VXLAN_PORT;

/// Where the remote capture is written unless configured otherwise.
pub const CAPTURE_REMOTE_PATH: &str = "/tmp/vxlan.log";

/// Errors related to capture sessions.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The capture exited before the session was handed to the caller.
    #[error(
        "capture on {host} failed to start (exit code {exit_code}): {stderr}"
    )]
    StartFailed { host: String, exit_code: i32, stderr: String },

    /// The background capture reported a failure when it was collected.
    #[error("capture on {host} failed: {reason}")]
    CaptureFailed { host: String, reason: String },

    #[error("failed to spawn capture watcher: {0}")]
    Watcher(std::io::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Artifact(#[from] CaptureArtifactError),
}

fn default_interface() -> String {
    "any".to_string()
}

fn default_port() -> u16 {
    VXLAN_PORT
}

fn default_remote_path() -> String {
    CAPTURE_REMOTE_PATH.to_string()
}

fn default_program() -> String {
    "tcpdump".to_string()
}

fn default_startup_grace_ms() -> u64 {
    1000
}

fn default_join_timeout_ms() -> u64 {
    2000
}

/// What to capture and how long to wait on the capture process.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CaptureSpec {
    /// The interface to listen on.
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Only traffic to or from this port is captured.
    #[serde(default = "default_port")]
    pub port: u16,

    /// The capture file on the remote host.
    #[serde(default = "default_remote_path")]
    pub remote_path: String,

    /// The capture program. It is also the process name used to terminate
    /// the capture.
    #[serde(default = "default_program")]
    pub program: String,

    /// A capture that exits within this window never started.
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,

    /// How long closing a session waits for the watcher after the remote
    /// process has been terminated.
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

impl Default for CaptureSpec {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            port: default_port(),
            remote_path: default_remote_path(),
            program: default_program(),
            startup_grace_ms: default_startup_grace_ms(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

impl CaptureSpec {
    /// Write every packet as it arrives (`-U`), verbosely and without name
    /// resolution, to the remote capture file.
    pub fn capture_cmd(&self) -> RemoteCmd {
        RemoteCmd::new(&self.program)
            .args(["-U", "-vvni", &self.interface, "port"])
            .arg(self.port)
            .args(["-w", &self.remote_path])
    }

    pub fn kill_cmd(&self) -> RemoteCmd {
        RemoteCmd::new("killall").arg(&self.program)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CaptureState {
    Created,
    Running,
    Stopping,
    Retrieved,
    Failed,
}

type WatcherResult = Result<ExecOutput, RemoteError>;

struct Watcher {
    rx: mpsc::Receiver<WatcherResult>,
    handle: JoinHandle<()>,
}

/// A running capture on a remote host. See the module documentation.
pub struct CaptureSession {
    remote: Arc<dyn Remote>,
    host: String,
    spec: CaptureSpec,
    state: CaptureState,
    watcher: Option<Watcher>,
    killed: bool,
    log: Logger,
}

impl CaptureSession {
    /// Start capturing on `host`.
    ///
    /// Returns once the capture has survived the spec's startup grace
    /// period. A capture that exits before then is a setup failure and no
    /// session is returned.
    pub fn start(
        remote: Arc<dyn Remote>,
        host: &str,
        spec: &CaptureSpec,
        log: &Logger,
    ) -> Result<Self, CaptureError> {
        let log = log.new(slog::o!("host" => host.to_string()));
        let mut session = Self {
            remote,
            host: host.to_string(),
            spec: spec.clone(),
            state: CaptureState::Created,
            watcher: None,
            killed: false,
            log,
        };

        let cmd = session.spec.capture_cmd();
        info!(session.log, "starting capture"; "cmd" => %cmd);

        let (tx, rx) = mpsc::channel();
        let remote = Arc::clone(&session.remote);
        let host = session.host.clone();
        let handle = thread::Builder::new()
            .name(format!("capture-{host}"))
            .spawn(move || {
                let res = remote.execute(&host, &cmd);
                // The session may already have given up on us.
                let _ = tx.send(res);
            })
            .map_err(CaptureError::Watcher)?;

        session.state = CaptureState::Running;
        let early = match rx.recv_timeout(spec.startup_grace()) {
            Err(RecvTimeoutError::Timeout) => None,
            Ok(res) => Some(res),
            Err(RecvTimeoutError::Disconnected) => Some(Ok(ExecOutput {
                exit_code: -1,
                stderr: "capture watcher exited without a result".into(),
                ..Default::default()
            })),
        };
        session.watcher = Some(Watcher { rx, handle });

        let Some(res) = early else {
            return Ok(session);
        };

        // The capture is already gone; clean up whatever it left behind
        // and report the start failure rather than any cleanup failure.
        session.state = CaptureState::Failed;
        if let Err(e) = session.kill() {
            warn!(session.log, "failed to terminate capture"; "error" => %e);
        }
        if let Some(watcher) = session.watcher.take() {
            let _ = watcher.handle.join();
        }

        Err(match res {
            Ok(out) => CaptureError::StartFailed {
                host: session.host.clone(),
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            },
            Err(e) => CaptureError::Remote(e),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn spec(&self) -> &CaptureSpec {
        &self.spec
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Close the session normally: retrieve the capture file to
    /// `local_path`, terminate the remote capture, then collect the
    /// watcher's result.
    ///
    /// Retrieval happens before termination so the capture is not cut short.
    /// Termination and collection happen even when retrieval fails; the
    /// first failure in retrieve, collect, terminate order is returned.
    pub fn finish(
        mut self,
        local_path: &Path,
    ) -> Result<CaptureArtifact, CaptureError> {
        self.state = CaptureState::Stopping;

        info!(self.log, "retrieving capture";
            "remote" => &self.spec.remote_path,
            "local" => %local_path.display()
        );
        let retrieved = self
            .remote
            .download(&self.host, &self.spec.remote_path, local_path)
            .map_err(CaptureError::from);
        let killed = self.kill().map_err(CaptureError::from);
        let joined = self.join();

        let mut errors =
            [retrieved.err(), joined.err(), killed.err()].into_iter().flatten();
        if let Some(first) = errors.next() {
            self.state = CaptureState::Failed;
            for e in errors {
                warn!(self.log, "additional capture failure"; "error" => %e);
            }
            return Err(first);
        }

        let artifact = CaptureArtifact::open(local_path).inspect_err(|_| {
            self.state = CaptureState::Failed;
        })?;
        self.state = CaptureState::Retrieved;
        info!(self.log, "capture retrieved";
            "path" => %artifact.path().display()
        );
        Ok(artifact)
    }

    /// Close the session after a failure in the scenario: terminate the
    /// remote capture and collect the watcher without retrieving anything.
    ///
    /// Nothing here is reported to the caller; the scenario's own failure is
    /// the one that matters.
    pub fn abort(mut self) {
        self.cleanup();
    }

    fn cleanup(&mut self) {
        self.state = CaptureState::Failed;
        if let Err(e) = self.kill() {
            warn!(self.log, "failed to terminate capture"; "error" => %e);
        }
        if let Err(e) = self.join() {
            warn!(self.log, "capture did not exit cleanly"; "error" => %e);
        }
    }

    fn kill(&mut self) -> Result<(), RemoteError> {
        if self.killed {
            return Ok(());
        }
        self.killed = true;

        let cmd = self.spec.kill_cmd();
        info!(self.log, "terminating capture"; "cmd" => %cmd);
        let out = self.remote.execute(&self.host, &cmd)?;
        out.check(&self.host, &cmd)?;
        Ok(())
    }

    fn join(&mut self) -> Result<(), CaptureError> {
        let Some(watcher) = self.watcher.take() else {
            return Ok(());
        };

        let res = match watcher.rx.recv_timeout(self.spec.join_timeout()) {
            Ok(res) => res,
            Err(RecvTimeoutError::Timeout) => {
                // The remote process has been told to go away; if its ssh
                // session lingers we leave the watcher behind rather than
                // hang the scenario.
                warn!(self.log, "capture watcher still running, detaching";
                    "timeout_ms" => self.spec.join_timeout_ms
                );
                return Ok(());
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = watcher.handle.join();
                return Err(CaptureError::CaptureFailed {
                    host: self.host.clone(),
                    reason: "capture watcher exited without a result".into(),
                });
            }
        };
        let _ = watcher.handle.join();

        match res {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(CaptureError::CaptureFailed {
                host: self.host.clone(),
                reason: format!(
                    "{} exited with {}: {}",
                    self.spec.program,
                    out.exit_code,
                    out.stderr.trim()
                ),
            }),
            Err(e) => Err(CaptureError::CaptureFailed {
                host: self.host.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

impl Drop for CaptureSession {
    /// A session dropped while still running is aborted.
    fn drop(&mut self) {
        if self.state == CaptureState::Running {
            warn!(self.log, "capture session dropped while running");
            self.cleanup();
        }
    }
}

/// Run `body` while capturing on `host`.
///
/// On success the capture is retrieved to `local_path` and returned
/// alongside the body's value. When the body fails the capture is torn down
/// without being retrieved and the body's error is returned untouched.
pub fn with_capture<T, E, F>(
    remote: Arc<dyn Remote>,
    host: &str,
    spec: &CaptureSpec,
    local_path: &Path,
    log: &Logger,
    body: F,
) -> Result<(T, CaptureArtifact), E>
where
    F: FnOnce() -> Result<T, E>,
    E: From<CaptureError>,
{
    let session = CaptureSession::start(remote, host, spec, log)?;
    match body() {
        Ok(val) => {
            let artifact = session.finish(local_path)?;
            Ok((val, artifact))
        }
        Err(e) => {
            session.abort();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_commands() {
        let spec = CaptureSpec::default();
        assert_eq!(
            spec.capture_cmd().render(),
            "tcpdump -U -vvni any port 4789 -w /tmp/vxlan.log"
        );
        assert_eq!(spec.kill_cmd().render(), "killall tcpdump");
    }

    #[test]
    fn custom_spec() {
        let spec = CaptureSpec {
            interface: "br-ex".into(),
            port: 8472,
            remote_path: "/var/tmp/cap 1.pcap".into(),
            ..Default::default()
        };
        assert_eq!(
            spec.capture_cmd().render(),
            "tcpdump -U -vvni br-ex port 8472 -w '/var/tmp/cap 1.pcap'"
        );
        assert_eq!(spec.join_timeout(), Duration::from_secs(2));
    }
}
