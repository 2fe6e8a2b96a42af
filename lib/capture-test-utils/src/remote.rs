// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! An in-process stand-in for a cluster node.

use crate::pcap::capture_bytes;
use remote_capture::remote::ExecOutput;
use remote_capture::remote::Remote;
use remote_capture::remote::RemoteCmd;
use remote_capture::remote::RemoteError;
use std::path::Path;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;

/// Something the fake node observed, in the order it happened.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// The capture program was launched.
    Start,
    /// Any other command, by program name.
    Exec(String),
    /// The capture file was copied back.
    Download,
    /// The capture program was told to exit.
    Kill,
    /// The capture program returned.
    CaptureExited,
}

/// How the fake capture program behaves.
#[derive(Clone, Debug)]
pub enum CaptureBehavior {
    /// Run until killed, then exit with `exit_code`.
    UntilKilled { exit_code: i32 },
    /// Exit immediately, as when the interface does not exist.
    FailToStart { exit_code: i32, stderr: String },
    /// Exit on its own after `after`, unless killed first.
    DieAfter { after: Duration, exit_code: i32, stderr: String },
}

#[derive(Default)]
struct State {
    events: Vec<Event>,
    killed: bool,
}

/// A fake [`Remote`] recording every interaction.
///
/// Commands whose program is the capture program block like a real capture
/// until a `killall` arrives. The kill and download steps can be made to
/// fail, and downloads write a configurable pcap file.
pub struct FakeRemote {
    capture_program: String,
    behavior: CaptureBehavior,
    artifact: Vec<u8>,
    fail_download: bool,
    fail_kill: bool,
    state: Mutex<State>,
    cv: Condvar,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        Self {
            capture_program: "tcpdump".to_string(),
            behavior: CaptureBehavior::UntilKilled { exit_code: 0 },
            artifact: capture_bytes([]),
            fail_download: false,
            fail_kill: false,
            state: Mutex::new(State::default()),
            cv: Condvar::new(),
        }
    }

    pub fn behavior(mut self, behavior: CaptureBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// The bytes a download writes locally.
    pub fn artifact(mut self, bytes: Vec<u8>) -> Self {
        self.artifact = bytes;
        self
    }

    pub fn fail_download(mut self) -> Self {
        self.fail_download = true;
        self
    }

    pub fn fail_kill(mut self) -> Self {
        self.fail_kill = true;
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.state.lock().unwrap().events.iter().filter(|e| *e == event).count()
    }

    /// Wait for the capture program to return, so that its exit is in the
    /// event log even when the session detached from it.
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (state, _) = self
            .cv
            .wait_timeout_while(state, timeout, |s| {
                !s.events.contains(&Event::CaptureExited)
            })
            .unwrap();
        state.events.contains(&Event::CaptureExited)
    }

    fn record(&self, event: Event) {
        self.state.lock().unwrap().events.push(event);
        self.cv.notify_all();
    }

    fn run_capture(&self) -> ExecOutput {
        self.record(Event::Start);

        let out = match &self.behavior {
            CaptureBehavior::FailToStart { exit_code, stderr } => ExecOutput {
                exit_code: *exit_code,
                stderr: stderr.clone(),
                ..Default::default()
            },

            CaptureBehavior::UntilKilled { exit_code } => {
                let state = self.state.lock().unwrap();
                let _state = self.cv.wait_while(state, |s| !s.killed).unwrap();
                ExecOutput { exit_code: *exit_code, ..Default::default() }
            }

            CaptureBehavior::DieAfter { after, exit_code, stderr } => {
                let state = self.state.lock().unwrap();
                let (state, _) = self
                    .cv
                    .wait_timeout_while(state, *after, |s| !s.killed)
                    .unwrap();
                if state.killed {
                    ExecOutput::default()
                } else {
                    ExecOutput {
                        exit_code: *exit_code,
                        stderr: stderr.clone(),
                        ..Default::default()
                    }
                }
            }
        };

        self.record(Event::CaptureExited);
        out
    }
}

impl Remote for FakeRemote {
    fn execute(
        &self,
        host: &str,
        cmd: &RemoteCmd,
    ) -> Result<ExecOutput, RemoteError> {
        if cmd.program() == self.capture_program {
            return Ok(self.run_capture());
        }

        if cmd.program() == "killall" {
            {
                let mut state = self.state.lock().unwrap();
                state.events.push(Event::Kill);
                state.killed = true;
            }
            self.cv.notify_all();

            if self.fail_kill {
                return Err(RemoteError::Connect {
                    host: host.to_string(),
                    stderr: "Connection reset by peer".to_string(),
                });
            }
            return Ok(ExecOutput::default());
        }

        self.record(Event::Exec(cmd.program().to_string()));
        Ok(ExecOutput::default())
    }

    fn download(
        &self,
        host: &str,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), RemoteError> {
        self.record(Event::Download);
        if self.fail_download {
            return Err(RemoteError::Transfer {
                host: host.to_string(),
                path: remote_path.to_string(),
                stderr: "No such file or directory".to_string(),
            });
        }

        std::fs::write(local_path, &self.artifact)?;
        Ok(())
    }
}
