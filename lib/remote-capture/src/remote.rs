// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Running commands on, and copying files from, cluster nodes.

use serde::Deserialize;
use slog::Logger;
use slog::debug;
use std::fmt;
use std::fmt::Display;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Output;
use thiserror::Error;

/// The exit status `ssh(1)` and `scp(1)` use for their own failures, as
/// opposed to those of the remote command.
const SSH_FAILURE: i32 = 255;

/// Errors related to remote execution and file transfer.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("could not connect to {host}: {stderr}")]
    Connect { host: String, stderr: String },

    #[error("`{cmd}` on {host} exited with {exit_code}: {stderr}")]
    CommandFailed { host: String, cmd: String, exit_code: i32, stderr: String },

    #[error("failed to transfer {path} from {host}: {stderr}")]
    Transfer { host: String, path: String, stderr: String },

    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A command to run on a remote host.
///
/// The program and each of its arguments stay separate words all the way to
/// the remote shell. Values interpolated into the command (addresses,
/// namespace names, identifiers) are quoted when rendered and can never be
/// reinterpreted as shell syntax.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCmd {
    program: String,
    args: Vec<String>,
}

impl RemoteCmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: vec![] }
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.args.extend(args.into_iter().map(|a| a.to_string()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// The full argument vector, program first.
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }

    /// Render this command as a single line for a POSIX shell.
    pub fn render(&self) -> String {
        self.argv().into_iter().map(quote).collect::<Vec<_>>().join(" ")
    }
}

impl Display for RemoteCmd {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '-' | '_' | '.' | '/' | '=' | ':' | ',' | '@' | '%' | '+'
        )
}

fn quote(word: &str) -> String {
    if !word.is_empty() && word.chars().all(is_shell_safe) {
        return word.to_string();
    }

    format!("'{}'", word.replace('\'', r"'\''"))
}

/// The result of a command that ran to completion on a remote host.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit code into a [`RemoteError::CommandFailed`].
    pub fn check(
        &self,
        host: &str,
        cmd: &RemoteCmd,
    ) -> Result<&Self, RemoteError> {
        if self.success() {
            Ok(self)
        } else {
            Err(RemoteError::CommandFailed {
                host: host.to_string(),
                cmd: cmd.render(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Remote execution facility.
///
/// Implementations must be shareable across threads: a capture session
/// hands a clone of its remote to the background capture watcher.
pub trait Remote: Send + Sync {
    /// Run `cmd` on `host` and wait for it to finish.
    ///
    /// A non-zero exit code is not an error here; it is reported in the
    /// returned [`ExecOutput`]. Only failing to reach the host is.
    fn execute(
        &self,
        host: &str,
        cmd: &RemoteCmd,
    ) -> Result<ExecOutput, RemoteError>;

    /// Copy `remote_path` on `host` to `local_path`.
    fn download(
        &self,
        host: &str,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), RemoteError>;
}

fn default_user() -> String {
    "root".to_string()
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

/// How to reach cluster nodes over SSH.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub identity_files: Vec<PathBuf>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            port: default_port(),
            identity_files: vec![],
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// A [`Remote`] driving the system OpenSSH client.
#[derive(Clone)]
pub struct SshRemote {
    cfg: SshConfig,
    log: Logger,
}

impl SshRemote {
    pub fn new(cfg: SshConfig, log: &Logger) -> Self {
        Self { cfg, log: log.new(slog::o!("component" => "ssh")) }
    }

    pub fn config(&self) -> &SshConfig {
        &self.cfg
    }

    fn options(&self) -> Vec<String> {
        let mut opts = vec![];
        for opt in [
            "BatchMode=yes".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "LogLevel=ERROR".to_string(),
            format!("ConnectTimeout={}", self.cfg.connect_timeout_secs),
        ] {
            opts.push("-o".to_string());
            opts.push(opt);
        }

        for key in &self.cfg.identity_files {
            opts.push("-i".to_string());
            opts.push(key.display().to_string());
        }

        opts
    }

    fn run(
        program: &'static str,
        cmd: &mut Command,
    ) -> Result<Output, RemoteError> {
        cmd.output().map_err(|source| RemoteError::Spawn { program, source })
    }
}

impl Remote for SshRemote {
    fn execute(
        &self,
        host: &str,
        cmd: &RemoteCmd,
    ) -> Result<ExecOutput, RemoteError> {
        let line = cmd.render();
        debug!(self.log, "execute"; "host" => host, "cmd" => &line);

        let out = Self::run(
            "ssh",
            Command::new("ssh")
                .args(self.options())
                .arg("-p")
                .arg(self.cfg.port.to_string())
                .arg("--")
                .arg(format!("{}@{}", self.cfg.user, host))
                .arg(&line),
        )?;

        let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
        // A remote command killed by a signal has no exit code.
        let exit_code = out.status.code().unwrap_or(-1);
        if exit_code == SSH_FAILURE {
            return Err(RemoteError::Connect {
                host: host.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        debug!(self.log, "executed"; "host" => host, "exit_code" => exit_code);
        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr,
        })
    }

    fn download(
        &self,
        host: &str,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), RemoteError> {
        debug!(self.log, "download";
            "host" => host,
            "remote" => remote_path,
            "local" => %local_path.display()
        );

        let out = Self::run(
            "scp",
            Command::new("scp")
                .args(self.options())
                .arg("-P")
                .arg(self.cfg.port.to_string())
                .arg("--")
                .arg(format!("{}@{}:{}", self.cfg.user, host, remote_path))
                .arg(local_path),
        )?;

        if !out.status.success() {
            return Err(RemoteError::Transfer {
                host: host.to_string(),
                path: remote_path.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_words_are_not_quoted() {
        let cmd = RemoteCmd::new("tcpdump")
            .args(["-U", "-vvni", "any", "port"])
            .arg(4789)
            .args(["-w", "/tmp/vxlan.log"]);
        assert_eq!(
            cmd.render(),
            "tcpdump -U -vvni any port 4789 -w /tmp/vxlan.log"
        );
        assert_eq!(cmd.argv().len(), 8);
        assert_eq!(cmd.program(), "tcpdump");
    }

    #[test]
    fn metacharacters_are_quoted() {
        let cmd = RemoteCmd::new("ping").arg("10.0.0.1; rm -rf /");
        assert_eq!(cmd.render(), "ping '10.0.0.1; rm -rf /'");

        let cmd = RemoteCmd::new("echo").arg("it's").arg("");
        assert_eq!(cmd.render(), r"echo 'it'\''s' ''");

        let cmd = RemoteCmd::new("grep").arg("$(id)").arg("a|b");
        assert_eq!(cmd.render(), "grep '$(id)' 'a|b'");
    }

    #[test]
    fn check_exit_code() {
        let cmd = RemoteCmd::new("false");
        let ok = ExecOutput::default();
        assert!(ok.check("node-1", &cmd).is_ok());

        let bad = ExecOutput { exit_code: 1, stderr: "nope\n".into(), ..ok };
        match bad.check("node-1", &cmd) {
            Err(RemoteError::CommandFailed { host, exit_code, stderr, .. }) => {
                assert_eq!(host, "node-1");
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "nope");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn ssh_options() {
        let cfg = SshConfig {
            identity_files: vec!["/root/.ssh/id_rsa".into()],
            ..Default::default()
        };
        let remote = SshRemote::new(cfg, &crate::log::discard());
        let opts = remote.options();
        assert!(opts.contains(&"BatchMode=yes".to_string()));
        assert!(opts.contains(&"ConnectTimeout=10".to_string()));
        assert_eq!(&opts[opts.len() - 2..], ["-i", "/root/.ssh/id_rsa"]);
    }
}
