// Copyright 2026 The extrootfs Developers. All Rights Reserved.
//
// SPDX-License-Identifier: (Apache-2.0 AND BSD-3-Clause)

use log::*;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::{Error, Result};

/// A fully specified external command: program, arguments and an optional deadline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
    /// Arguments carry secrets and must stay out of logs and error messages.
    pub sensitive: bool,
}

impl CommandLine {
    pub fn new(program: &str) -> Self {
        CommandLine {
            program: program.to_string(),
            args: Vec::new(),
            timeout: None,
            sensitive: false,
        }
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Rendering safe for logs: arguments are elided for sensitive commands.
    pub fn describe(&self) -> String {
        if self.sensitive {
            format!("{} <{} arguments hidden>", self.program, self.args.len())
        } else {
            self.to_string()
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout followed by stderr, the way a combined pipe would present them.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }
}

/// Seam between the device-management logic and the host's command-line tools.
///
/// Every interaction with `qemu-img`, `qemu-nbd`, `iscsiadm`, `sg_persist` and friends goes
/// through this trait, so the protocols built on top of it can be driven by a scripted host.
pub trait Exec: Send + Sync {
    /// Runs `cmd` to completion.  A deadline expiry is reported as an `io::Error` of kind
    /// `TimedOut`; a non-zero exit status is *not* an error at this level.
    fn exec(&self, cmd: &CommandLine) -> io::Result<CommandOutput>;
}

/// Runs commands on the local host.
#[derive(Debug, Default)]
pub struct HostExec;

impl Exec for HostExec {
    fn exec(&self, cmd: &CommandLine) -> io::Result<CommandOutput> {
        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let Some(timeout) = cmd.timeout else {
            let output = child.wait_with_output()?;
            return Ok(CommandOutput {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        };

        // Drain the pipes on helper threads so a chatty child cannot block on a full pipe
        // while we wait for the deadline.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("'{}' did not finish within {timeout:?}", cmd.describe()),
                ));
            }
            thread::sleep(Duration::from_millis(20));
        };

        Ok(CommandOutput {
            status: status.code(),
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

/// Runs `cmd` and requires a zero exit status.  `op` names the operation for error reports.
pub fn run(exec: &dyn Exec, op: &'static str, cmd: &CommandLine) -> Result<CommandOutput> {
    debug!("{op}: {}", cmd.describe());
    let output = exec.exec(cmd).map_err(|e| spawn_error(op, cmd, e))?;
    if output.success() {
        Ok(output)
    } else {
        Err(Error::CommandFailed {
            op,
            command: cmd.describe(),
            status: output.status,
            output: output.combined(),
        })
    }
}

/// Same as `run()` but hands back non-zero exits to the caller instead of failing.
pub fn run_unchecked(
    exec: &dyn Exec,
    op: &'static str,
    cmd: &CommandLine,
) -> Result<CommandOutput> {
    debug!("{op}: {}", cmd.describe());
    exec.exec(cmd).map_err(|e| spawn_error(op, cmd, e))
}

fn spawn_error(op: &'static str, cmd: &CommandLine, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::TimedOut {
        Error::Timeout {
            op,
            what: format!("'{}' to finish", cmd.describe()),
        }
    } else {
        Error::Spawn {
            command: cmd.describe(),
            source: err,
        }
    }
}

/// A bounded retry schedule: at most `attempts` probes, sleeping `interval` after each miss.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Poll {
    pub interval: Duration,
    pub attempts: u32,
}

impl Poll {
    /// Kernel NBD attach/detach acknowledgement.
    pub const NBD: Poll = Poll {
        interval: Duration::from_secs(1),
        attempts: 30,
    };

    /// iSCSI login and device discovery.
    pub const ISCSI_LOGIN: Poll = Poll {
        interval: Duration::from_secs(5),
        attempts: 60,
    };

    pub const fn new(interval: Duration, attempts: u32) -> Self {
        Poll { interval, attempts }
    }

    /// Calls `probe` until it yields a value or the attempts are used up.
    pub fn until<T>(&self, mut probe: impl FnMut() -> Option<T>) -> Option<T> {
        for _ in 0..self.attempts {
            if let Some(value) = probe() {
                return Some(value);
            }
            thread::sleep(self.interval);
        }
        None
    }

    /// Upper bound of the time `until()` may spend sleeping.
    pub fn window(&self) -> Duration {
        self.interval * self.attempts
    }
}

/// Replaces `path` with `data` so that readers observe either the old or the new content.
pub fn write_file_atomic(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| Error::io(format!("create {}", dir.display()), e))?;

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .mode(mode)
            .open(&tmp_path)
            .map_err(|e| Error::io(format!("open {}", tmp_path.display()), e))?;
        file.write_all(data)
            .and_then(|_| file.sync_all())
            .map_err(|e| Error::io(format!("write {}", tmp_path.display()), e))?;
    }

    fs::rename(&tmp_path, path)
        .map_err(|e| Error::io(format!("commit {}", path.display()), e))?;
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| Error::io(format!("sync {}", dir.display()), e))
}
