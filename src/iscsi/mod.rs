// Copyright 2026 The extrootfs Developers. All Rights Reserved.
//
// SPDX-License-Identifier: (Apache-2.0 AND BSD-3-Clause)

/*!
 * iSCSI sessions for a single-LUN target.
 *
 * A [`Disk`] describes one target (IQN, static portal list, CHAP credentials) and, once attached,
 * the local block device that open-iscsi created for it.  All operations go through `iscsiadm`;
 * exclusive ownership of the LUN across nodes is handled separately by [`reservation`].
 */

pub mod reservation;

use log::*;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::qemu::image::path_str;
use crate::util::{run, run_unchecked, CommandLine, Exec, Poll};
use crate::{Error, Result};

pub use reservation::{host_key, preempt_lun, ReservationType};

/// Targets export exactly one LUN, always number 0.
pub const LUN: u32 = 0;

const IFACE: &str = "default";
const DEFAULT_PORT: &str = "3260";
const SESSION_DETAIL_TIMEOUT: Duration = Duration::from_secs(3);

// iscsiadm exit codes
const ISCSI_ERR_SESS_EXISTS: i32 = 15;
const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chap {
    pub username: String,
    pub password: String,
}

/// An iSCSI target and, once attached, the device bound to it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub portals: Vec<String>,
    pub iqn: String,
    pub lun: u32,
    pub session_secret: Chap,
    pub device_path: String,
    /// Persistent-reservation key this node holds the LUN under.
    #[serde(default)]
    pub reservation_key: Option<String>,
}

/// One row of `iscsiadm -m session`, enriched from the session details.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Session {
    pub protocol: String,
    pub id: u32,
    pub portal: String,
    pub iqn: String,
    pub name: String,
    pub connection_state: String,
    pub session_state: String,
    pub internal_iscsid_session_state: String,
}

impl Session {
    pub fn is_logged_in(&self) -> bool {
        self.session_state == "LOGGED_IN" && self.connection_state == "LOGGED IN"
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session name: {}, status: Connection({}), Session({})",
            self.name, self.connection_state, self.session_state
        )
    }
}

/// The host side of iSCSI: how to run `iscsiadm`, where udev publishes by-path links, and how
/// long to keep retrying a login.
#[derive(Clone, Copy)]
pub struct Initiator<'a> {
    pub exec: &'a dyn Exec,
    pub by_path: &'a Path,
    pub poll: Poll,
}

impl Disk {
    pub fn new(username: &str, password: &str, iqn: &str, portals: Vec<String>) -> Self {
        Disk {
            portals: portals.iter().map(|p| normalize_portal(p)).collect(),
            iqn: iqn.to_string(),
            lun: LUN,
            session_secret: Chap {
                username: username.to_string(),
                password: password.to_string(),
            },
            device_path: String::new(),
            reservation_key: None,
        }
    }

    /// Logs in to every portal and waits for the LUN's block device to show up.
    ///
    /// The portal list is static: node records are created directly and SendTargets discovery
    /// is never run.
    ///
    /// Login failures are retried on the initiator's poll schedule, so a target that is
    /// briefly unreachable does not fail the attach.
    pub fn attach(&mut self, ini: &Initiator) -> Result<()> {
        for portal in &self.portals {
            self.create_node(ini.exec, portal)?;
        }

        let mut logged_in = vec![false; self.portals.len()];
        let mut last_err = None;
        let device = ini.poll.until(|| {
            for (portal, done) in self.portals.iter().zip(logged_in.iter_mut()) {
                if *done {
                    continue;
                }
                match self.login(ini.exec, portal) {
                    Ok(()) => *done = true,
                    Err(e) => {
                        warn!("iSCSI login to {portal} for {} failed, retrying: {e}", self.iqn);
                        last_err = Some(e);
                    }
                }
            }
            self.portals
                .iter()
                .zip(&logged_in)
                .filter(|(_, done)| **done)
                .find_map(|(portal, _)| self.resolve_device(ini.by_path, portal))
        });

        match device {
            Some(device) => {
                debug!("connect iscsi disk {device}");
                self.device_path = device;
                Ok(())
            }
            None if !logged_in.contains(&true) => Err(last_err.unwrap_or(Error::Timeout {
                op: "iscsi.Attach",
                what: format!("login to {}", self.iqn),
            })),
            None => Err(Error::Timeout {
                op: "iscsi.Attach",
                what: format!("a block device for {} lun {}", self.iqn, self.lun),
            }),
        }
    }

    /// Logs out of every portal and forgets the node records.  Portals without a session are
    /// skipped.
    pub fn detach(&self, ini: &Initiator) -> Result<()> {
        for portal in &self.portals {
            let cmd = CommandLine::new("iscsiadm")
                .args(["-m", "node", "-p", portal, "-T", &self.iqn, "--logout"]);
            let out = run_unchecked(ini.exec, "iscsi.Detach", &cmd)?;
            check_status(&cmd, "iscsi.Detach", &out, &[ISCSI_ERR_NO_OBJS_FOUND])?;
        }

        let cmd = CommandLine::new("iscsiadm").args(["-m", "node", "-T", &self.iqn, "-o", "delete"]);
        let out = run_unchecked(ini.exec, "iscsi.Detach", &cmd)?;
        check_status(&cmd, "iscsi.Detach", &out, &[ISCSI_ERR_NO_OBJS_FOUND])
    }

    /// Drops any session this host already has for the target, then attaches afresh, so the
    /// result is always exactly one clean session per target.
    pub fn reopen(&mut self, ini: &Initiator) -> Result<()> {
        let sessions = self.sessions(ini)?;
        if !sessions.is_empty() {
            info!(
                "closing {} stale iscsi session(s) for {}",
                sessions.len(),
                self.iqn
            );
            self.detach(ini)?;
        }
        self.attach(ini)
    }

    /// Sessions of this host that belong to the target.  No session at all is not an error.
    pub fn sessions(&self, ini: &Initiator) -> Result<Vec<Session>> {
        let cmd = CommandLine::new("iscsiadm").args(["-m", "session"]);
        let out = run_unchecked(ini.exec, "iscsi.GetSession", &cmd)?;
        if out.status == Some(ISCSI_ERR_NO_OBJS_FOUND) {
            return Ok(Vec::new());
        }
        check_status(&cmd, "iscsi.GetSession", &out, &[])?;

        let mut sessions = Vec::new();
        for mut session in parse_sessions(&out.stdout) {
            if session.iqn != self.iqn {
                continue;
            }
            let detail = CommandLine::new("iscsiadm")
                .args(["-m", "session", "--sid", &session.id.to_string(), "-P", "3"])
                .timeout(SESSION_DETAIL_TIMEOUT);
            match run(ini.exec, "iscsi.GetSession", &detail) {
                Ok(out) => {
                    session.connection_state = capture(connection_state_re(), &out.stdout);
                    session.session_state = capture(session_state_re(), &out.stdout);
                    session.internal_iscsid_session_state =
                        capture(internal_state_re(), &out.stdout);
                }
                Err(e) => debug!("no details for session {}: {e}", session.id),
            }
            sessions.push(session);
        }
        Ok(sessions)
    }

    /// Healthy iff at least one session of the target is logged in on both the connection and
    /// the session level.
    pub fn check_session_state(&self, ini: &Initiator) -> Result<()> {
        let sessions = self.sessions(ini)?;
        if sessions.is_empty() {
            return Err(Error::Unhealthy(format!("no session for {}", self.iqn)));
        }
        if sessions.iter().any(Session::is_logged_in) {
            return Ok(());
        }
        let states: Vec<String> = sessions.iter().map(|s| s.to_string()).collect();
        Err(Error::Unhealthy(states.join("; ")))
    }

    /// Kernel tuning of the attached device.
    // TODO: write -1 to /sys/block/<dev>/device/timeout so I/O blocks instead of erroring
    // while the target fails over.
    pub fn set_kernel_config(&self) -> Result<()> {
        Ok(())
    }

    fn create_node(&self, exec: &dyn Exec, portal: &str) -> Result<()> {
        let node = ["-m", "node", "-p", portal, "-T", &self.iqn];
        let cmd = CommandLine::new("iscsiadm")
            .args(node)
            .args(["-I", IFACE, "-o", "new"]);
        run(exec, "iscsi.Attach", &cmd)?;

        let chap = &self.session_secret;
        if chap.username.is_empty() {
            return Ok(());
        }
        for (name, value) in [
            ("node.session.auth.authmethod", "CHAP"),
            ("node.session.auth.username", chap.username.as_str()),
            ("node.session.auth.password", chap.password.as_str()),
        ] {
            let cmd = CommandLine::new("iscsiadm")
                .args(node)
                .args(["-o", "update", "-n", name, "-v", value])
                .sensitive();
            run(exec, "iscsi.Attach", &cmd)?;
        }
        Ok(())
    }

    fn login(&self, exec: &dyn Exec, portal: &str) -> Result<()> {
        let cmd = CommandLine::new("iscsiadm")
            .args(["-m", "node", "-p", portal, "-T", &self.iqn, "--login"]);
        let out = run_unchecked(exec, "iscsi.Attach", &cmd)?;
        check_status(&cmd, "iscsi.Attach", &out, &[ISCSI_ERR_SESS_EXISTS])
    }

    fn resolve_device(&self, by_path: &Path, portal: &str) -> Option<String> {
        let link = by_path.join(format!("ip-{portal}-iscsi-{}-lun-{}", self.iqn, self.lun));
        fs::canonicalize(link).ok().map(|p| path_str(&p))
    }
}

/// Accepts exit status 0 and any of `tolerated`.
fn check_status(
    cmd: &CommandLine,
    op: &'static str,
    out: &crate::util::CommandOutput,
    tolerated: &[i32],
) -> Result<()> {
    match out.status {
        Some(0) => Ok(()),
        Some(code) if tolerated.contains(&code) => Ok(()),
        status => Err(Error::CommandFailed {
            op,
            command: cmd.describe(),
            status,
            output: out.combined(),
        }),
    }
}

fn normalize_portal(portal: &str) -> String {
    let portal = portal.trim();
    // A bracketed IPv6 address only carries a port after the closing bracket.
    let host_end = portal.rfind(']').map(|i| i + 1).unwrap_or(0);
    if portal[host_end..].contains(':') {
        portal.to_string()
    } else {
        format!("{portal}:{DEFAULT_PORT}")
    }
}

/// Parses the output of `iscsiadm -m session`, e.g.
/// `tcp: [1] 10.0.0.1:3260,1 iqn.2003-01.org.linux-iscsi.host:disk0 (non-flash)`.
fn parse_sessions(lines: &str) -> Vec<Session> {
    lines
        .lines()
        .filter_map(|entry| {
            let e: Vec<&str> = entry.split_whitespace().collect();
            if e.len() < 4 {
                return None;
            }
            let id = e[1].trim_matches(|c| c == '[' || c == ']').parse().unwrap_or(0);
            Some(Session {
                protocol: e[0].split(':').next().unwrap_or_default().to_string(),
                id,
                portal: e[2].split(',').next().unwrap_or_default().to_string(),
                iqn: e[3].to_string(),
                name: e[3].split(':').nth(1).unwrap_or_default().to_string(),
                ..Default::default()
            })
        })
        .collect()
}

fn capture(re: &Regex, text: &str) -> String {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

fn connection_state_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"iSCSI Connection State:(.*)").unwrap())
}

fn session_state_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"iSCSI Session State:(.*)").unwrap())
}

fn internal_state_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Internal iscsid Session State:(.*)").unwrap())
}
