// Copyright 2026 The extrootfs Developers. All Rights Reserved.
//
// SPDX-License-Identifier: (Apache-2.0 AND BSD-3-Clause)

//! A scripted host for unit tests: records every command and plays the kernel's part.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use crate::node::Config;
use crate::util::{CommandLine, CommandOutput, Exec, Poll};

#[derive(Default)]
struct State {
    commands: Vec<String>,
    failing: Vec<String>,
    nbd_attach_hangs: bool,
    nbd_detach_hangs: bool,
    nbd_attach_delay: Duration,
    login_failures: u32,
    login_delay: Duration,
    no_by_path_links: bool,
    sessions: Vec<(u32, String, String)>,
    next_sid: u32,
    sessions_healthy: bool,
    pr_keys: Vec<String>,
    pr_holder: Option<String>,
}

pub(crate) struct SimHost {
    dir: TempDir,
    state: Mutex<State>,
}

impl SimHost {
    pub const NBD_PID: &'static str = "4242";
    pub const SCSI_DISK: &'static str = "sdb";

    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let host = SimHost {
            dir,
            state: Mutex::new(State {
                next_sid: 1,
                sessions_healthy: true,
                ..Default::default()
            }),
        };
        for d in [
            host.base_path(),
            host.output_dir(),
            host.sysfs_block(),
            host.by_path_dir(),
        ] {
            fs::create_dir_all(d).unwrap();
        }
        fs::write(host.identity_file(), "node-1\n").unwrap();
        fs::write(host.dev_dir().join(Self::SCSI_DISK), "").unwrap();
        host
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn base_path(&self) -> PathBuf {
        self.root().join("base")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root().join("output")
    }

    pub fn sysfs_block(&self) -> PathBuf {
        self.root().join("sys").join("block")
    }

    pub fn dev_dir(&self) -> PathBuf {
        self.root().join("dev")
    }

    pub fn by_path_dir(&self) -> PathBuf {
        self.dev_dir().join("disk").join("by-path")
    }

    pub fn identity_file(&self) -> PathBuf {
        self.root().join("hostname")
    }

    pub fn config(&self) -> Config {
        Config {
            base_path: self.base_path(),
            output_base: self.output_dir(),
            sysfs_block: self.sysfs_block(),
            dev_dir: self.dev_dir(),
            disk_by_path: self.by_path_dir(),
            identity_file: self.identity_file(),
            nbd_poll: Poll::new(Duration::from_millis(1), 20),
            iscsi_poll: Poll::new(Duration::from_millis(1), 5),
            load_nbd_module: false,
        }
    }

    /// Creates a base image where the qemu backend looks for it.
    pub fn add_base_image(&self, name: &str) -> PathBuf {
        let dir = self.base_path().join("qcow2").join("images");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, "QFI\u{fb}").unwrap();
        path
    }

    pub fn add_nbd_slots(&self, count: usize) {
        for i in 0..count {
            fs::create_dir_all(self.sysfs_block().join(format!("nbd{i}"))).unwrap();
        }
    }

    pub fn mark_nbd_busy(&self, name: &str) {
        fs::write(self.sysfs_block().join(name).join("pid"), "1\n").unwrap();
    }

    pub fn set_nbd_attach_hangs(&self, hangs: bool) {
        self.state.lock().unwrap().nbd_attach_hangs = hangs;
    }

    pub fn set_nbd_detach_hangs(&self, hangs: bool) {
        self.state.lock().unwrap().nbd_detach_hangs = hangs;
    }

    pub fn set_nbd_attach_delay(&self, delay: Duration) {
        self.state.lock().unwrap().nbd_attach_delay = delay;
    }

    /// Every command whose rendering starts with `prefix` exits with status 1.
    pub fn fail_command(&self, prefix: &str) {
        self.state.lock().unwrap().failing.push(prefix.to_string());
    }

    pub fn set_login_failures(&self, count: u32) {
        self.state.lock().unwrap().login_failures = count;
    }

    pub fn set_login_delay(&self, delay: Duration) {
        self.state.lock().unwrap().login_delay = delay;
    }

    /// Whether a login makes udev publish the LUN's by-path link.
    pub fn set_by_path_links(&self, enabled: bool) {
        self.state.lock().unwrap().no_by_path_links = !enabled;
    }

    pub fn set_sessions_healthy(&self, healthy: bool) {
        self.state.lock().unwrap().sessions_healthy = healthy;
    }

    pub fn add_session(&self, portal: &str, iqn: &str) {
        let mut state = self.state.lock().unwrap();
        let sid = state.next_sid;
        state.next_sid += 1;
        state.sessions.push((sid, portal.to_string(), iqn.to_string()));
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn pr_register(&self, key: &str) {
        self.state.lock().unwrap().pr_keys.push(key.to_string());
    }

    pub fn pr_reserve(&self, key: &str) {
        self.state.lock().unwrap().pr_holder = Some(key.to_string());
    }

    pub fn pr_holder(&self) -> Option<String> {
        self.state.lock().unwrap().pr_holder.clone()
    }

    pub fn pr_keys(&self) -> Vec<String> {
        self.state.lock().unwrap().pr_keys.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn commands_of(&self, program: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.split(' ').next() == Some(program))
            .collect()
    }

    pub fn clear_commands(&self) {
        self.state.lock().unwrap().commands.clear();
    }

    fn by_path_link(&self, portal: &str, iqn: &str) -> PathBuf {
        self.by_path_dir()
            .join(format!("ip-{portal}-iscsi-{iqn}-lun-0"))
    }

    fn qemu_img(&self, args: &[String]) -> CommandOutput {
        match args.first().map(String::as_str) {
            Some("info") => {
                let file = args.last().unwrap();
                if !Path::new(file).exists() {
                    return exit(1, "qemu-img: Could not open file");
                }
                ok(&format!(
                    r#"{{"virtual-size": 2361393152, "filename": "{file}", "format": "qcow2", "actual-size": 550637568, "dirty-flag": false}}"#
                ))
            }
            Some("create") => {
                // create -f FMT OVERLAY -b BASE -F FMT
                fs::write(&args[3], format!("backing={}", args[5])).unwrap();
                ok("")
            }
            _ => exit(1, "qemu-img: unknown command"),
        }
    }

    fn qemu_nbd(&self, args: &[String]) -> CommandOutput {
        let (hangs, detach_hangs, delay) = {
            let state = self.state.lock().unwrap();
            (
                state.nbd_attach_hangs,
                state.nbd_detach_hangs,
                state.nbd_attach_delay,
            )
        };
        let pid_file = |dev: &str| {
            let name = Path::new(dev).file_name().unwrap().to_owned();
            self.sysfs_block().join(name).join("pid")
        };

        if let Some(pos) = args.iter().position(|a| a == "--connect") {
            thread::sleep(delay);
            let pid = pid_file(&args[pos + 1]);
            if pid.exists() {
                return exit(1, "qemu-nbd: Failed to set NBD socket: Device or resource busy");
            }
            if !hangs {
                fs::write(pid, format!("{}\n", Self::NBD_PID)).unwrap();
            }
            ok("")
        } else if let Some(pos) = args.iter().position(|a| a == "--disconnect") {
            if !detach_hangs {
                let _ = fs::remove_file(pid_file(&args[pos + 1]));
            }
            ok(&format!("{} disconnected\n", args[pos + 1]))
        } else {
            exit(1, "qemu-nbd: bad arguments")
        }
    }

    fn iscsiadm(&self, args: &[String]) -> CommandOutput {
        if args.iter().any(|a| a == "--login") {
            let delay = self.state.lock().unwrap().login_delay;
            thread::sleep(delay);
        }
        let flag = |name: &str| {
            args.iter()
                .position(|a| a == name)
                .map(|i| args[i + 1].clone())
        };
        let has = |name: &str| args.iter().any(|a| a == name);
        let mut state = self.state.lock().unwrap();

        if flag("-m").as_deref() == Some("session") {
            if let Some(sid) = flag("--sid") {
                let sid: u32 = sid.parse().unwrap();
                let Some((_, portal, iqn)) = state.sessions.iter().find(|s| s.0 == sid) else {
                    return exit(21, "iscsiadm: No session found.");
                };
                let (conn, sess) = if state.sessions_healthy {
                    ("LOGGED IN", "LOGGED_IN")
                } else {
                    ("TRANSPORT WAIT", "FAILED")
                };
                return ok(&format!(
                    "iSCSI Transport Class version 2.0-870\n\
                     Target: {iqn} (non-flash)\n\
                     \tCurrent Portal: {portal},1\n\
                     \t\t**********\n\
                     \t\tInterface:\n\
                     \t\t**********\n\
                     \t\tiSCSI Connection State: {conn}\n\
                     \t\tiSCSI Session State: {sess}\n\
                     \t\tInternal iscsid Session State: NO CHANGE\n"
                ));
            }
            if state.sessions.is_empty() {
                return exit(21, "iscsiadm: No active sessions.");
            }
            let listing: String = state
                .sessions
                .iter()
                .map(|(sid, portal, iqn)| format!("tcp: [{sid}] {portal},1 {iqn} (non-flash)\n"))
                .collect();
            return ok(&listing);
        }

        let portal = flag("-p");
        let iqn = flag("-T").unwrap_or_default();
        if has("--login") {
            if state.login_failures > 0 {
                state.login_failures -= 1;
                return exit(8, "iscsiadm: initiator reported error (8 - connection timed out)");
            }
            let portal = portal.unwrap();
            let sid = state.next_sid;
            state.next_sid += 1;
            state.sessions.push((sid, portal.clone(), iqn.clone()));
            if !state.no_by_path_links {
                let link = self.by_path_link(&portal, &iqn);
                let _ = fs::remove_file(&link);
                symlink(Path::new("../..").join(Self::SCSI_DISK), link).unwrap();
            }
            ok("Login to [iface: default] successful.\n")
        } else if has("--logout") {
            let portal = portal.unwrap();
            let before = state.sessions.len();
            state.sessions.retain(|s| !(s.1 == portal && s.2 == iqn));
            if state.sessions.len() == before {
                return exit(21, "iscsiadm: No matching sessions found");
            }
            let _ = fs::remove_file(self.by_path_link(&portal, &iqn));
            ok("Logout of [iface: default] successful.\n")
        } else {
            // -o new / -o update / -o delete
            ok("")
        }
    }

    fn sg_persist(&self, args: &[String]) -> CommandOutput {
        let param = |prefix: &str| {
            args.iter()
                .find_map(|a| a.strip_prefix(prefix))
                .map(str::to_string)
        };
        let has = |name: &str| args.iter().any(|a| a == name);
        let mut state = self.state.lock().unwrap();
        let header = "  LIO-ORG   block0   4.0\n  Peripheral device type: disk\n";

        if has("--read-keys") {
            if state.pr_keys.is_empty() {
                return ok(&format!(
                    "{header}  PR generation=0x0, there are NO registered reservation keys\n"
                ));
            }
            let keys: String = state.pr_keys.iter().map(|k| format!("    {k}\n")).collect();
            ok(&format!(
                "{header}  PR generation=0x{:x}, {} registered reservation key follows:\n{keys}",
                state.pr_keys.len(),
                state.pr_keys.len()
            ))
        } else if has("--read-reservation") {
            match &state.pr_holder {
                None => ok(&format!(
                    "{header}  PR generation=0x1, there is NO reservation held\n"
                )),
                Some(key) => ok(&format!(
                    "{header}  PR generation=0x2, Reservation follows:\n    Key={key}\n    scope: LU_SCOPE,  type: Exclusive Access\n"
                )),
            }
        } else if has("--register") {
            let key = param("--param-sark=").unwrap();
            state.pr_keys.push(key);
            ok(header)
        } else if has("--reserve") {
            let key = param("--param-rk=").unwrap();
            if !state.pr_keys.contains(&key) {
                return exit(24, "persistent reserve out: scsi status: Reservation Conflict");
            }
            if state.pr_holder.as_deref().is_some_and(|holder| holder != key) {
                return exit(24, "persistent reserve out: scsi status: Reservation Conflict");
            }
            state.pr_holder = Some(key);
            ok(header)
        } else if has("--preempt") {
            let key = param("--param-rk=").unwrap();
            let victim = param("--param-sark=").unwrap();
            if !state.pr_keys.contains(&key) {
                return exit(24, "persistent reserve out: scsi status: Reservation Conflict");
            }
            state.pr_keys.retain(|k| *k != victim);
            if state.pr_holder.as_deref() == Some(victim.as_str()) {
                state.pr_holder = Some(key);
            }
            ok(header)
        } else {
            exit(1, "sg_persist: bad arguments")
        }
    }
}

impl Exec for SimHost {
    fn exec(&self, cmd: &CommandLine) -> io::Result<CommandOutput> {
        let rendered = cmd.to_string();
        {
            let mut state = self.state.lock().unwrap();
            state.commands.push(rendered.clone());
            if state.failing.iter().any(|p| rendered.starts_with(p.as_str())) {
                return Ok(exit(1, "simulated failure"));
            }
        }

        Ok(match cmd.program.as_str() {
            "qemu-img" => self.qemu_img(&cmd.args),
            "qemu-nbd" => self.qemu_nbd(&cmd.args),
            "iscsiadm" => self.iscsiadm(&cmd.args),
            "sg_persist" => self.sg_persist(&cmd.args),
            "lsmod" => ok("Module                  Size  Used by\nloop                   40960  0\n"),
            "blockdev" | "modprobe" | "udevadm" => ok(""),
            other => exit(127, &format!("{other}: command not found")),
        })
    }
}

pub(crate) fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        status: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub(crate) fn exit(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        status: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}
