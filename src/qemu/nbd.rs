// Copyright 2026 The extrootfs Developers. All Rights Reserved.
//
// SPDX-License-Identifier: (Apache-2.0 AND BSD-3-Clause)

/*!
 * NBD device allocation.
 *
 * The kernel exposes one `/sys/block/nbdN` directory per NBD slot; a slot is busy while its
 * `pid` attribute exists.  Finding a free slot and attaching `qemu-nbd` to it are two separate
 * steps, and the `pid` attribute only appears once the attach has gone through, so two callers
 * could pick the same slot.  [`NbdSlots`] therefore serializes the whole scan-and-attach window
 * behind a single guard shared by every volume on this host.
 */

use log::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::image::path_str;
use crate::util::{run, CommandLine, Exec, Poll};
use crate::{Error, Result};

/// A claimed NBD slot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nbd {
    /// sysfs directory of the slot, e.g. `/sys/block/nbd0`
    pub block_path: String,
    /// e.g. `/dev/nbd0`
    pub device_path: String,
    /// e.g. `nbd0`
    pub name: String,
    /// PID of the `qemu-nbd` process serving the slot, as reported by the kernel
    pub pid: String,
    pub pid_file: String,
}

/// The host's NBD slot table together with the guard that serializes attaches to it.
#[derive(Debug)]
pub struct NbdSlots {
    sysfs_block: PathBuf,
    dev_dir: PathBuf,
    poll: Poll,
    load_module: bool,
    connect_lock: Mutex<()>,
}

impl NbdSlots {
    pub fn new(sysfs_block: impl Into<PathBuf>, dev_dir: impl Into<PathBuf>, poll: Poll) -> Self {
        NbdSlots {
            sysfs_block: sysfs_block.into(),
            dev_dir: dev_dir.into(),
            poll,
            load_module: false,
            connect_lock: Mutex::new(()),
        }
    }

    /// Make `connect()` load the `nbd` kernel module when `lsmod` does not list it.
    pub fn with_module_load(mut self, load_module: bool) -> Self {
        self.load_module = load_module;
        self
    }

    /// Claims a free slot and attaches `image` to it, returning the bound slot.
    ///
    /// Holds the connect guard for the whole sequence.  If the attach command went through but
    /// the kernel never acknowledged it, the slot is detached again before the error is
    /// returned.
    pub fn connect(&self, exec: &dyn Exec, image: &Path, format: &str) -> Result<Nbd> {
        let _guard = self.connect_lock.lock().unwrap();

        if self.load_module {
            self.ensure_module(exec)?;
        }

        let mut nbd = self.allocate()?;
        let cmd = CommandLine::new("qemu-nbd")
            .arg(format!("--format={format}"))
            .args(["--connect", &nbd.device_path])
            .arg(path_str(image));
        info!("Connect NBD: {cmd}");
        run(exec, "nbd.Connect", &cmd)?;

        if let Err(e) = self.settle_attach(exec, &mut nbd) {
            let detach = CommandLine::new("qemu-nbd").args(["--disconnect", &nbd.device_path]);
            if let Err(detach_err) = run(exec, "nbd.Disconnect", &detach) {
                warn!("Rolling back {} failed: {detach_err}", nbd.name);
            }
            return Err(e);
        }

        Ok(nbd)
    }

    fn settle_attach(&self, exec: &dyn Exec, nbd: &mut Nbd) -> Result<()> {
        nbd.pid = self
            .poll
            .until(|| {
                fs::read_to_string(&nbd.pid_file)
                    .ok()
                    .map(|pid| pid.trim().to_string())
            })
            .ok_or_else(|| Error::Timeout {
                op: "nbd.Connect",
                what: format!("{} to report a pid", nbd.name),
            })?;

        let cmd = CommandLine::new("blockdev").args(["--rereadpt", &nbd.device_path]);
        run(exec, "nbd.Connect", &cmd)?;
        Ok(())
    }

    /// Detaches `nbd` and waits for the kernel to release the slot.  No-op for an unbound record.
    pub fn disconnect(&self, exec: &dyn Exec, nbd: &Nbd) -> Result<()> {
        if nbd.device_path.is_empty() {
            return Ok(());
        }

        debug!("Disconnect NBD from {}", nbd.name);
        let cmd = CommandLine::new("qemu-nbd").args(["--disconnect", &nbd.device_path]);
        run(exec, "nbd.Disconnect", &cmd)?;

        self.poll
            .until(|| (!Path::new(&nbd.pid_file).exists()).then_some(()))
            .ok_or_else(|| Error::Timeout {
                op: "nbd.Disconnect",
                what: format!("{} pid to be cleaned up", nbd.name),
            })
    }

    /// Whether the kernel still reports a server for the slot.
    pub fn is_attached(&self, nbd: &Nbd) -> bool {
        !nbd.pid_file.is_empty() && Path::new(&nbd.pid_file).exists()
    }

    /// Returns the first slot without a pid marker.  Callers must hold the connect guard
    /// between this scan and the attach.
    fn allocate(&self) -> Result<Nbd> {
        let entries = fs::read_dir(&self.sysfs_block)
            .map_err(|e| Error::io(format!("nbd.allocate {}", self.sysfs_block.display()), e))?;

        let mut slots: Vec<(u32, String)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let index = name.strip_prefix("nbd")?.parse().ok()?;
                Some((index, name))
            })
            .collect();
        slots.sort();

        for (_, name) in slots {
            let block_path = self.sysfs_block.join(&name);
            let pid_file = block_path.join("pid");
            if !pid_file.exists() {
                return Ok(Nbd {
                    device_path: path_str(&self.dev_dir.join(&name)),
                    block_path: path_str(&block_path),
                    pid_file: path_str(&pid_file),
                    pid: String::new(),
                    name,
                });
            }
        }

        Err(Error::NoFreeDevice)
    }

    fn ensure_module(&self, exec: &dyn Exec) -> Result<()> {
        let lsmod = run(exec, "nbd.loadNBD", &CommandLine::new("lsmod"))?;
        if lsmod.stdout.lines().any(|l| l.split_whitespace().next() == Some("nbd")) {
            return Ok(());
        }
        run(exec, "nbd.loadNBD", &CommandLine::new("modprobe").arg("nbd"))?;
        run(exec, "nbd.loadNBD", &CommandLine::new("udevadm").arg("settle"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimHost;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn slots(host: &SimHost, poll: Poll) -> NbdSlots {
        NbdSlots::new(host.sysfs_block(), host.dev_dir(), poll)
    }

    #[test]
    fn connect_claims_first_free_slot() {
        let host = SimHost::new();
        host.add_nbd_slots(3);
        host.mark_nbd_busy("nbd0");
        let image = host.add_base_image("overlay");

        let nbd = slots(&host, Poll::new(Duration::from_millis(1), 5))
            .connect(&host, &image, "qcow2")
            .unwrap();

        assert_eq!(nbd.name, "nbd1");
        assert_eq!(nbd.device_path, host.dev_dir().join("nbd1").to_string_lossy());
        assert_eq!(nbd.pid, SimHost::NBD_PID);
        assert_eq!(
            host.commands(),
            vec![
                format!(
                    "qemu-nbd --format=qcow2 --connect {} {}",
                    nbd.device_path,
                    image.display()
                ),
                format!("blockdev --rereadpt {}", nbd.device_path),
            ]
        );
    }

    #[test]
    fn slots_are_scanned_in_numeric_order() {
        let host = SimHost::new();
        host.add_nbd_slots(12);
        for i in 0..10 {
            host.mark_nbd_busy(&format!("nbd{i}"));
        }
        let image = host.add_base_image("overlay");
        let nbd = slots(&host, Poll::new(Duration::from_millis(1), 5))
            .connect(&host, &image, "raw")
            .unwrap();
        assert_eq!(nbd.name, "nbd10");
    }

    #[test]
    fn no_free_slot_is_fatal() {
        let host = SimHost::new();
        host.add_nbd_slots(2);
        host.mark_nbd_busy("nbd0");
        host.mark_nbd_busy("nbd1");
        let image = host.add_base_image("overlay");
        let err = slots(&host, Poll::new(Duration::from_millis(1), 5))
            .connect(&host, &image, "qcow2")
            .unwrap_err();
        assert!(matches!(err, Error::NoFreeDevice));
        assert!(host.commands().is_empty());
    }

    #[test]
    fn missing_pid_times_out_after_full_window() {
        let host = SimHost::new();
        host.add_nbd_slots(1);
        host.set_nbd_attach_hangs(true);
        let image = host.add_base_image("overlay");
        let poll = Poll::new(Duration::from_millis(20), 5);

        let start = Instant::now();
        let err = slots(&host, poll).connect(&host, &image, "qcow2").unwrap_err();

        assert!(err.is_timeout(), "{err}");
        assert!(start.elapsed() >= poll.window());
        // The half-attached slot is released again, and the partition table is never read.
        let cmds = host.commands();
        assert_eq!(cmds.len(), 2);
        assert!(cmds[1].starts_with("qemu-nbd --disconnect"));
    }

    #[test]
    fn attach_command_failure_is_not_a_timeout() {
        let host = SimHost::new();
        host.add_nbd_slots(1);
        host.fail_command("qemu-nbd --format");
        let image = host.add_base_image("overlay");
        let err = slots(&host, Poll::new(Duration::from_millis(1), 5))
            .connect(&host, &image, "qcow2")
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { op: "nbd.Connect", .. }));
        assert!(!err.is_timeout());
    }

    #[test]
    fn disconnect_waits_for_pid_cleanup() {
        let host = SimHost::new();
        host.add_nbd_slots(1);
        let image = host.add_base_image("overlay");
        let slots = slots(&host, Poll::new(Duration::from_millis(1), 5));
        let nbd = slots.connect(&host, &image, "qcow2").unwrap();
        assert!(slots.is_attached(&nbd));

        slots.disconnect(&host, &nbd).unwrap();
        assert!(!slots.is_attached(&nbd));
        assert_eq!(
            host.commands().last().unwrap(),
            &format!("qemu-nbd --disconnect {}", nbd.device_path)
        );
    }

    #[test]
    fn disconnect_of_unbound_record_is_noop() {
        let host = SimHost::new();
        slots(&host, Poll::NBD)
            .disconnect(&host, &Nbd::default())
            .unwrap();
        assert!(host.commands().is_empty());
    }

    #[test]
    fn disconnect_times_out_when_pid_lingers() {
        let host = SimHost::new();
        host.add_nbd_slots(1);
        let image = host.add_base_image("overlay");
        let slots = slots(&host, Poll::new(Duration::from_millis(1), 3));
        let nbd = slots.connect(&host, &image, "qcow2").unwrap();

        host.set_nbd_detach_hangs(true);
        let err = slots.disconnect(&host, &nbd).unwrap_err();
        assert!(matches!(err, Error::Timeout { op: "nbd.Disconnect", .. }));
    }

    #[test]
    fn module_is_loaded_only_when_missing() {
        let host = SimHost::new();
        host.add_nbd_slots(1);
        let image = host.add_base_image("overlay");
        let slots = slots(&host, Poll::new(Duration::from_millis(1), 5)).with_module_load(true);
        slots.connect(&host, &image, "qcow2").unwrap();

        let cmds = host.commands();
        assert_eq!(&cmds[..3], &["lsmod", "modprobe nbd", "udevadm settle"]);
    }

    #[test]
    fn concurrent_connects_never_share_a_slot() {
        const N: usize = 8;
        let host = Arc::new(SimHost::new());
        host.add_nbd_slots(N);
        host.set_nbd_attach_delay(Duration::from_millis(5));
        let slots = Arc::new(slots(&host, Poll::new(Duration::from_millis(1), 50)));

        let handles: Vec<_> = (0..N)
            .map(|i| {
                let host = Arc::clone(&host);
                let slots = Arc::clone(&slots);
                let image = host.add_base_image(&format!("overlay-{i}"));
                thread::spawn(move || slots.connect(&*host, &image, "qcow2").unwrap())
            })
            .collect();

        let devices: HashSet<String> = handles
            .into_iter()
            .map(|h| h.join().unwrap().device_path)
            .collect();
        assert_eq!(devices.len(), N);

        // The pool is now exhausted.
        let image = host.add_base_image("one-too-many");
        assert!(matches!(
            slots.connect(&*host, &image, "qcow2"),
            Err(Error::NoFreeDevice)
        ));
    }
}
