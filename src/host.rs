// Copyright 2026 The extrootfs Developers. All Rights Reserved.
//
// SPDX-License-Identifier: (Apache-2.0 AND BSD-3-Clause)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::iscsi::Initiator;
use crate::node::Config;
use crate::qemu::NbdSlots;
use crate::util::{Exec, Poll};

/// Everything the backends need from the machine they run on: the command runner, the NBD slot
/// table with its connect guard, and the iSCSI initiator settings.
///
/// One `Host` is shared by every volume of a node.
pub struct Host {
    exec: Arc<dyn Exec>,
    nbd: NbdSlots,
    disk_by_path: PathBuf,
    identity_file: PathBuf,
    iscsi_poll: Poll,
}

impl Host {
    pub fn new(exec: Arc<dyn Exec>, config: &Config) -> Self {
        Host {
            exec,
            nbd: NbdSlots::new(&config.sysfs_block, &config.dev_dir, config.nbd_poll)
                .with_module_load(config.load_nbd_module),
            disk_by_path: config.disk_by_path.clone(),
            identity_file: config.identity_file.clone(),
            iscsi_poll: config.iscsi_poll,
        }
    }

    pub fn exec(&self) -> &dyn Exec {
        self.exec.as_ref()
    }

    pub fn nbd(&self) -> &NbdSlots {
        &self.nbd
    }

    pub fn initiator(&self) -> Initiator<'_> {
        Initiator {
            exec: self.exec.as_ref(),
            by_path: &self.disk_by_path,
            poll: self.iscsi_poll,
        }
    }

    /// File whose contents identify this node towards shared storage.
    pub fn identity_file(&self) -> &Path {
        &self.identity_file
    }
}
