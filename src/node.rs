// Copyright 2026 The extrootfs Developers. All Rights Reserved.
//
// SPDX-License-Identifier: (Apache-2.0 AND BSD-3-Clause)

/*!
 * The lifecycle boundary of a node.
 *
 * [`NodeService`] turns publish and unpublish requests into the backend steps: build or reload
 * the volume, allocate, connect, persist.  Calls for the same volume are mutually exclusive,
 * calls for different volumes run in parallel and only meet at the NBD connect guard.
 */

use log::*;
use std::path::PathBuf;
use std::sync::Arc;

use crate::host::Host;
use crate::lock::VolumeLocks;
use crate::rootfs::{Backend, Layout, Output, Parameters, RootFs, RootFsKind, TYPE_KEY};
use crate::util::{Exec, HostExec, Poll};
use crate::{Error, Result};

/// Host paths and retry policies.  `Default` describes a production node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub base_path: PathBuf,
    pub output_base: PathBuf,
    pub sysfs_block: PathBuf,
    pub dev_dir: PathBuf,
    pub disk_by_path: PathBuf,
    /// Source of this node's persistent-reservation key.
    pub identity_file: PathBuf,
    pub nbd_poll: Poll,
    pub iscsi_poll: Poll,
    pub load_nbd_module: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_path: PathBuf::from("/opt/extrootfs"),
            output_base: PathBuf::from("/opt/extrootfs/output"),
            sysfs_block: PathBuf::from("/sys/block"),
            dev_dir: PathBuf::from("/dev"),
            disk_by_path: PathBuf::from("/dev/disk/by-path"),
            identity_file: PathBuf::from("/etc/hostname"),
            nbd_poll: Poll::NBD,
            iscsi_poll: Poll::ISCSI_LOGIN,
            load_nbd_module: false,
        }
    }
}

pub struct NodeService {
    layout: Layout,
    host: Host,
    locks: VolumeLocks,
}

impl NodeService {
    pub fn new(config: &Config) -> Self {
        Self::with_exec(Arc::new(HostExec), config)
    }

    pub fn with_exec(exec: Arc<dyn Exec>, config: &Config) -> Self {
        NodeService {
            layout: Layout::new(&config.base_path, &config.output_base),
            host: Host::new(exec, config),
            locks: VolumeLocks::new(),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Binds volume `id` to a host device and returns the binding.
    ///
    /// A volume seen before is reloaded from disk, and one that is still bound is handed back
    /// as is.
    pub fn publish(&self, id: &str, params: &Parameters) -> Result<Output> {
        self.publish_locked(id, params)
            .map_err(|e| Error::volume("publish", id, e))
    }

    /// Releases the device of volume `id`.  Unknown or already released volumes succeed.
    pub fn unpublish(&self, id: &str) -> Result<()> {
        self.unpublish_locked(id)
            .map_err(|e| Error::volume("unpublish", id, e))
    }

    /// Checks that the binding of volume `id` is still alive.
    pub fn probe(&self, id: &str) -> Result<Output> {
        self.probe_locked(id).map_err(|e| Error::volume("probe", id, e))
    }

    fn publish_locked(&self, id: &str, params: &Parameters) -> Result<Output> {
        validate_id(id)?;
        let _guard = self
            .locks
            .lock(id)
            .ok_or_else(|| Error::InProgress(id.to_string()))?;

        let mut rootfs = if self.layout.is_provisioned(id) {
            let rootfs = RootFs::load(id, &self.layout)?;
            if let Some(kind) = params.get(TYPE_KEY) {
                if kind.parse::<RootFsKind>().ok() != Some(rootfs.kind()) {
                    warn!("rootfs {id} is {}, ignoring requested type {kind}", rootfs.kind());
                }
            }
            rootfs
        } else {
            let kind = params
                .get(TYPE_KEY)
                .ok_or_else(|| Error::InvalidParameter(format!("{TYPE_KEY} is required")))?;
            RootFs::create(id, kind, &self.layout, params)?
        };

        if rootfs.is_connected() {
            info!("rootfs {id} is already bound to {}", rootfs.device());
            rootfs.write_config()?;
            return Ok(rootfs.output());
        }

        rootfs.allocate(&self.host)?;
        rootfs.connect(&self.host)?;
        if let Err(e) = rootfs.write_config() {
            let device = rootfs.device().to_string();
            match rootfs.disconnect(&self.host) {
                Ok(()) => {
                    if let Err(save_err) = rootfs.save_state() {
                        warn!("Recording release of rootfs {id} failed: {save_err}");
                    }
                }
                Err(detach_err) => warn!("Releasing {device} of rootfs {id} failed: {detach_err}"),
            }
            return Err(e);
        }

        info!("rootfs {id} published on {}", rootfs.device());
        Ok(rootfs.output())
    }

    fn unpublish_locked(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let _guard = self
            .locks
            .lock(id)
            .ok_or_else(|| Error::InProgress(id.to_string()))?;

        if !self.layout.is_provisioned(id) {
            debug!("rootfs {id} does not exist, nothing to unpublish");
            return Ok(());
        }

        let mut rootfs = RootFs::load(id, &self.layout)?;
        if !rootfs.is_connected() {
            debug!("rootfs {id} is not bound");
            return Ok(());
        }

        let device = rootfs.device().to_string();
        rootfs.disconnect(&self.host)?;
        rootfs.write_config()?;
        info!("rootfs {id} released {device}");
        Ok(())
    }

    fn probe_locked(&self, id: &str) -> Result<Output> {
        validate_id(id)?;
        let _guard = self
            .locks
            .lock(id)
            .ok_or_else(|| Error::InProgress(id.to_string()))?;

        let rootfs = RootFs::load(id, &self.layout)?;
        rootfs.probe(&self.host)?;
        Ok(rootfs.output())
    }
}

/// Volume IDs name a directory under the base path.
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains('/') || id.contains('\0') {
        return Err(Error::InvalidParameter(format!("invalid volume ID '{id}'")));
    }
    Ok(())
}
