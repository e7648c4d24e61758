// Copyright 2026 The extrootfs Developers. All Rights Reserved.
//
// SPDX-License-Identifier: (Apache-2.0 AND BSD-3-Clause)

//! Remote LUNs bound through an iSCSI session and held with a persistent reservation.

use log::*;
use serde::{Deserialize, Serialize};

use super::{required, write_state, Backend, Base, Parameters};
use crate::host::Host;
use crate::iscsi::{self, Disk};
use crate::{Error, Result};

pub const TARGET_KEY: &str = "extrootfs.io/iscsi/target";
pub const PORTAL_KEY: &str = "extrootfs.io/iscsi/portal";
pub const USER_KEY: &str = "extrootfs.io/iscsi/user";
pub const PASSWORD_KEY: &str = "extrootfs.io/iscsi/password";

pub(super) const STATE_FILE: &str = "iscsi-config.json";

pub(super) struct Params {
    target: String,
    portals: Vec<String>,
    username: String,
    password: String,
}

impl Params {
    pub(super) fn parse(params: &Parameters) -> Result<Self> {
        let target = required(params, TARGET_KEY)?;
        let portals: Vec<String> = required(params, PORTAL_KEY)?
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if portals.is_empty() {
            return Err(Error::InvalidParameter(format!("{PORTAL_KEY} lists no portal")));
        }
        let get = |key: &str| params.get(key).cloned().unwrap_or_default();

        Ok(Params {
            target: target.to_string(),
            portals,
            username: get(USER_KEY),
            password: get(PASSWORD_KEY),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IscsiRootFs {
    #[serde(flatten)]
    pub base: Base,
    pub target: String,
    pub portals: Vec<String>,
    pub lun: u32,
    pub username: String,
    pub password: String,
    #[serde(rename = "iscsi_disk")]
    pub disk: Option<Disk>,
}

impl IscsiRootFs {
    pub(super) fn new(base: Base, params: Params) -> Self {
        IscsiRootFs {
            base,
            target: params.target,
            portals: params.portals,
            lun: iscsi::LUN,
            username: params.username,
            password: params.password,
            disk: None,
        }
    }
}

impl Backend for IscsiRootFs {
    fn base(&self) -> &Base {
        &self.base
    }

    /// The LUN already exists on the target.
    fn allocate(&mut self, _host: &Host) -> Result<()> {
        Ok(())
    }

    fn connect(&mut self, host: &Host) -> Result<()> {
        let ini = host.initiator();
        let mut disk = Disk::new(
            &self.username,
            &self.password,
            &self.target,
            self.portals.clone(),
        );
        let owned = disk
            .reopen(&ini)
            .and_then(|_| disk.set_kernel_config())
            .and_then(|_| {
                iscsi::preempt_lun(host.exec(), host.identity_file(), &disk.device_path)
            });
        match owned {
            Ok(key) => disk.reservation_key = Some(key),
            Err(e) => {
                // Never leave a session attached that this node does not own.
                if let Err(detach_err) = disk.detach(&ini) {
                    warn!("Detaching {} after a failed connect: {detach_err}", self.target);
                }
                return Err(e);
            }
        }

        info!("rootfs {} owns {} as {}", self.base.id, self.target, disk.device_path);
        self.base.device = disk.device_path.clone();
        self.disk = Some(disk);
        Ok(())
    }

    fn disconnect(&mut self, host: &Host) -> Result<()> {
        if let Some(disk) = &self.disk {
            disk.detach(&host.initiator())?;
        }
        self.base.device.clear();
        self.disk = None;
        Ok(())
    }

    fn probe(&self, host: &Host) -> Result<()> {
        match &self.disk {
            Some(disk) => disk.check_session_state(&host.initiator()),
            None => Err(Error::NotConnected("rootfs is not connected")),
        }
    }

    fn is_connected(&self) -> bool {
        self.disk.is_some()
    }

    fn save_state(&self) -> Result<()> {
        write_state(&self.base.data_path.join(STATE_FILE), self)
    }
}
