// Copyright 2026 The extrootfs Developers. All Rights Reserved.
//
// SPDX-License-Identifier: (Apache-2.0 AND BSD-3-Clause)

//! Copy-on-write qcow2 overlays bound through NBD.

use log::*;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{required, write_state, Backend, Base, Layout, Parameters, IMAGE_KEY};
use crate::host::Host;
use crate::qemu::image::{create_from_base, image_info};
use crate::qemu::{ImgInfo, Nbd};
use crate::{Error, Result};

pub(super) const STATE_FILE: &str = "qemu-config.json";
const ROOTFS_FILE: &str = "rootfs";

pub(super) struct Params {
    image: String,
    image_path: PathBuf,
}

impl Params {
    pub(super) fn parse(layout: &Layout, params: &Parameters) -> Result<Self> {
        let image = required(params, IMAGE_KEY)?;
        let mut components = Path::new(image).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(Error::InvalidParameter(format!(
                "{IMAGE_KEY} must be a plain file name, got '{image}'"
            )));
        }
        Ok(Params {
            image: image.to_string(),
            image_path: layout.image_path(image),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QemuRootFs {
    #[serde(flatten)]
    pub base: Base,
    pub image: String,
    /// Shared base image, never written to.
    pub image_path: PathBuf,
    /// This volume's overlay.
    pub rootfs_path: PathBuf,
    pub base_info: Option<ImgInfo>,
    #[serde(rename = "nbd_info")]
    pub nbd: Option<Nbd>,
}

impl QemuRootFs {
    pub(super) fn new(base: Base, params: Params) -> Self {
        let rootfs_path = base.data_path.join(ROOTFS_FILE);
        QemuRootFs {
            base,
            image: params.image,
            image_path: params.image_path,
            rootfs_path,
            base_info: None,
            nbd: None,
        }
    }
}

impl Backend for QemuRootFs {
    fn base(&self) -> &Base {
        &self.base
    }

    fn allocate(&mut self, host: &Host) -> Result<()> {
        let info = image_info(host.exec(), &self.image_path)?;

        // An existing overlay is taken as is; nothing verifies it still matches the base.
        if !self.rootfs_path.exists() {
            info!(
                "creating overlay {} from {}",
                self.rootfs_path.display(),
                self.image_path.display()
            );
            create_from_base(host.exec(), &self.rootfs_path, &self.image_path, &info.format)?;
        }

        self.base_info = Some(info);
        Ok(())
    }

    fn connect(&mut self, host: &Host) -> Result<()> {
        let format = match &self.base_info {
            Some(info) => info.format.clone(),
            None => return Err(Error::NotConnected("base image info missing, allocate first")),
        };

        let nbd = host.nbd().connect(host.exec(), &self.rootfs_path, &format)?;
        self.base.device = nbd.device_path.clone();
        self.nbd = Some(nbd);
        Ok(())
    }

    fn disconnect(&mut self, host: &Host) -> Result<()> {
        if let Some(nbd) = &self.nbd {
            host.nbd().disconnect(host.exec(), nbd)?;
        }
        self.base.device.clear();
        self.nbd = None;
        Ok(())
    }

    fn probe(&self, host: &Host) -> Result<()> {
        match &self.nbd {
            Some(nbd) if host.nbd().is_attached(nbd) => Ok(()),
            Some(nbd) => Err(Error::Unhealthy(format!(
                "{} has no qemu-nbd server anymore",
                nbd.device_path
            ))),
            None => Err(Error::NotConnected("rootfs is not connected")),
        }
    }

    fn is_connected(&self) -> bool {
        self.nbd.is_some()
    }

    fn save_state(&self) -> Result<()> {
        write_state(&self.base.data_path.join(STATE_FILE), self)
    }
}
