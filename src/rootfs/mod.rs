// Copyright 2026 The extrootfs Developers. All Rights Reserved.
//
// SPDX-License-Identifier: (Apache-2.0 AND BSD-3-Clause)

/*!
 * Root filesystem volumes and their on-disk state.
 *
 * Every volume lives in its own directory `{base_path}/{id}`.  The first file written there is
 * the `type` sentinel naming the backend; after it comes the backend's JSON snapshot.  Nothing
 * about a volume is kept in memory between calls: [`RootFs::load`] rebuilds it from these two
 * files every time.
 */

pub mod iscsi;
pub mod qemu;

use log::*;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::host::Host;
use crate::util::write_file_atomic;
use crate::{Error, Result};

pub use self::iscsi::IscsiRootFs;
pub use self::qemu::QemuRootFs;

/// Flat volume parameters, as handed over by the caller.
pub type Parameters = HashMap<String, String>;

pub const TYPE_KEY: &str = "extrootfs.io/type";
pub const IMAGE_KEY: &str = "extrootfs.io/image";
pub const FS_TYPE_KEY: &str = "extrootfs.io/fs-type";

const TYPE_FILE: &str = "type";
const STATE_MODE: u32 = 0o600;
const OUTPUT_MODE: u32 = 0o644;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootFsKind {
    #[serde(alias = "qcow2")]
    Qemu,
    Iscsi,
}

impl RootFsKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RootFsKind::Qemu => "qemu",
            RootFsKind::Iscsi => "iscsi",
        }
    }
}

impl fmt::Display for RootFsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RootFsKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "qemu" | "qcow2" => Ok(RootFsKind::Qemu),
            "iscsi" => Ok(RootFsKind::Iscsi),
            other => Err(Error::UnknownBackend(other.to_string())),
        }
    }
}

/// Where volume state and output descriptors go on this node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub base_path: PathBuf,
    pub output_base: PathBuf,
}

impl Layout {
    pub fn new(base_path: impl Into<PathBuf>, output_base: impl Into<PathBuf>) -> Self {
        Layout {
            base_path: base_path.into(),
            output_base: output_base.into(),
        }
    }

    pub fn data_path(&self, id: &str) -> PathBuf {
        self.base_path.join(id)
    }

    pub fn output_path(&self, id: &str) -> PathBuf {
        self.output_base.join(format!("{id}.json"))
    }

    /// Shared, read-only base images of the qemu backend.
    pub fn image_path(&self, image: &str) -> PathBuf {
        self.base_path.join("qcow2").join("images").join(image)
    }

    /// Whether `create()` ever completed its first step for `id`.
    pub fn is_provisioned(&self, id: &str) -> bool {
        self.data_path(id).join(TYPE_FILE).exists()
    }
}

/// Hand-off record for whoever formats and mounts the device.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub device: String,
    pub fs_type: String,
}

/// State common to every backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Base {
    pub id: String,
    pub data_path: PathBuf,
    #[serde(rename = "rootfs_type")]
    pub kind: RootFsKind,
    /// Bound host device, empty while disconnected.
    pub device: String,
    pub file_system_type: String,
    pub output_path: PathBuf,
}

impl Base {
    /// Creates the volume directory and its type sentinel.
    fn create(id: &str, kind: RootFsKind, layout: &Layout, params: &Parameters) -> Result<Self> {
        let data_path = layout.data_path(id);
        let sentinel = data_path.join(TYPE_FILE);
        if sentinel.exists() {
            return Err(Error::InvalidParameter(format!(
                "rootfs {id} already exists at {}",
                data_path.display()
            )));
        }
        fs::create_dir_all(&data_path)
            .map_err(|e| Error::io(format!("create {}", data_path.display()), e))?;
        write_file_atomic(&sentinel, kind.as_str().as_bytes(), STATE_MODE)?;

        Ok(Base {
            id: id.to_string(),
            data_path,
            kind,
            device: String::new(),
            file_system_type: params.get(FS_TYPE_KEY).cloned().unwrap_or_default(),
            output_path: layout.output_path(id),
        })
    }

    fn write_output(&self) -> Result<()> {
        let output = Output {
            device: self.device.clone(),
            fs_type: self.file_system_type.clone(),
        };
        write_file_atomic(
            &self.output_path,
            &serde_json::to_vec(&output)?,
            OUTPUT_MODE,
        )
    }
}

/// The lifecycle every backend implements.
pub trait Backend {
    fn base(&self) -> &Base;

    /// Prepares whatever the volume needs before it can be bound.  Idempotent.
    fn allocate(&mut self, host: &Host) -> Result<()>;

    /// Binds the volume to a host device and records it.
    fn connect(&mut self, host: &Host) -> Result<()>;

    /// Releases the device binding.  On failure the binding is kept so a retry can finish it.
    fn disconnect(&mut self, host: &Host) -> Result<()>;

    /// Removes the volume's data.
    fn cleanup(&mut self, _host: &Host) -> Result<()> {
        Err(Error::Unsupported("cleanup"))
    }

    /// Checks that the device binding is still alive on the host.
    fn probe(&self, host: &Host) -> Result<()>;

    /// Whether a connect engine record is present.
    fn is_connected(&self) -> bool;

    /// Persists the snapshot without touching the output descriptor.
    fn save_state(&self) -> Result<()>;

    /// Persists the snapshot, then publishes the output descriptor.
    fn write_config(&self) -> Result<()> {
        self.save_state()?;
        self.base().write_output()
    }
}

/// A volume of either backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RootFs {
    Qemu(QemuRootFs),
    Iscsi(IscsiRootFs),
}

impl RootFs {
    /// Builds a new volume of the backend named by `kind`.
    ///
    /// Writes the type sentinel and an initial snapshot, so a volume that fails later in its
    /// first publish can still be loaded.
    pub fn create(id: &str, kind: &str, layout: &Layout, params: &Parameters) -> Result<Self> {
        let kind: RootFsKind = kind.parse()?;
        // Validate before anything lands on disk.
        let rootfs = match kind {
            RootFsKind::Qemu => {
                let spec = qemu::Params::parse(layout, params)?;
                RootFs::Qemu(QemuRootFs::new(Base::create(id, kind, layout, params)?, spec))
            }
            RootFsKind::Iscsi => {
                let spec = iscsi::Params::parse(params)?;
                RootFs::Iscsi(IscsiRootFs::new(Base::create(id, kind, layout, params)?, spec))
            }
        };
        if let Err(e) = rootfs.save_state() {
            // Without a snapshot the sentinel would make the volume unloadable.
            let sentinel = rootfs.base().data_path.join(TYPE_FILE);
            if let Err(rm_err) = fs::remove_file(&sentinel) {
                warn!("Removing {} failed: {rm_err}", sentinel.display());
            }
            return Err(e);
        }
        info!("created {kind} rootfs {id}");
        Ok(rootfs)
    }

    /// Rebuilds volume `id` from its sentinel and snapshot.
    pub fn load(id: &str, layout: &Layout) -> Result<Self> {
        let data_path = layout.data_path(id);
        let sentinel = data_path.join(TYPE_FILE);
        let kind = fs::read_to_string(&sentinel)
            .map_err(|e| Error::corrupted(&sentinel, e))?;
        let kind: RootFsKind = kind
            .trim()
            .parse()
            .map_err(|e| Error::corrupted(&sentinel, e))?;

        Ok(match kind {
            RootFsKind::Qemu => RootFs::Qemu(read_state(&data_path.join(qemu::STATE_FILE))?),
            RootFsKind::Iscsi => RootFs::Iscsi(read_state(&data_path.join(iscsi::STATE_FILE))?),
        })
    }

    pub fn kind(&self) -> RootFsKind {
        self.base().kind
    }

    pub fn device(&self) -> &str {
        &self.base().device
    }

    pub fn output(&self) -> Output {
        let base = self.base();
        Output {
            device: base.device.clone(),
            fs_type: base.file_system_type.clone(),
        }
    }

    fn backend(&self) -> &dyn Backend {
        match self {
            RootFs::Qemu(q) => q,
            RootFs::Iscsi(i) => i,
        }
    }

    fn backend_mut(&mut self) -> &mut dyn Backend {
        match self {
            RootFs::Qemu(q) => q,
            RootFs::Iscsi(i) => i,
        }
    }
}

impl Backend for RootFs {
    fn base(&self) -> &Base {
        self.backend().base()
    }

    fn allocate(&mut self, host: &Host) -> Result<()> {
        self.backend_mut().allocate(host)
    }

    fn connect(&mut self, host: &Host) -> Result<()> {
        self.backend_mut().connect(host)
    }

    fn disconnect(&mut self, host: &Host) -> Result<()> {
        self.backend_mut().disconnect(host)
    }

    fn cleanup(&mut self, host: &Host) -> Result<()> {
        self.backend_mut().cleanup(host)
    }

    fn probe(&self, host: &Host) -> Result<()> {
        self.backend().probe(host)
    }

    fn is_connected(&self) -> bool {
        self.backend().is_connected()
    }

    fn save_state(&self) -> Result<()> {
        self.backend().save_state()
    }

    fn write_config(&self) -> Result<()> {
        self.backend().write_config()
    }
}

fn read_state<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let data = fs::read(path).map_err(|e| Error::corrupted(path, e))?;
    serde_json::from_slice(&data).map_err(|e| Error::corrupted(path, e))
}

fn write_state<T: Serialize>(path: &Path, state: &T) -> Result<()> {
    write_file_atomic(path, &serde_json::to_vec(state)?, STATE_MODE)
}

/// A required, non-empty volume parameter.
fn required<'a>(params: &'a Parameters, key: &str) -> Result<&'a str> {
    match params.get(key).map(|v| v.trim()) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::InvalidParameter(format!("{key} is required"))),
    }
}
