// Copyright 2026 The extrootfs Developers. All Rights Reserved.
//
// SPDX-License-Identifier: (Apache-2.0 AND BSD-3-Clause)

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::util::{run, CommandLine, Exec};
use crate::{Error, Result};

/// Metadata reported by `qemu-img info`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImgInfo {
    /// File that was analyzed
    #[serde(default)]
    pub filename: String,
    /// Image format (qcow2, raw, ...)
    pub format: String,
    /// Bytes allocated on the host filesystem
    #[serde(rename = "actual-size", default)]
    pub actual_size: i64,
    /// Size of the disk as seen by a guest
    #[serde(rename = "virtual-size", default)]
    pub virtual_size: i64,
}

pub fn image_info(exec: &dyn Exec, image: &Path) -> Result<ImgInfo> {
    // qemu-img's own message for a missing file is less helpful than this one.
    if let Err(e) = std::fs::metadata(image) {
        return Err(Error::io(format!("image {}", image.display()), e));
    }

    let cmd = CommandLine::new("qemu-img").args(["info", "--output=json"]).arg(path_str(image));
    let out = run(exec, "image.Info", &cmd)?;
    Ok(serde_json::from_str(&out.stdout)?)
}

/// Creates `overlay` as a copy-on-write child of `base`, in the same format as the base.
pub fn create_from_base(exec: &dyn Exec, overlay: &Path, base: &Path, format: &str) -> Result<()> {
    let cmd = CommandLine::new("qemu-img")
        .args(["create", "-f", format])
        .arg(path_str(overlay))
        .args(["-b", &path_str(base), "-F", format]);
    run(exec, "image.Create", &cmd)?;
    Ok(())
}

pub(crate) fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
