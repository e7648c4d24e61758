// Copyright 2026 The extrootfs Developers. All Rights Reserved.
//
// SPDX-License-Identifier: (Apache-2.0 AND BSD-3-Clause)

//! qcow2 image handling and NBD device binding.

pub mod image;
pub mod nbd;

pub use image::ImgInfo;
pub use nbd::{Nbd, NbdSlots};
