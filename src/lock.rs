// Copyright 2026 The extrootfs Developers. All Rights Reserved.
//
// SPDX-License-Identifier: (Apache-2.0 AND BSD-3-Clause)

use std::collections::HashSet;
use std::sync::Mutex;

/// Per-volume mutual exclusion.  Acquisition never waits: a second caller for the same ID is
/// turned away and expected to retry.
#[derive(Debug, Default)]
pub struct VolumeLocks {
    held: Mutex<HashSet<String>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `id` is already held.
    pub fn try_acquire(&self, id: &str) -> bool {
        self.held.lock().unwrap().insert(id.to_string())
    }

    pub fn release(&self, id: &str) {
        self.held.lock().unwrap().remove(id);
    }

    /// Like `try_acquire()`, but the lock is released when the returned guard is dropped.
    pub fn lock(&self, id: &str) -> Option<VolumeGuard<'_>> {
        self.try_acquire(id).then(|| VolumeGuard {
            locks: self,
            id: id.to_string(),
        })
    }
}

pub struct VolumeGuard<'a> {
    locks: &'a VolumeLocks,
    id: String,
}

impl Drop for VolumeGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.id);
    }
}
