// Copyright 2026 The extrootfs Developers. All Rights Reserved.
//
// SPDX-License-Identifier: (Apache-2.0 AND BSD-3-Clause)

//! SCSI-3 persistent reservations through `sg_persist`.

use log::*;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use md5::{Digest, Md5};
use regex::Regex;

use crate::util::{run, CommandLine, Exec};
use crate::{Error, Result};

const SG_PERSIST_TIMEOUT: Duration = Duration::from_secs(5);

/// PERSISTENT RESERVE OUT type codes (SPC-4, table 215).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReservationType {
    WriteExclusive = 1,
    ExclusiveAccess = 3,
    WriteExclusiveRegistrantsOnly = 5,
    ExclusiveAccessRegistrantsOnly = 6,
    WriteExclusiveAllRegistrants = 7,
    ExclusiveAccessAllRegistrants = 8,
}

/// Root filesystems are held exclusively: nobody else may read or write the LUN.
const ROOTFS_RESERVATION: ReservationType = ReservationType::ExclusiveAccess;

impl ReservationType {
    fn prout_arg(self) -> String {
        format!("--prout-type={}", self as u8)
    }
}

/// Reservation key for a node identity: the first 15 hex digits of its MD5, i.e. 60 bits,
/// rendered as `0x` plus lower-case hex without leading zeros.
pub fn key_for(identity: &[u8]) -> String {
    let digest = hex::encode(Md5::digest(identity));
    // 15 hex digits always fit a u64.
    let value = u64::from_str_radix(&digest[..15], 16).unwrap_or_default();
    format!("0x{value:x}")
}

/// Reservation key of this node, derived from the raw bytes of `identity_file` (trailing
/// newline included).
pub fn host_key(identity_file: &Path) -> Result<String> {
    let identity = fs::read(identity_file)
        .map_err(|e| Error::io(format!("read {}", identity_file.display()), e))?;
    Ok(key_for(&identity))
}

/// Makes this node the exclusive holder of the LUN behind `device`.
///
/// Registers the host key if needed, then either reserves a free LUN, keeps a reservation we
/// already hold, or preempts whoever holds it.  Returns the host key.
pub fn preempt_lun(exec: &dyn Exec, identity_file: &Path, device: &str) -> Result<String> {
    let key = host_key(identity_file).map_err(|e| Error::reservation("host key", e))?;

    let keys = sg_persist(exec, &["--read-keys", device])
        .map_err(|e| Error::reservation("read keys", e))?;
    if !registered_keys(&keys).iter().any(|k| same_key(k, &key)) {
        sg_persist(
            exec,
            &[
                "--out",
                "--register",
                &format!("--param-sark={key}"),
                device,
                "--param-aptpl",
            ],
        )
        .map_err(|e| Error::reservation("register", e))?;
    }

    let reservation = sg_persist(exec, &["--read-reservation", device])
        .map_err(|e| Error::reservation("read reservation", e))?;
    if reservation.contains("NO reservation") {
        info!("reserving {device} with key {key}");
        sg_persist(
            exec,
            &[
                "--out",
                "--reserve",
                &format!("--param-rk={key}"),
                &ROOTFS_RESERVATION.prout_arg(),
                device,
            ],
        )
        .map_err(|e| Error::reservation("reserve", e))?;
        return Ok(key);
    }

    let holder = reservation_holder(&reservation).ok_or_else(|| {
        Error::reservation(
            "read reservation",
            Error::InvalidParameter(format!("no reservation key in: {}", reservation.trim())),
        )
    })?;
    if same_key(&holder, &key) {
        debug!("{device} is already reserved by this node");
        return Ok(key);
    }

    info!("preempting reservation of {device} held by {holder}");
    sg_persist(
        exec,
        &[
            "--out",
            "--preempt",
            &format!("--param-rk={key}"),
            &format!("--param-sark={holder}"),
            &ROOTFS_RESERVATION.prout_arg(),
            device,
        ],
    )
    .map_err(|e| Error::reservation("preempt", e))?;
    Ok(key)
}

fn sg_persist(exec: &dyn Exec, args: &[&str]) -> Result<String> {
    let cmd = CommandLine::new("sg_persist")
        .args(args)
        .timeout(SG_PERSIST_TIMEOUT);
    Ok(run(exec, "iscsi.PreemptLun", &cmd)?.combined())
}

/// Keys listed by `--read-keys`, one `0x...` per line after the header.
fn registered_keys(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("0x") && !l.contains(' '))
        .map(str::to_string)
        .collect()
}

fn reservation_holder(output: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"Key=(\w+)").unwrap());
    re.captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Keys are compared by value, `sg_persist` may pad them differently than we render them.
fn same_key(a: &str, b: &str) -> bool {
    match (parse_key(a), parse_key(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a.eq_ignore_ascii_case(b),
    }
}

fn parse_key(key: &str) -> Option<u64> {
    let digits = key.strip_prefix("0x").or_else(|| key.strip_prefix("0X"))?;
    u64::from_str_radix(digits, 16).ok()
}
