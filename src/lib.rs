// Copyright 2026 The extrootfs Developers. All Rights Reserved.
//
// SPDX-License-Identifier: (Apache-2.0 AND BSD-3-Clause)

/*!
 * Node-local root filesystem provisioning.
 *
 * A root filesystem is either a copy-on-write qcow2 overlay bound through an NBD device
 * ([`rootfs::qemu`]) or a remote iSCSI LUN claimed through SCSI-3 persistent reservations
 * ([`rootfs::iscsi`]).  [`node::NodeService`] drives the per-volume lifecycle
 * (allocate, connect, persist, disconnect) under a per-volume lock.
 */

pub mod host;
pub mod iscsi;
pub mod lock;
pub mod node;
pub mod qemu;
pub mod rootfs;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;
use std::{error, fmt, io};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// A volume parameter is missing or malformed.
    InvalidParameter(String),
    /// The backend kind is neither `qemu` nor `iscsi`.
    UnknownBackend(String),
    /// Every NBD slot exposed by the kernel is in use.
    NoFreeDevice,
    /// The kernel did not acknowledge an operation within the poll window.
    Timeout {
        op: &'static str,
        what: String,
    },
    /// An external command could not be started.
    Spawn {
        command: String,
        source: io::Error,
    },
    /// An external command exited unsuccessfully.
    CommandFailed {
        op: &'static str,
        command: String,
        status: Option<i32>,
        output: String,
    },
    /// A persistent-reservation stage failed; the LUN must not be considered owned.
    Reservation {
        stage: &'static str,
        source: Box<Error>,
    },
    /// The sentinel or snapshot of a volume is missing or unparsable.
    Corrupted {
        path: PathBuf,
        reason: String,
    },
    Io {
        context: String,
        source: io::Error,
    },
    Json(serde_json::Error),
    /// No session of an iSCSI target reports a logged-in state.
    Unhealthy(String),
    /// The operation needs state that an earlier lifecycle step should have produced.
    NotConnected(&'static str),
    /// The operation exists in the interface but has no implementation.
    Unsupported(&'static str),
    /// Another lifecycle operation holds the lock for this volume.
    InProgress(String),
    /// Failure of a lifecycle step, tagged with the volume it concerns.
    Volume {
        op: &'static str,
        id: String,
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn corrupted(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Error::Corrupted {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn volume(op: &'static str, id: &str, source: Error) -> Self {
        Error::Volume {
            op,
            id: id.to_string(),
            source: Box::new(source),
        }
    }

    pub(crate) fn reservation(stage: &'static str, source: Error) -> Self {
        Error::Reservation {
            stage,
            source: Box::new(source),
        }
    }

    /// Returns the innermost error, looking through lifecycle and reservation wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Volume { source, .. } | Error::Reservation { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Error::Timeout { .. })
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self.root(), Error::InProgress(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::Error::*;
        match self {
            InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            UnknownBackend(kind) => write!(f, "unknown rootfs type '{kind}'"),
            NoFreeDevice => write!(f, "unable to allocate an NBD device: all slots are in use"),
            Timeout { op, what } => write!(f, "{op}: timed out waiting for {what}"),
            Spawn { command, source } => write!(f, "failed to run '{command}': {source}"),
            CommandFailed {
                op,
                command,
                status,
                output,
            } => {
                match status {
                    Some(code) => write!(f, "{op}: '{command}' exited with status {code}")?,
                    None => write!(f, "{op}: '{command}' was terminated by a signal")?,
                }
                let output = output.trim();
                if !output.is_empty() {
                    write!(f, ": {output}")?;
                }
                Ok(())
            }
            Reservation { stage, source } => {
                write!(f, "persistent reservation failed at '{stage}': {source}")
            }
            Corrupted { path, reason } => write!(
                f,
                "volume state at {} is unusable ({reason}); manual cleanup required",
                path.display()
            ),
            Io { context, source } => write!(f, "{context}: {source}"),
            Json(err) => write!(f, "state serialization: {err}"),
            Unhealthy(msg) => write!(f, "check session state failed: {msg}"),
            NotConnected(what) => write!(f, "{what}"),
            Unsupported(op) => write!(f, "{op} is not supported"),
            InProgress(id) => write!(
                f,
                "an operation with the given volume ID {id} already exists"
            ),
            Volume { op, id, source } => write!(f, "{op} rootfs {id} failed: {source}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Spawn { source, .. } | Error::Io { source, .. } => Some(source),
            Error::Json(err) => Some(err),
            Error::Reservation { source, .. } | Error::Volume { source, .. } => {
                Some(source.as_ref())
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::new(io::ErrorKind::Other, e)
    }
}
