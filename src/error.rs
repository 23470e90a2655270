// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt;
use std::io;

/// Errors from metadata handling and the VG object model. Each carries a
/// stable short tag so scripts can match on it.
#[derive(Debug)]
pub enum MetadataError {
    /// The VG is missing one or more PVs and the operation needs all of them.
    Partial(String),
    /// PV still has extents allocated to LVs.
    PvInUse(String),
    /// No allocation satisfying the request and policy exists.
    InsufficientFreeExtents { requested: u64, available: u64 },
    /// The requested segment type transition is not in the matrix.
    UnsupportedConversion { from: String, to: String },
    /// LV has dependents (open snapshot origin, pool with thin LVs, ...).
    InUse(String),
    /// Fewer than the required number of MDAs could be written.
    MetadataWrite(String),
    /// A forked helper tool failed.
    ExternalTool { command: String, status: i32 },
    /// An invariant check failed on a computed mutation.
    Inconsistent(String),
    /// Name lookup failed.
    NotFound(String),
    /// Name already taken within the VG.
    NameCollision(String),
    /// VG belongs to another host's system_id.
    Foreign { vg: String, system_id: String },
    /// VG carries the legacy clustered flag and no takeover was requested.
    Clustered(String),
    /// VG is exported.
    Exported(String),
    /// Request is malformed (bad name, bad size, bad option combination).
    Invalid(String),
}

impl MetadataError {
    pub fn tag(&self) -> &'static str {
        match *self {
            MetadataError::Partial(_) => "ERR_PARTIAL",
            MetadataError::PvInUse(_) => "ERR_PV_IN_USE",
            MetadataError::InsufficientFreeExtents { .. } => "ERR_INSUFFICIENT_FREE_EXTENTS",
            MetadataError::UnsupportedConversion { .. } => "ERR_UNSUPPORTED_CONVERSION",
            MetadataError::InUse(_) => "ERR_IN_USE",
            MetadataError::MetadataWrite(_) => "ERR_METADATA_WRITE",
            MetadataError::ExternalTool { .. } => "ERR_EXTERNAL_TOOL",
            MetadataError::Inconsistent(_) => "ERR_INCONSISTENT",
            MetadataError::NotFound(_) => "ERR_NOT_FOUND",
            MetadataError::NameCollision(_) => "ERR_NAME_COLLISION",
            MetadataError::Foreign { .. } => "ERR_FOREIGN",
            MetadataError::Clustered(_) => "ERR_CLUSTERED",
            MetadataError::Exported(_) => "ERR_EXPORTED",
            MetadataError::Invalid(_) => "ERR_INVALID",
        }
    }
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MetadataError::Partial(vg) => write!(f, "{}: VG {} is missing PVs", self.tag(), vg),
            MetadataError::PvInUse(pv) => write!(f, "{}: PV {} has allocated extents", self.tag(), pv),
            MetadataError::InsufficientFreeExtents { requested, available } => write!(
                f,
                "{}: {} extents requested, {} free",
                self.tag(),
                requested,
                available
            ),
            MetadataError::UnsupportedConversion { from, to } => {
                write!(f, "{}: cannot convert {} to {}", self.tag(), from, to)
            }
            MetadataError::InUse(lv) => write!(f, "{}: LV {} is in use", self.tag(), lv),
            MetadataError::MetadataWrite(msg) => write!(f, "{}: {}", self.tag(), msg),
            MetadataError::ExternalTool { command, status } => {
                write!(f, "{}: {} exited {}", self.tag(), command, status)
            }
            MetadataError::Inconsistent(msg) => write!(f, "{}: {}", self.tag(), msg),
            MetadataError::NotFound(name) => write!(f, "{}: {} not found", self.tag(), name),
            MetadataError::NameCollision(name) => {
                write!(f, "{}: {} already exists", self.tag(), name)
            }
            MetadataError::Foreign { vg, system_id } => {
                write!(f, "{}: VG {} owned by system {}", self.tag(), vg, system_id)
            }
            MetadataError::Clustered(vg) => {
                write!(f, "{}: VG {} has the legacy clustered flag", self.tag(), vg)
            }
            MetadataError::Exported(vg) => write!(f, "{}: VG {} is exported", self.tag(), vg),
            MetadataError::Invalid(msg) => write!(f, "{}: {}", self.tag(), msg),
        }
    }
}

/// Lock errors use the daemon's stable numeric codes so results survive the
/// wire protocol unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// Lock conflict after the retry budget.
    Again,
    /// Operation timed out (lockspace join deadline).
    TimedOut,
    /// Lockspace not found.
    NoLockspace,
    /// Lockspace has not finished starting.
    Starting,
    /// Malformed lock arguments.
    Args,
    /// No host_id configured or host_id lease failure.
    HostId,
    /// The lock manager itself is not running or failed.
    Manager,
    /// Lockspace storage preparation failed.
    Prepare,
    /// Generic daemon-side failure.
    Lockd,
    /// Leases were lost; the VG is killed.
    VgKilled,
    /// Transient lease I/O error.
    LockIo,
    /// The VG was removed while locks were held.
    Removed,
    /// Failed to open the internal lock LV.
    DevOpen,
    /// Backend returned an unclassified error.
    LmErr,
    /// A persistent lock exists and was not adopted.
    Orphan,
    /// Nothing to adopt.
    AdoptNone,
    /// Orphan found in an incompatible mode.
    AdoptRetry,
    /// Lease I/O timed out.
    IoTimeout,
    /// Lease needs repair before use.
    LockRepair,
}

impl LockError {
    pub fn code(self) -> i32 {
        match self {
            LockError::Again => 11,
            LockError::TimedOut => 110,
            LockError::NoLockspace => 210,
            LockError::Starting => 211,
            LockError::Args => 212,
            LockError::HostId => 213,
            LockError::Manager => 214,
            LockError::Prepare => 215,
            LockError::Lockd => 216,
            LockError::VgKilled => 217,
            LockError::LockIo => 218,
            LockError::Removed => 219,
            LockError::DevOpen => 220,
            LockError::LmErr => 221,
            LockError::Orphan => 222,
            LockError::AdoptNone => 223,
            LockError::AdoptRetry => 224,
            LockError::IoTimeout => 225,
            LockError::LockRepair => 226,
        }
    }

    pub fn from_code(code: i32) -> Option<LockError> {
        Some(match code {
            11 => LockError::Again,
            110 => LockError::TimedOut,
            210 => LockError::NoLockspace,
            211 => LockError::Starting,
            212 => LockError::Args,
            213 => LockError::HostId,
            214 => LockError::Manager,
            215 => LockError::Prepare,
            216 => LockError::Lockd,
            217 => LockError::VgKilled,
            218 => LockError::LockIo,
            219 => LockError::Removed,
            220 => LockError::DevOpen,
            221 => LockError::LmErr,
            222 => LockError::Orphan,
            223 => LockError::AdoptNone,
            224 => LockError::AdoptRetry,
            225 => LockError::IoTimeout,
            226 => LockError::LockRepair,
            _ => return None,
        })
    }

    pub fn tag(self) -> &'static str {
        match self {
            LockError::Again => "EAGAIN",
            LockError::TimedOut => "ETIMEDOUT",
            LockError::NoLockspace => "ENOLS",
            LockError::Starting => "ESTARTING",
            LockError::Args => "EARGS",
            LockError::HostId => "EHOSTID",
            LockError::Manager => "EMANAGER",
            LockError::Prepare => "EPREPARE",
            LockError::Lockd => "ELOCKD",
            LockError::VgKilled => "EVGKILLED",
            LockError::LockIo => "ELOCKIO",
            LockError::Removed => "EREMOVED",
            LockError::DevOpen => "EDEVOPEN",
            LockError::LmErr => "ELMERR",
            LockError::Orphan => "EORPHAN",
            LockError::AdoptNone => "EADOPT_NONE",
            LockError::AdoptRetry => "EADOPT_RETRY",
            LockError::IoTimeout => "EIOTIMEOUT",
            LockError::LockRepair => "ELOCKREPAIR",
        }
    }
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.tag(), self.code())
    }
}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Nix(nix::Error),
    Parse(String),
    Metadata(MetadataError),
    Lock(LockError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The stable short tag carried by user-facing messages.
    pub fn tag(&self) -> &'static str {
        match self {
            Error::Io(_) => "ERR_IO",
            Error::Nix(_) => "ERR_OS",
            Error::Parse(_) => "ERR_PARSE",
            Error::Metadata(e) => e.tag(),
            Error::Lock(e) => e.tag(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "{}: {}", self.tag(), e),
            Error::Nix(e) => write!(f, "{}: {}", self.tag(), e),
            Error::Parse(msg) => write!(f, "{}: {}", self.tag(), msg),
            Error::Metadata(e) => write!(f, "{}", e),
            Error::Lock(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Error {
        Error::Nix(err)
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Error {
        Error::Metadata(err)
    }
}

impl From<LockError> for Error {
    fn from(err: LockError) -> Error {
        Error::Lock(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_codes_round_trip() {
        for e in [
            LockError::Again,
            LockError::NoLockspace,
            LockError::Starting,
            LockError::VgKilled,
            LockError::Removed,
            LockError::AdoptRetry,
        ] {
            assert_eq!(LockError::from_code(e.code()), Some(e));
        }
        assert_eq!(LockError::from_code(0), None);
    }

    #[test]
    fn metadata_tags_are_stable() {
        assert_eq!(MetadataError::Partial("vg0".into()).tag(), "ERR_PARTIAL");
        assert_eq!(
            MetadataError::InsufficientFreeExtents {
                requested: 10,
                available: 5
            }
            .tag(),
            "ERR_INSUFFICIENT_FREE_EXTENTS"
        );
    }
}
