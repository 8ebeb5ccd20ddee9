//! Identifiers, status codes and errors shared by the pager and its collaborators.

use std::fmt;

use serde::Serialize;

/// Identity of a backing file, assigned by the filesystem layer.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct FileId(pub u64);

/// Identity of a pager instance inside one [`PagerSystem`](crate::primitives::pager::PagerSystem).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct PagerId(pub u64);

/// Identity of the filesystem (mount point) a backing file lives on.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct MountId(pub u32);

/// Arena key of a resident page: owning pager plus page index within its object.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct PageKey {
    /// Pager owning the page.
    pub pager: PagerId,
    /// Page index (file offset divided by the page size).
    pub index: u64,
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a pager transfer (`get`, `put`, and the shared I/O engine).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum PagerStatus {
    /// Every requested page is present and busy for the caller.
    Ok,
    /// The request started past the end of the object (raced a truncate).
    Bad,
    /// Locked lookup could not satisfy the request without sleeping.
    Unlock,
    /// The backing store failed the transfer.
    Error,
    /// A non-blocking request ran into a resource shortage.
    Again,
    /// A sleep inside the request was interrupted.
    Interrupted,
}

impl PagerStatus {
    /// Returns true for [`PagerStatus::Ok`].
    pub fn is_ok(self) -> bool {
        self == PagerStatus::Ok
    }

    /// Returns the lowercase name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            PagerStatus::Ok => "ok",
            PagerStatus::Bad => "bad",
            PagerStatus::Unlock => "unlock",
            PagerStatus::Error => "error",
            PagerStatus::Again => "again",
            PagerStatus::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for PagerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class of a block-special device backing a pager.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum DeviceClass {
    /// Random-access disk; the only block device that may be paged.
    Disk,
    /// Sequential tape device.
    Tape,
    /// Anything else.
    Other,
}

/// Errors returned by the pager and its collaborators.
#[derive(thiserror::Error, Debug)]
pub enum VnError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid argument or configuration.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The calling thread already holds the file lock it tried to take.
    #[error("file lock already held by the calling thread")]
    LockRecursion,
    /// The backing file does not support the requested query.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// Attaching a pager failed.
    #[error("attach: {0}")]
    Attach(#[from] AttachError),
    /// A sleep was interrupted.
    #[error("interrupted")]
    Interrupted,
    /// Options text is not valid TOML for the expected schema.
    #[error("options parse: {0}")]
    OptionsParse(#[from] toml::de::Error),
    /// Options could not be rendered as TOML.
    #[error("options render: {0}")]
    OptionsRender(#[from] toml::ser::Error),
}

/// Reasons an attach can fail.
#[derive(thiserror::Error, Debug)]
pub enum AttachError {
    /// Block devices can only be paged when they are disks.
    #[error("block device of class {0:?} cannot be paged")]
    WrongDeviceKind(DeviceClass),
    /// Querying the size of the backing file failed.
    #[error("size query failed: {0}")]
    SizeQuery(#[source] Box<VnError>),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, VnError>;
