// SPDX-License-Identifier: MPL-2.0

use core::fmt;

/// Errors returned by the page-table manager that backs a domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageTableError {
    /// No physical memory left for an intermediate table.
    NoMemory,
    /// The virtual address is not mapped.
    NotMapped,
    /// The virtual address is already mapped.
    AlreadyMapped,
    /// The address is not aligned to the translation granule.
    Unaligned,
}

/// An enumeration representing possible errors related to the SMMU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmmuError {
    /// Out of memory for a queue, a table or a context descriptor.
    NoMemory,
    /// The ASID space of the unit is exhausted.
    NoAsid,
    /// The hardware did not complete a handshake in time.
    Timeout,
    /// The unit lacks a feature the driver requires.
    Unsupported(&'static str),
    /// The stream ID is outside the stream table.
    InvalidStreamId(u32),
    /// The device has no stream ID mapping on this unit.
    NoStreamId,
    /// The domain still has contexts bound to it.
    Busy,
    /// The context has already been freed.
    AlreadyFreed,
    /// The caller passed arguments that do not describe a valid request.
    InvalidArgument,
    /// Error encountered during modification of the page table.
    PageTable(PageTableError),
}

impl From<PageTableError> for SmmuError {
    fn from(err: PageTableError) -> Self {
        SmmuError::PageTable(err)
    }
}

impl fmt::Display for SmmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmmuError::Unsupported(what) => write!(f, "unsupported: {}", what),
            SmmuError::InvalidStreamId(sid) => write!(f, "invalid stream ID {:#x}", sid),
            other => write!(f, "{:?}", other),
        }
    }
}

pub type Result<T> = core::result::Result<T, SmmuError>;

/// The bounded wait of [`poll_until`] ran out of iterations.
///
/// [`poll_until`]: crate::poll::poll_until
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeout;

impl From<Timeout> for SmmuError {
    fn from(_: Timeout) -> Self {
        SmmuError::Timeout
    }
}
