//! Access validation: the per-access hot path.
//!
//! The accept path reads shadow cells only. No locks, no allocation. A
//! rejected access comes back as [`AccessInfo`] describing where it went
//! wrong. Deciding *why* is the report builder's job.

use serde::Serialize;

use crate::shadow::{MATCH_ALL_TAG, ShadowMemory, pointer_tag, untag};

/// Direction of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessDirection {
    Read,
    Write,
    /// Deallocation of the pointer.
    Free,
}

impl AccessDirection {
    #[must_use]
    pub fn from_is_write(is_write: bool) -> Self {
        if is_write { Self::Write } else { Self::Read }
    }

    /// Capitalized label used in report headers.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Read => "Read",
            Self::Write => "Write",
            Self::Free => "Free",
        }
    }
}

/// Geometry of a rejected access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessInfo {
    /// Address as issued, tag included.
    pub address: usize,
    pub untagged: usize,
    pub len: usize,
    pub direction: AccessDirection,
    pub fault_pc: usize,
    /// First byte of the footprint that failed validation.
    pub first_bad_address: usize,
    pub tag_mismatch: bool,
    pub pointer_tag: Option<u8>,
    pub memory_tag: Option<u8>,
}

impl AccessInfo {
    /// Describe a deallocation of `address` that the tracker rejected.
    #[must_use]
    pub fn deallocation(shadow: &ShadowMemory, address: usize, len: usize, fault_pc: usize) -> Self {
        let tag_mode = shadow.tag_mode();
        let untagged = if tag_mode { untag(address) } else { address };
        Self {
            address,
            untagged,
            len,
            direction: AccessDirection::Free,
            fault_pc,
            first_bad_address: untagged,
            tag_mismatch: false,
            pointer_tag: tag_mode.then(|| pointer_tag(address)),
            memory_tag: shadow.tag_of(untagged),
        }
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        self.direction == AccessDirection::Write
    }

    /// Offset of the first bad byte from the access start.
    #[must_use]
    pub fn bad_offset(&self) -> usize {
        self.first_bad_address.wrapping_sub(self.untagged)
    }
}

/// Stateless checker over a shadow window.
#[derive(Clone, Copy)]
pub struct AccessValidator<'a> {
    shadow: &'a ShadowMemory,
}

impl<'a> AccessValidator<'a> {
    #[must_use]
    pub fn new(shadow: &'a ShadowMemory) -> Self {
        Self { shadow }
    }

    /// Check a read or write of `len` bytes at `addr`.
    #[must_use]
    pub fn validate(&self, addr: usize, len: usize, is_write: bool, fault_pc: usize) -> Option<AccessInfo> {
        self.validate_access(addr, len, AccessDirection::from_is_write(is_write), fault_pc)
    }

    /// Check an access in any direction. `None` means the access is safe.
    #[must_use]
    pub fn validate_access(
        &self,
        addr: usize,
        len: usize,
        direction: AccessDirection,
        fault_pc: usize,
    ) -> Option<AccessInfo> {
        if len == 0 {
            return None;
        }
        let tag_mode = self.shadow.tag_mode();
        let untagged = if tag_mode { untag(addr) } else { addr };
        let ptr_tag = tag_mode.then(|| pointer_tag(addr));

        let bounds = if untagged.checked_add(len).is_none() {
            Some(0)
        } else {
            self.shadow.first_invalid_byte(untagged, len)
        };

        let (offset, tag_mismatch) = match bounds {
            Some(offset) => {
                let bad = untagged + offset;
                let mismatch = match (ptr_tag, self.shadow.tag_of(bad)) {
                    (Some(p), Some(m)) => p != MATCH_ALL_TAG && p != m,
                    _ => false,
                };
                (offset, mismatch)
            }
            None => {
                let tag = ptr_tag?;
                (self.shadow.first_tag_mismatch(untagged, len, tag)?, true)
            }
        };

        let first_bad_address = untagged + offset;
        Some(AccessInfo {
            address: addr,
            untagged,
            len,
            direction,
            fault_pc,
            first_bad_address,
            tag_mismatch,
            pointer_tag: ptr_tag,
            memory_tag: self.shadow.tag_of(first_bad_address),
        })
    }
}
