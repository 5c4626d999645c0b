#![cfg_attr(not(any(test, doctest, feature = "std")), no_std)]
#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

// Assumptions made in this crate:
//
// - the external medium is byte addressable and needs no erase
// - the internal medium is a paged NOR flash that can only clear bits without an erase
// - a single caller drives the store, radio exclusion is arranged outside of it

use core::ops::{Deref, DerefMut};
use embedded_storage_async::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};

pub mod address_space;
pub mod badge_fs;
pub mod medium;

#[cfg(any(test, doctest, feature = "_test"))]
/// In-memory media types that can be used for mocking.
pub mod mock_flash;

pub use address_space::{AddressSpace, FlashAddressSpace};
pub use badge_fs::{BadgeFs, Key, PartitionLayout, PartitionMapping, PartitionStatus};
pub use medium::Eeprom;

/// The biggest wordsize we support.
///
/// Stm32 internal flash has 256-bit words, so 32 bytes.
/// The nrf5x internal flash uses 4-byte words.
const MAX_WORD_SIZE: usize = 32;

// Type representing buffer aligned to 4 byte boundary.
#[repr(align(4))]
pub(crate) struct AlignedBuf<const SIZE: usize>(pub(crate) [u8; SIZE]);
impl<const SIZE: usize> Deref for AlignedBuf<SIZE> {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<const SIZE: usize> DerefMut for AlignedBuf<SIZE> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// The physical medium that backs a part of the logical address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Medium {
    /// The byte addressable external memory
    External,
    /// The paged internal flash
    Internal,
}

/// Classification of an error reported by a medium driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum StorageErrorKind {
    /// The driver rejected the alignment of an operation
    NotAligned,
    /// The driver rejected the address range of an operation
    OutOfBounds,
    /// Any other driver failure, timeouts included
    Other,
}

impl From<NorFlashErrorKind> for StorageErrorKind {
    fn from(kind: NorFlashErrorKind) -> Self {
        match kind {
            NorFlashErrorKind::NotAligned => Self::NotAligned,
            NorFlashErrorKind::OutOfBounds => Self::OutOfBounds,
            _ => Self::Other,
        }
    }
}

/// The main error type
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Error {
    /// An address or length lies outside of the valid range.
    /// This is a programming or configuration error.
    InvalidRange,
    /// The item or the partition set does not fit in the available capacity.
    NoMem,
    /// There is no such item. The partition is empty, the key went stale or nothing matched.
    NotFound,
    /// The external memory kept reporting busy after a write.
    /// The operation may be retried later.
    Busy,
    /// A write did not read back as written or a stored structure is inconsistent.
    /// The store refuses all further work once this has been reported.
    Internal,
    /// A provided buffer was too small to be used (usize is size needed)
    BufferTooSmall(usize),
    /// An error in one of the media drivers
    Storage {
        /// The medium that reported the error
        medium: Medium,
        /// What the driver reported
        kind: StorageErrorKind,
    },
}

impl Error {
    pub(crate) fn storage<E: NorFlashError>(medium: Medium, error: E) -> Self {
        Self::Storage {
            medium,
            kind: error.kind().into(),
        }
    }
}

/// Round the given number up to align with the wordsize of the flash.
/// If the number is already aligned, it is not changed.
const fn round_up_to_alignment<S: NorFlash>(value: u32) -> u32 {
    let alignment = S::WORD_SIZE as u32;
    match value % alignment {
        0 => value,
        r => value + (alignment - r),
    }
}

/// Round the given number down to align with the wordsize of the flash.
/// If the number is already aligned, it is not changed.
const fn round_down_to_alignment<S: NorFlash>(value: u32) -> u32 {
    let alignment = S::WORD_SIZE as u32;
    (value / alignment) * alignment
}

/// Extension trait to get the overall word size, which is the largest of the write and read word size
trait NorFlashExt {
    /// The largest of the write and read word size
    const WORD_SIZE: usize;
}

impl<S: NorFlash> NorFlashExt for S {
    const WORD_SIZE: usize = if Self::WRITE_SIZE > Self::READ_SIZE {
        Self::WRITE_SIZE
    } else {
        Self::READ_SIZE
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    type MockFlash = mock_flash::MockFlashBase<4, 4, 64>;

    #[test]
    fn alignment() {
        assert_eq!(round_up_to_alignment::<MockFlash>(0), 0);
        assert_eq!(round_up_to_alignment::<MockFlash>(1), 4);
        assert_eq!(round_up_to_alignment::<MockFlash>(4), 4);
        assert_eq!(round_up_to_alignment::<MockFlash>(7), 8);
        assert_eq!(round_down_to_alignment::<MockFlash>(7), 4);
        assert_eq!(round_down_to_alignment::<MockFlash>(8), 8);
    }

    #[test]
    fn storage_error_keeps_kind() {
        assert_eq!(
            Error::storage(Medium::Internal, mock_flash::MockFlashError::Timeout),
            Error::Storage {
                medium: Medium::Internal,
                kind: StorageErrorKind::Other
            }
        );
        assert_eq!(
            Error::storage(Medium::External, mock_flash::MockFlashError::OutOfBounds),
            Error::Storage {
                medium: Medium::External,
                kind: StorageErrorKind::OutOfBounds
            }
        );
    }
}
