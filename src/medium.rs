//! Contracts for the two raw media behind the logical address space.
//!
//! The internal medium is any [`NorFlash`](embedded_storage_async::nor_flash::NorFlash).
//! Its operations are futures that complete when the flash controller signals the end of
//! the queued operation. [`FlashAddressSpace`](crate::FlashAddressSpace) polls those futures
//! to completion, so callers never observe the asynchrony.
//!
//! The external medium is a byte addressable memory (an SPI EEPROM on the badge) modelled
//! by the [`Eeprom`] trait below. It has no erase and no alignment requirements, but it
//! keeps an internal busy flag while it commits a write.

use embedded_storage_async::nor_flash::ErrorType;

/// A byte addressable external memory.
///
/// Reads and writes are synchronous at the driver level. After a write the device may still
/// be committing the data internally, which is reported through [`Eeprom::is_busy`].
pub trait Eeprom: ErrorType {
    /// Read `bytes.len()` bytes starting at `address`.
    fn read(&mut self, address: u32, bytes: &mut [u8]) -> Result<(), Self::Error>;

    /// Write `bytes` starting at `address`.
    ///
    /// Any byte can be overwritten with any value. Splitting the transfer into device pages
    /// is the job of the driver.
    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Returns true while the device is still committing a previous write.
    fn is_busy(&mut self) -> Result<bool, Self::Error>;

    /// The size of the memory in bytes.
    fn capacity(&self) -> usize;
}
