//! One contiguous logical address range over two media.
//!
//! ```text
//! 0                          boundary                                  total_size
//! ├──────────────────────────┼─────────────────────────────────────────┤
//! │    external (eeprom)     │      internal flash (flash_range)       │
//! │ byte granular, no erase  │ word aligned, page erase before write   │
//! └──────────────────────────┴─────────────────────────────────────────┘
//! ```
//!
//! Requests that straddle the boundary are split in two. Requests to the internal flash are
//! widened to whole words through a scratch page buffer, so callers have no alignment
//! requirements at all. Overwriting bytes that would need bits to go from 0 to 1 erases and
//! rewrites the containing page, keeping every other byte of that page intact.

use core::ops::Range;

use embassy_futures::block_on;
use embedded_storage_async::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};

use crate::{
    AlignedBuf, Error, MAX_WORD_SIZE, Medium, NorFlashExt, medium::Eeprom,
    round_down_to_alignment, round_up_to_alignment,
};

/// How often the busy flag of the external memory is polled after a write before
/// [`Error::Busy`] is returned.
pub const BUSY_POLL_LIMIT: u32 = 10_000;

/// Size of the stack buffers used for verifying and filling.
const CHUNK_SIZE: usize = MAX_WORD_SIZE * 2;

/// The read/write contract of a byte addressable logical flash.
///
/// Addresses run from 0 to [`AddressSpace::total_size`]. A zero length request always succeeds.
pub trait AddressSpace {
    /// The size of the address range in bytes
    fn total_size(&self) -> u32;

    /// The medium backing the given address
    fn medium_of(&self, address: u32) -> Medium;

    /// Read `bytes.len()` bytes starting at `address`.
    fn read(&mut self, address: u32, bytes: &mut [u8]) -> Result<(), Error>;

    /// Write `bytes` starting at `address`.
    ///
    /// Returns only once the data is durable and has been read back.
    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), Error>;

    /// Write `len` copies of `value` starting at `address`.
    fn fill(&mut self, address: u32, len: u32, value: u8) -> Result<(), Error> {
        check_range(self.total_size(), address, len as usize)?;

        let chunk = [value; CHUNK_SIZE];
        let mut address = address;
        let mut remaining = len as usize;
        while remaining > 0 {
            let chunk_len = remaining.min(CHUNK_SIZE);
            self.write(address, &chunk[..chunk_len])?;
            address += chunk_len as u32;
            remaining -= chunk_len;
        }

        Ok(())
    }
}

fn check_range(total_size: u32, address: u32, len: usize) -> Result<(), Error> {
    let end = u32::try_from(len)
        .ok()
        .and_then(|len| address.checked_add(len))
        .ok_or(Error::InvalidRange)?;

    if end > total_size {
        Err(Error::InvalidRange)
    } else {
        Ok(())
    }
}

/// The address space of the badge: an external memory followed by a range of internal flash.
///
/// `PAGE_SIZE` is the size of the scratch buffer used for word widening and page rewrites.
/// It must be at least the erase size of the internal flash.
pub struct FlashAddressSpace<E, F, const PAGE_SIZE: usize> {
    eeprom: E,
    flash: F,
    flash_range: Range<u32>,
    page_buffer: AlignedBuf<PAGE_SIZE>,
}

impl<E: Eeprom, F: NorFlash, const PAGE_SIZE: usize> FlashAddressSpace<E, F, PAGE_SIZE> {
    /// Create the address space.
    ///
    /// The whole external memory is mapped first, followed by `flash_range` of the internal flash.
    /// The crate will not read, write or erase the internal flash outside of that range.
    pub fn new(eeprom: E, flash: F, flash_range: Range<u32>) -> Self {
        assert!(
            flash_range.start % F::ERASE_SIZE as u32 == 0,
            "Flash range start must be aligned to a page"
        );
        assert!(
            flash_range.end % F::ERASE_SIZE as u32 == 0,
            "Flash range end must be aligned to a page"
        );
        assert!(
            flash_range.start <= flash_range.end && flash_range.end as usize <= flash.capacity(),
            "Flash range must lie within the flash"
        );
        assert!(
            PAGE_SIZE >= F::ERASE_SIZE,
            "The page buffer must be able to hold a full flash page"
        );
        assert!(
            F::WORD_SIZE <= MAX_WORD_SIZE,
            "Word size must be smaller (or equal) to the max supported word size"
        );
        assert!(
            eeprom.capacity() as u64 + (flash_range.end - flash_range.start) as u64
                <= u32::MAX as u64,
            "The address space must be addressable with 32 bits"
        );

        Self {
            eeprom,
            flash,
            flash_range,
            page_buffer: AlignedBuf([0; PAGE_SIZE]),
        }
    }

    /// The first logical address that is backed by the internal flash
    pub fn boundary(&self) -> u32 {
        self.eeprom.capacity() as u32
    }

    /// The physical internal flash range that is mapped after the boundary
    pub const fn flash_range(&self) -> &Range<u32> {
        &self.flash_range
    }

    /// The external memory driver
    pub fn eeprom(&self) -> &E {
        &self.eeprom
    }

    /// The internal flash driver
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Get a mutable reference to the external memory driver. Mutating the memory is at your own risk.
    pub fn eeprom_mut(&mut self) -> &mut E {
        &mut self.eeprom
    }

    /// Get a mutable reference to the internal flash driver. Mutating the memory is at your own risk.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Give back both media drivers
    pub fn free(self) -> (E, F) {
        (self.eeprom, self.flash)
    }

    fn write_external(&mut self, address: u32, bytes: &[u8]) -> Result<(), Error> {
        self.eeprom
            .write(address, bytes)
            .map_err(|e| Error::storage(Medium::External, e))?;

        self.wait_until_idle()?;

        let mut buffer = [0; CHUNK_SIZE];
        for (index, chunk) in bytes.chunks(CHUNK_SIZE).enumerate() {
            let chunk_address = address + (index * CHUNK_SIZE) as u32;
            let read_back = &mut buffer[..chunk.len()];
            self.eeprom
                .read(chunk_address, read_back)
                .map_err(|e| Error::storage(Medium::External, e))?;

            if &read_back[..] != chunk {
                return Err(verification_failed(Medium::External, chunk_address));
            }
        }

        Ok(())
    }

    fn wait_until_idle(&mut self) -> Result<(), Error> {
        for _ in 0..BUSY_POLL_LIMIT {
            let busy = self
                .eeprom
                .is_busy()
                .map_err(|e| Error::storage(Medium::External, e))?;
            if !busy {
                return Ok(());
            }
        }

        Err(Error::Busy)
    }

    fn read_internal(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
        let mut address = self.flash_range.start + offset;
        let mut bytes = bytes;

        while !bytes.is_empty() {
            let len = page_chunk_len::<F>(address, bytes.len());
            let (chunk, rest) = core::mem::take(&mut bytes).split_at_mut(len);

            let span_start = round_down_to_alignment::<F>(address);
            let span_end = round_up_to_alignment::<F>(address + len as u32);
            let head = (address - span_start) as usize;

            let span = &mut self.page_buffer[..(span_end - span_start) as usize];
            flash_read(&mut self.flash, span_start, span)?;
            chunk.copy_from_slice(&span[head..head + len]);

            address += len as u32;
            bytes = rest;
        }

        Ok(())
    }

    fn write_internal(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        let mut address = self.flash_range.start + offset;
        let mut bytes = bytes;

        while !bytes.is_empty() {
            let len = page_chunk_len::<F>(address, bytes.len());
            let (chunk, rest) = bytes.split_at(len);

            self.write_page_span(address, chunk)?;

            address += len as u32;
            bytes = rest;
        }

        Ok(())
    }

    /// Write bytes that all lie within a single flash page
    fn write_page_span(&mut self, address: u32, chunk: &[u8]) -> Result<(), Error> {
        let span_start = round_down_to_alignment::<F>(address);
        let span_end = round_up_to_alignment::<F>(address + chunk.len() as u32);
        let head = (address - span_start) as usize;

        let span = &mut self.page_buffer[..(span_end - span_start) as usize];
        flash_read(&mut self.flash, span_start, span)?;

        let current = &span[head..head + chunk.len()];
        if current == chunk {
            return Ok(());
        }

        if current
            .iter()
            .zip(chunk)
            .all(|(old, new)| old & new == *new)
        {
            // Only clearing bits, so the words can be programmed in place
            span[head..head + chunk.len()].copy_from_slice(chunk);
            flash_program(&mut self.flash, span_start, span)?;
            return verify_internal(&mut self.flash, span_start, span);
        }

        let page_size = F::ERASE_SIZE as u32;
        let page_start = (address / page_size) * page_size;
        let head = (address - page_start) as usize;

        let page = &mut self.page_buffer[..F::ERASE_SIZE];
        flash_read(&mut self.flash, page_start, page)?;
        page[head..head + chunk.len()].copy_from_slice(chunk);

        // The rest of the page only lives in the page buffer until it is programmed again
        flash_erase(&mut self.flash, page_start, page_start + page_size)?;
        flash_program(&mut self.flash, page_start, page)?;
        verify_internal(&mut self.flash, page_start, page)
    }
}

impl<E: Eeprom, F: NorFlash, const PAGE_SIZE: usize> AddressSpace
    for FlashAddressSpace<E, F, PAGE_SIZE>
{
    fn total_size(&self) -> u32 {
        self.boundary() + (self.flash_range.end - self.flash_range.start)
    }

    fn medium_of(&self, address: u32) -> Medium {
        if address < self.boundary() {
            Medium::External
        } else {
            Medium::Internal
        }
    }

    fn read(&mut self, address: u32, bytes: &mut [u8]) -> Result<(), Error> {
        if bytes.is_empty() {
            return Ok(());
        }
        check_range(self.total_size(), address, bytes.len())?;

        let boundary = self.boundary();
        let external_len = (boundary.saturating_sub(address) as usize).min(bytes.len());
        let (external, internal) = bytes.split_at_mut(external_len);

        if !external.is_empty() {
            self.eeprom
                .read(address, external)
                .map_err(|e| Error::storage(Medium::External, e))?;
        }
        if !internal.is_empty() {
            self.read_internal(address + external_len as u32 - boundary, internal)?;
        }

        Ok(())
    }

    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), Error> {
        if bytes.is_empty() {
            return Ok(());
        }
        check_range(self.total_size(), address, bytes.len())?;

        let boundary = self.boundary();
        let external_len = (boundary.saturating_sub(address) as usize).min(bytes.len());
        let (external, internal) = bytes.split_at(external_len);

        if !external.is_empty() {
            self.write_external(address, external)?;
        }
        if !internal.is_empty() {
            self.write_internal(address + external_len as u32 - boundary, internal)?;
        }

        Ok(())
    }
}

/// The length of the part of a request at `address` that fits in the page of `address`
fn page_chunk_len<F: NorFlash>(address: u32, remaining: usize) -> usize {
    let page_size = F::ERASE_SIZE as u32;
    let page_end = (address / page_size + 1) * page_size;
    remaining.min((page_end - address) as usize)
}

fn flash_read<F: NorFlash>(flash: &mut F, address: u32, bytes: &mut [u8]) -> Result<(), Error> {
    block_on(flash.read(address, bytes)).map_err(|e| Error::storage(Medium::Internal, e))
}

fn flash_program<F: NorFlash>(flash: &mut F, address: u32, bytes: &[u8]) -> Result<(), Error> {
    resubmit_on_timeout(address, || block_on(flash.write(address, bytes)))
}

fn flash_erase<F: NorFlash>(flash: &mut F, from: u32, to: u32) -> Result<(), Error> {
    resubmit_on_timeout(from, || block_on(flash.erase(from, to)))
}

/// Drivers report an operation that did not complete in time as [`NorFlashErrorKind::Other`].
/// That operation is submitted exactly once more and a second failure is final.
#[cfg_attr(not(feature = "defmt-03"), allow(unused_variables))]
fn resubmit_on_timeout<E: NorFlashError>(
    address: u32,
    mut submit: impl FnMut() -> Result<(), E>,
) -> Result<(), Error> {
    match submit() {
        Err(error) if matches!(error.kind(), NorFlashErrorKind::Other) => {
            #[cfg(feature = "defmt-03")]
            defmt::warn!(
                "Internal flash operation at {=u32:#x} timed out, resubmitting",
                address
            );
            submit().map_err(|e| Error::storage(Medium::Internal, e))
        }
        result => result.map_err(|e| Error::storage(Medium::Internal, e)),
    }
}

fn verify_internal<F: NorFlash>(flash: &mut F, address: u32, expected: &[u8]) -> Result<(), Error> {
    let mut buffer = AlignedBuf([0; CHUNK_SIZE]);
    let chunk_size = round_down_to_alignment::<F>(CHUNK_SIZE as u32) as usize;

    for (index, chunk) in expected.chunks(chunk_size).enumerate() {
        let chunk_address = address + (index * chunk_size) as u32;
        let read_back = &mut buffer[..chunk.len()];
        flash_read(flash, chunk_address, read_back)?;

        if &read_back[..] != chunk {
            return Err(verification_failed(Medium::Internal, chunk_address));
        }
    }

    Ok(())
}

#[cfg_attr(not(feature = "defmt-03"), allow(unused_variables))]
fn verification_failed(medium: Medium, address: u32) -> Error {
    #[cfg(feature = "defmt-03")]
    defmt::error!(
        "{} write at {=u32:#x} did not read back as written",
        medium,
        address
    );

    Error::Internal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageErrorKind;
    use crate::mock_flash::{MockEeprom, MockFlashBase};

    type MockFlash = MockFlashBase<4, 4, 64>;
    type MockSpace = FlashAddressSpace<MockEeprom<256>, MockFlash, 256>;

    const BOUNDARY: u32 = 256;

    fn new_space() -> MockSpace {
        FlashAddressSpace::new(MockEeprom::new(), MockFlash::new(), 0x000..0x400)
    }

    #[test]
    fn layout() {
        let space = new_space();

        assert_eq!(space.boundary(), BOUNDARY);
        assert_eq!(space.total_size(), BOUNDARY + 0x400);
        assert_eq!(space.medium_of(0), Medium::External);
        assert_eq!(space.medium_of(BOUNDARY - 1), Medium::External);
        assert_eq!(space.medium_of(BOUNDARY), Medium::Internal);
    }

    #[test]
    fn out_of_range() {
        let mut space = new_space();
        let total_size = space.total_size();
        let mut buffer = [0; 4];

        assert_eq!(
            space.read(total_size, &mut buffer[..1]),
            Err(Error::InvalidRange)
        );
        assert_eq!(
            space.write(total_size - 1, &buffer[..2]),
            Err(Error::InvalidRange)
        );
        assert_eq!(space.read(u32::MAX - 1, &mut buffer), Err(Error::InvalidRange));

        // Zero length is always fine
        assert_eq!(space.read(total_size + 100, &mut buffer[..0]), Ok(()));
        assert_eq!(space.write(total_size + 100, &buffer[..0]), Ok(()));

        // Nothing was touched
        assert_eq!(space.eeprom().writes, 0);
        assert_eq!(space.flash().writes, 0);
    }

    #[test]
    fn straddle_boundary() {
        let mut space = new_space();
        let data = [1, 2, 3, 4, 5, 6, 7, 8];

        space.write(BOUNDARY - 4, &data).unwrap();

        assert_eq!(&space.eeprom().as_bytes()[252..256], &[1, 2, 3, 4]);
        assert_eq!(&space.flash().as_bytes()[0..4], &[5, 6, 7, 8]);

        let mut read_back = [0; 8];
        space.read(BOUNDARY - 4, &mut read_back).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn unaligned_write_keeps_neighbours() {
        let mut space = new_space();

        space.write(BOUNDARY + 100, &[0x55; 8]).unwrap();
        space.write(BOUNDARY + 5, &[1, 2, 3]).unwrap();

        assert_eq!(space.flash().erases, 0);
        assert_eq!(&space.flash().as_bytes()[4..9], &[0xFF, 1, 2, 3, 0xFF]);

        // 0x02 -> 0xAA needs bits to be set, so the page has to be erased
        space.write(BOUNDARY + 6, &[0xAA]).unwrap();

        assert_eq!(space.flash().erases, 1);
        assert_eq!(&space.flash().as_bytes()[4..9], &[0xFF, 1, 0xAA, 3, 0xFF]);
        assert_eq!(&space.flash().as_bytes()[100..108], &[0x55; 8]);

        let mut read_back = [0; 3];
        space.read(BOUNDARY + 5, &mut read_back).unwrap();
        assert_eq!(read_back, [1, 0xAA, 3]);
    }

    #[test]
    fn write_across_pages() {
        let mut space = new_space();
        let data: Vec<u8> = (0..300).map(|i| i as u8).collect();

        space.write(BOUNDARY + 201, &data).unwrap();
        let mut read_back = vec![0; 300];
        space.read(BOUNDARY + 201, &mut read_back).unwrap();
        assert_eq!(read_back, data);

        // Overwrite the same span with other data to go through the erase path on both pages
        let data: Vec<u8> = (0..300).map(|i| !(i as u8)).collect();
        space.write(BOUNDARY + 201, &data).unwrap();
        space.read(BOUNDARY + 201, &mut read_back).unwrap();
        assert_eq!(read_back, data);
        assert_eq!(space.flash().erases, 2);
    }

    #[test]
    fn identical_write_is_skipped() {
        let mut space = new_space();

        space.write(BOUNDARY + 10, &[9, 8, 7]).unwrap();
        let writes = space.flash().writes;

        space.write(BOUNDARY + 10, &[9, 8, 7]).unwrap();
        assert_eq!(space.flash().writes, writes);
    }

    #[test]
    fn single_timeout_is_resubmitted() {
        let mut space = new_space();
        space.flash.pending_timeouts = 1;

        space.write(BOUNDARY + 12, &[1, 2, 3, 4]).unwrap();

        assert_eq!(space.flash().pending_timeouts, 0);
        assert_eq!(space.flash().writes, 2);
        assert_eq!(&space.flash().as_bytes()[12..16], &[1, 2, 3, 4]);
    }

    #[test]
    fn second_timeout_is_fatal() {
        let mut space = new_space();
        space.flash.pending_timeouts = 2;

        assert_eq!(
            space.write(BOUNDARY + 12, &[1, 2, 3, 4]),
            Err(Error::Storage {
                medium: Medium::Internal,
                kind: StorageErrorKind::Other
            })
        );
        assert_eq!(space.flash().writes, 2);
    }

    #[test]
    fn eeprom_waits_for_busy_flag() {
        let mut space = new_space();
        space.eeprom.busy_polls_per_write = 5;

        space.write(10, &[1, 2]).unwrap();
        assert!(!space.eeprom.is_busy().unwrap());

        space.eeprom.busy_polls_per_write = u32::MAX;
        assert_eq!(space.write(10, &[3, 4]), Err(Error::Busy));
    }

    #[test]
    fn verification_mismatch_is_internal() {
        let mut space = new_space();
        space.eeprom.stuck_address = Some(10);

        assert_eq!(space.write(8, &[1, 2, 3, 4]), Err(Error::Internal));
    }

    #[test]
    fn fill() {
        let mut space = new_space();

        space.fill(BOUNDARY - 100, 200, 0x00).unwrap();
        assert!(space.eeprom().as_bytes()[156..256].iter().all(|b| *b == 0));
        assert!(space.flash().as_bytes()[..100].iter().all(|b| *b == 0));
        assert_eq!(space.flash().as_bytes()[100], 0xFF);

        space.fill(BOUNDARY - 100, 200, 0xFF).unwrap();
        assert!(space.eeprom().as_bytes().iter().all(|b| *b == 0xFF));
        assert!(space.flash().as_bytes().iter().all(|b| *b == 0xFF));

        assert_eq!(
            space.fill(space.total_size() - 10, 11, 0),
            Err(Error::InvalidRange)
        );
    }
}
