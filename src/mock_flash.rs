#![allow(missing_docs)]
use core::ops::Range;
use embedded_storage_async::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

use crate::medium::Eeprom;

/// Paged internal flash.
///
/// Programming can only clear bits, like real NOR flash. Every operation completes one poll
/// after it was started to mimic the completion event of a flash controller.
#[derive(Debug, Clone)]
pub struct MockFlashBase<const PAGES: usize, const BYTES_PER_WORD: usize, const PAGE_WORDS: usize> {
    data: Vec<u8>,
    pub erases: u32,
    pub reads: u32,
    pub writes: u32,
    /// The next this many writes or erases report a timeout without touching the data
    pub pending_timeouts: u32,
}

impl<const PAGES: usize, const BYTES_PER_WORD: usize, const PAGE_WORDS: usize> Default
    for MockFlashBase<PAGES, BYTES_PER_WORD, PAGE_WORDS>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const PAGES: usize, const BYTES_PER_WORD: usize, const PAGE_WORDS: usize>
    MockFlashBase<PAGES, BYTES_PER_WORD, PAGE_WORDS>
{
    const CAPACITY_WORDS: usize = PAGES * PAGE_WORDS;
    const CAPACITY_BYTES: usize = Self::CAPACITY_WORDS * BYTES_PER_WORD;

    const PAGE_BYTES: usize = PAGE_WORDS * BYTES_PER_WORD;

    pub fn new() -> Self {
        Self {
            data: vec![u8::MAX; Self::CAPACITY_BYTES],
            erases: 0,
            reads: 0,
            writes: 0,
            pending_timeouts: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn validate_operation(offset: u32, length: usize) -> Result<Range<usize>, MockFlashError> {
        let offset = offset as usize;
        if (offset % BYTES_PER_WORD) != 0 {
            Err(MockFlashError::NotAligned)
        } else if offset > Self::CAPACITY_BYTES || offset + length > Self::CAPACITY_BYTES {
            Err(MockFlashError::OutOfBounds)
        } else {
            Ok(offset..(offset + length))
        }
    }

    fn take_timeout(&mut self) -> Result<(), MockFlashError> {
        if self.pending_timeouts > 0 {
            self.pending_timeouts -= 1;
            Err(MockFlashError::Timeout)
        } else {
            Ok(())
        }
    }
}

impl<const PAGES: usize, const BYTES_PER_WORD: usize, const PAGE_WORDS: usize> ErrorType
    for MockFlashBase<PAGES, BYTES_PER_WORD, PAGE_WORDS>
{
    type Error = MockFlashError;
}

impl<const PAGES: usize, const BYTES_PER_WORD: usize, const PAGE_WORDS: usize> ReadNorFlash
    for MockFlashBase<PAGES, BYTES_PER_WORD, PAGE_WORDS>
{
    const READ_SIZE: usize = BYTES_PER_WORD;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        embassy_futures::yield_now().await;
        self.reads += 1;

        if bytes.len() % Self::READ_SIZE != 0 {
            panic!("any read must be a multiple of Self::READ_SIZE bytes");
        }

        let range = Self::validate_operation(offset, bytes.len())?;

        bytes.copy_from_slice(&self.as_bytes()[range]);

        Ok(())
    }

    fn capacity(&self) -> usize {
        Self::CAPACITY_BYTES
    }
}

impl<const PAGES: usize, const BYTES_PER_WORD: usize, const PAGE_WORDS: usize> NorFlash
    for MockFlashBase<PAGES, BYTES_PER_WORD, PAGE_WORDS>
{
    const WRITE_SIZE: usize = BYTES_PER_WORD;

    const ERASE_SIZE: usize = Self::PAGE_BYTES;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        embassy_futures::yield_now().await;
        self.erases += 1;
        self.take_timeout()?;

        let from = from as usize;
        let to = to as usize;

        assert!(from <= to);

        if to > Self::CAPACITY_BYTES {
            return Err(MockFlashError::OutOfBounds);
        }

        if from % Self::PAGE_BYTES != 0 || to % Self::PAGE_BYTES != 0 {
            return Err(MockFlashError::NotAligned);
        }

        for byte in self.as_bytes_mut()[from..to].iter_mut() {
            *byte = u8::MAX;
        }

        Ok(())
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        embassy_futures::yield_now().await;
        self.writes += 1;
        self.take_timeout()?;

        let range = Self::validate_operation(offset, bytes.len())?;

        if bytes.len() % Self::WRITE_SIZE != 0 {
            panic!("any write must be a multiple of Self::WRITE_SIZE bytes");
        }

        for (target, source) in self.as_bytes_mut()[range].iter_mut().zip(bytes.iter()) {
            *target &= *source;
        }

        Ok(())
    }
}

/// Byte addressable external memory.
///
/// Each write keeps the device busy for `busy_polls_per_write` calls of [`Eeprom::is_busy`].
#[derive(Debug, Clone)]
pub struct MockEeprom<const CAPACITY: usize> {
    data: Vec<u8>,
    pub reads: u32,
    pub writes: u32,
    pub busy_polls_per_write: u32,
    busy_polls_left: u32,
    /// Writes to this address are dropped, like a worn out cell
    pub stuck_address: Option<u32>,
}

impl<const CAPACITY: usize> Default for MockEeprom<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAPACITY: usize> MockEeprom<CAPACITY> {
    pub fn new() -> Self {
        Self {
            data: vec![u8::MAX; CAPACITY],
            reads: 0,
            writes: 0,
            busy_polls_per_write: 2,
            busy_polls_left: 0,
            stuck_address: None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn validate_operation(address: u32, length: usize) -> Result<Range<usize>, MockFlashError> {
        let address = address as usize;
        if address > CAPACITY || address + length > CAPACITY {
            Err(MockFlashError::OutOfBounds)
        } else {
            Ok(address..(address + length))
        }
    }
}

impl<const CAPACITY: usize> ErrorType for MockEeprom<CAPACITY> {
    type Error = MockFlashError;
}

impl<const CAPACITY: usize> Eeprom for MockEeprom<CAPACITY> {
    fn read(&mut self, address: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.reads += 1;

        let range = Self::validate_operation(address, bytes.len())?;
        bytes.copy_from_slice(&self.data[range]);

        Ok(())
    }

    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.writes += 1;

        let range = Self::validate_operation(address, bytes.len())?;
        for (target_address, source) in range.zip(bytes.iter()) {
            if self.stuck_address == Some(target_address as u32) {
                continue;
            }
            self.data[target_address] = *source;
        }

        self.busy_polls_left = self.busy_polls_per_write;
        Ok(())
    }

    fn is_busy(&mut self) -> Result<bool, Self::Error> {
        if self.busy_polls_left == u32::MAX {
            return Ok(true);
        }

        match self.busy_polls_left.checked_sub(1) {
            Some(left) => {
                self.busy_polls_left = left;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn capacity(&self) -> usize {
        CAPACITY
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFlashError {
    OutOfBounds,
    NotAligned,
    /// The operation did not complete in time
    Timeout,
}

impl NorFlashError for MockFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            MockFlashError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            MockFlashError::NotAligned => NorFlashErrorKind::NotAligned,
            MockFlashError::Timeout => NorFlashErrorKind::Other,
        }
    }
}
