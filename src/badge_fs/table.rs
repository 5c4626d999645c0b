//! Lookup table rows.
//!
//! Memory layout of a row (little endian):
//! ```text
//! ┌──────┬──────┬──────┬──────┬──────┬──────┬──────┬──────┬──────┬──────┬──────┬──────┐
//! │      :      :      :      │      :      :      :      │      :      │      :      │
//! │          Item id          │        Start index        │   Length    │   Marker    │
//! │      :      :      :      │      :      :      :      │      :      │      :      │
//! └──────┴──────┴──────┴──────┴──────┴──────┴──────┴──────┴──────┴──────┴──────┴──────┘
//! 0      1      2      3      4      5      6      7      8      9      10     11     12
//! ```
//!
//! A row is only present when its marker is [MARKER_WRITTEN].
//! Unwritten flash reads as all ones, so an erased row is a row that was never written.

use crate::Error;

pub(crate) const ROW_SIZE: usize = 12;

/// The value every byte of an erased row holds
pub(crate) const ERASED_BYTE: u8 = 0xFF;

const MARKER_WRITTEN: u16 = 0x0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LookupTableRow {
    pub item_id: u32,
    /// Offset of the first payload byte in the write area
    pub item_start_index: u32,
    pub item_len: u16,
}

impl LookupTableRow {
    pub const ERASED: [u8; ROW_SIZE] = [ERASED_BYTE; ROW_SIZE];

    pub fn encode(&self) -> [u8; ROW_SIZE] {
        let mut buffer = [0; ROW_SIZE];
        buffer[0..4].copy_from_slice(&self.item_id.to_le_bytes());
        buffer[4..8].copy_from_slice(&self.item_start_index.to_le_bytes());
        buffer[8..10].copy_from_slice(&self.item_len.to_le_bytes());
        buffer[10..12].copy_from_slice(&MARKER_WRITTEN.to_le_bytes());
        buffer
    }

    /// Decode a row. Returns `None` if the row is erased (or was never completely written).
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        debug_assert_eq!(bytes.len(), ROW_SIZE);

        if u16::from_le_bytes([bytes[10], bytes[11]]) != MARKER_WRITTEN {
            return None;
        }

        Some(Self {
            item_id: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            item_start_index: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            item_len: u16::from_le_bytes([bytes[8], bytes[9]]),
        })
    }

    /// Make sure the row describes bytes that lie in a write area of the given length
    pub fn check(&self, write_area_len: u32) -> Result<(), Error> {
        if self.item_start_index >= write_area_len || self.item_len as u32 > write_area_len {
            #[cfg(feature = "defmt-03")]
            defmt::error!(
                "Row of item {=u32} points outside of the write area",
                self.item_id
            );
            return Err(Error::Internal);
        }

        Ok(())
    }

    /// The offset right after the last payload byte, wrapped around the write area
    pub fn end_index(&self, write_area_len: u32) -> u32 {
        ((self.item_start_index as u64 + self.item_len as u64) % write_area_len as u64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erased_and_torn_rows() {
        assert_eq!(LookupTableRow::decode(&LookupTableRow::ERASED), None);

        let row = LookupTableRow {
            item_id: 7,
            item_start_index: 60,
            item_len: 20,
        };
        let mut bytes = row.encode();
        assert_eq!(LookupTableRow::decode(&bytes), Some(row));

        // Marker only half written
        bytes[11] = 0xFF;
        assert_eq!(LookupTableRow::decode(&bytes), None);
    }

    #[test]
    fn bounds() {
        let row = LookupTableRow {
            item_id: 0,
            item_start_index: 60,
            item_len: 20,
        };

        assert_eq!(row.check(64), Ok(()));
        assert_eq!(row.check(60), Err(Error::Internal));
        assert_eq!(row.check(19), Err(Error::Internal));
        assert_eq!(row.end_index(64), 16);
        assert_eq!(row.end_index(80), 0);
    }
}
