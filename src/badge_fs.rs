//! BadgeFS: a partitioned, circular log of variable length items.
//!
//! Every partition is laid out as
//! ```text
//! ┌─────────┬──────────────────────────────────┬───────────────────────────────────┐
//! │  magic  │  lookup table (max_items rows)   │    write area (circular bytes)    │
//! └─────────┴──────────────────────────────────┴───────────────────────────────────┘
//! ```
//!
//! New items are appended right after the newest item, both in the table and in the write area.
//! When the write area or the table is full, the oldest items are evicted to make room.
//! There is no explicit delete and no defragmentation.
//!
//! Items are addressed with a [Key]. A key remembers the table row and the id of the item
//! that was in that row when the key was made. As soon as a newer item took that row,
//! the key is stale and lookups report [Error::NotFound].
//!
//! ```rust,ignore
//! let mut fs = BadgeFs::<_, 2>::init(address_space, &LAYOUTS, 0)?;
//!
//! fs.store_item(SCANS, &scan)?;
//!
//! let mut key = fs.find_key(SCANS, &mut buffer, |item| timestamp_of(item) >= since)?;
//! loop {
//!     let len = fs.get_item(&key, &mut buffer)?;
//!     send(&buffer[..len as usize]);
//!     match fs.increment_key(&mut key) {
//!         Err(Error::NotFound) => break,
//!         result => result?,
//!     }
//! }
//! ```

mod table;

use heapless::Vec;

use crate::{
    Error,
    address_space::AddressSpace,
    badge_fs::table::{ERASED_BYTE, LookupTableRow, ROW_SIZE},
};

/// Identifies a partition
pub type PartitionId = u8;

/// Marks a partition whose table has been initialized
const FORMAT_MAGIC: u32 = 0xBADF_5001;
const HEADER_LEN: u32 = 4;

/// Rows read at once while scanning a table at boot
const SCAN_BATCH_ROWS: usize = 16;

/// The requested capacity of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct PartitionLayout {
    /// The id the partition is addressed with
    pub partition_id: PartitionId,
    /// Total size of the partition, header and table included
    pub size_bytes: u32,
    /// The maximum amount of items the partition holds
    pub max_items: u16,
}

impl PartitionLayout {
    /// Create a new layout
    pub const fn new(partition_id: PartitionId, size_bytes: u32, max_items: u16) -> Self {
        Self {
            partition_id,
            size_bytes,
            max_items,
        }
    }

    /// The size a partition must have to hold `max_items` rows and a write area of
    /// `write_area_len` bytes
    pub const fn size_for(max_items: u16, write_area_len: u32) -> u32 {
        HEADER_LEN + max_items as u32 * ROW_SIZE as u32 + write_area_len
    }
}

/// Where a partition lives in the address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct PartitionMapping {
    /// First address of the partition
    pub base_addr: u32,
    /// Address of the format marker
    pub header_addr: u32,
    /// Address of the first table row
    pub table_addr: u32,
    /// Length of the table in bytes
    pub table_len: u32,
    /// First address of the write area
    pub write_area_addr: u32,
    /// Length of the write area in bytes
    pub write_area_len: u32,
}

impl PartitionMapping {
    fn new(layout: &PartitionLayout, base_addr: u32) -> Result<Self, Error> {
        if layout.max_items == 0 {
            return Err(Error::InvalidRange);
        }

        let table_len = layout.max_items as u32 * ROW_SIZE as u32;
        let write_area_len = layout
            .size_bytes
            .checked_sub(HEADER_LEN + table_len)
            .filter(|len| *len > 0)
            .ok_or(Error::InvalidRange)?;

        Ok(Self {
            base_addr,
            header_addr: base_addr,
            table_addr: base_addr + HEADER_LEN,
            table_len,
            write_area_addr: base_addr + HEADER_LEN + table_len,
            write_area_len,
        })
    }

    fn row_addr(&self, row_index: u16) -> u32 {
        self.table_addr + row_index as u32 * ROW_SIZE as u32
    }
}

/// The fill state of a partition. Rebuilt from the table at every boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct PartitionStatus {
    /// The table row holding the oldest item
    pub oldest_row_index: u16,
    /// The amount of items in the partition
    pub num_stored_items: u16,
    /// The amount of write area bytes taken by those items
    pub filled_len: u32,
}

/// A handle to an item.
///
/// Keys are plain values. Dropping one is all it takes to release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Key {
    partition_id: PartitionId,
    table_row: u16,
    item_id: u32,
}

impl Key {
    /// The partition of the item
    pub const fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// The table row the item was stored in
    pub const fn table_row(&self) -> u16 {
        self.table_row
    }

    /// The id the item had when the key was made
    pub const fn item_id(&self) -> u32 {
        self.item_id
    }
}

#[derive(Debug)]
struct Partition {
    id: PartitionId,
    max_items: u16,
    mapping: PartitionMapping,
    status: PartitionStatus,
}

impl Partition {
    fn next_row(&self, row_index: u16) -> u16 {
        ((row_index as u32 + 1) % self.max_items as u32) as u16
    }

    fn newest_row(&self) -> u16 {
        ((self.status.oldest_row_index as u32 + self.status.num_stored_items as u32 - 1)
            % self.max_items as u32) as u16
    }
}

/// The log store. Holds the mapping and status of up to `PARTITIONS` partitions.
///
/// Once an operation has reported [Error::Internal] the store considers the flash
/// inconsistent and refuses every following operation with the same error.
pub struct BadgeFs<S, const PARTITIONS: usize> {
    storage: S,
    partitions: Vec<Partition, PARTITIONS>,
    faulted: bool,
}

impl<S: AddressSpace, const PARTITIONS: usize> BadgeFs<S, PARTITIONS> {
    /// Map the partitions one after the other starting at `base_addr`, format the ones that
    /// have never been used and rebuild the status of all of them from their tables.
    ///
    /// The write area of a partition must lie entirely on one medium.
    pub fn init(storage: S, layouts: &[PartitionLayout], base_addr: u32) -> Result<Self, Error> {
        let mut fs = Self {
            storage,
            partitions: Vec::new(),
            faulted: false,
        };

        let mut address = base_addr;
        for layout in layouts {
            if fs.partitions.iter().any(|p| p.id == layout.partition_id) {
                return Err(Error::InvalidRange);
            }

            let end = address
                .checked_add(layout.size_bytes)
                .filter(|end| *end <= fs.storage.total_size())
                .ok_or(Error::NoMem)?;
            let mapping = PartitionMapping::new(layout, address)?;

            let write_area_end = mapping.write_area_addr + mapping.write_area_len - 1;
            if fs.storage.medium_of(mapping.write_area_addr) != fs.storage.medium_of(write_area_end)
            {
                return Err(Error::InvalidRange);
            }

            fs.partitions
                .push(Partition {
                    id: layout.partition_id,
                    max_items: layout.max_items,
                    mapping,
                    status: PartitionStatus::default(),
                })
                .map_err(|_| Error::NoMem)?;

            address = end;
        }

        for index in 0..fs.partitions.len() {
            fs.format_if_needed(index)?;
            fs.scan_table(index)?;
        }

        Ok(fs)
    }

    /// Store a new item in the partition, evicting the oldest items as needed.
    ///
    /// Fails with [Error::NoMem] if the item is bigger than the write area of the partition.
    ///
    /// When a driver error or [Error::Busy] interrupts the store, the item is not stored but
    /// some of the oldest items may have been evicted already. The status is rebuilt from the
    /// table before the error is returned.
    pub fn store_item(&mut self, partition_id: PartitionId, data: &[u8]) -> Result<Key, Error> {
        self.guard(|fs| {
            let index = fs.partition_index(partition_id)?;

            let result = fs.store_item_inner(index, data);
            if let Err(Error::Busy | Error::Storage { .. }) = result {
                fs.scan_table(index).map_err(|_| Error::Internal)?;
            }
            result
        })
    }

    /// Get a key to the oldest item in the partition
    pub fn get_first_key(&mut self, partition_id: PartitionId) -> Result<Key, Error> {
        self.guard(|fs| {
            let index = fs.partition_index(partition_id)?;
            fs.first_key(index)
        })
    }

    /// Advance the key to the next newer item.
    ///
    /// Returns [Error::NotFound] when the key points at the newest item. A stale key is moved
    /// to the oldest item of the partition instead, so iteration can go on after an eviction.
    pub fn increment_key(&mut self, key: &mut Key) -> Result<(), Error> {
        self.guard(|fs| fs.increment_key_inner(key))
    }

    /// Find the oldest item for which the predicate returns true.
    ///
    /// Every item is loaded into `buffer` to be tested, so it must be able to hold the
    /// biggest item of the partition.
    pub fn find_key(
        &mut self,
        partition_id: PartitionId,
        buffer: &mut [u8],
        predicate: impl FnMut(&[u8]) -> bool,
    ) -> Result<Key, Error> {
        self.guard(|fs| fs.find_key_inner(partition_id, buffer, predicate))
    }

    /// Get the length of the item
    pub fn get_item_size(&mut self, key: &Key) -> Result<u16, Error> {
        self.guard(|fs| fs.current_row(key).map(|(_, row)| row.item_len))
    }

    /// Copy the item into the buffer and return its length
    pub fn get_item(&mut self, key: &Key, buffer: &mut [u8]) -> Result<u16, Error> {
        self.guard(|fs| fs.get_item_inner(key, buffer))
    }

    /// The current status of the partition
    pub fn status(&self, partition_id: PartitionId) -> Result<PartitionStatus, Error> {
        let index = self.partition_index(partition_id)?;
        Ok(self.partitions[index].status)
    }

    /// Where the partition lives in the address space
    pub fn mapping(&self, partition_id: PartitionId) -> Result<PartitionMapping, Error> {
        let index = self.partition_index(partition_id)?;
        Ok(self.partitions[index].mapping)
    }

    /// Returns true once an inconsistency has been found
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// The underlying address space
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Get a mutable reference to the address space. Mutating the memory is at your own risk.
    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    #[cfg(any(test, feature = "std"))]
    /// Print the lookup table of the partition to the returned string
    ///
    /// This is meant as a debugging utility. The string format is not stable.
    pub fn print_items(&mut self, partition_id: PartitionId) -> Result<std::string::String, Error> {
        use std::fmt::Write;

        let index = self.partition_index(partition_id)?;
        let partition = &self.partitions[index];
        let (mapping, status, max_items) = (partition.mapping, partition.status, partition.max_items);

        let mut output = std::string::String::new();
        let _ = writeln!(
            output,
            "Partition {partition_id} at {:#x}: {status:?}",
            mapping.base_addr
        );

        let mut bytes = [0; ROW_SIZE];
        for row_index in 0..max_items {
            self.storage.read(mapping.row_addr(row_index), &mut bytes)?;
            let _ = match LookupTableRow::decode(&bytes) {
                Some(row) => writeln!(
                    output,
                    "  {row_index:>5}: id {}, start {}, len {}",
                    row.item_id, row.item_start_index, row.item_len
                ),
                None => writeln!(output, "  {row_index:>5}: erased"),
            };
        }

        Ok(output)
    }

    /// Give back the address space
    pub fn free(self) -> S {
        self.storage
    }

    fn guard<R>(&mut self, op: impl FnOnce(&mut Self) -> Result<R, Error>) -> Result<R, Error> {
        if self.faulted {
            return Err(Error::Internal);
        }

        let result = op(self);
        if let Err(Error::Internal) = result {
            #[cfg(feature = "defmt-03")]
            defmt::error!("Storage is inconsistent, refusing any further operation");
            self.faulted = true;
        }
        result
    }

    fn partition_index(&self, partition_id: PartitionId) -> Result<usize, Error> {
        self.partitions
            .iter()
            .position(|p| p.id == partition_id)
            .ok_or(Error::InvalidRange)
    }

    fn format_if_needed(&mut self, index: usize) -> Result<(), Error> {
        let mapping = self.partitions[index].mapping;

        let mut magic = [0; HEADER_LEN as usize];
        self.storage.read(mapping.header_addr, &mut magic)?;
        if u32::from_le_bytes(magic) == FORMAT_MAGIC {
            return Ok(());
        }

        #[cfg(feature = "defmt-03")]
        defmt::info!("Formatting partition {=u8}", self.partitions[index].id);

        self.storage
            .fill(mapping.table_addr, mapping.table_len, ERASED_BYTE)?;
        self.storage
            .write(mapping.header_addr, &FORMAT_MAGIC.to_le_bytes())
    }

    /// Rebuild the status of the partition from its table.
    ///
    /// The oldest item is the one with the smallest id. The stored items are the chain of
    /// consecutive ids from there. Present rows outside of that chain are remains of a write
    /// that was cut off and get erased.
    fn scan_table(&mut self, index: usize) -> Result<(), Error> {
        let mapping = self.partitions[index].mapping;
        let max_items = self.partitions[index].max_items;

        let mut oldest: Option<(u16, u32)> = None;
        let mut present_rows = 0u16;

        let mut buffer = [0; ROW_SIZE * SCAN_BATCH_ROWS];
        let mut row_index = 0u16;
        while row_index < max_items {
            let rows = (max_items - row_index).min(SCAN_BATCH_ROWS as u16);
            let bytes = &mut buffer[..rows as usize * ROW_SIZE];
            self.storage.read(mapping.row_addr(row_index), bytes)?;

            for (offset, row_bytes) in bytes.chunks_exact(ROW_SIZE).enumerate() {
                let Some(row) = LookupTableRow::decode(row_bytes) else {
                    continue;
                };
                row.check(mapping.write_area_len)?;

                present_rows += 1;
                if oldest.is_none_or(|(_, id)| row.item_id < id) {
                    oldest = Some((row_index + offset as u16, row.item_id));
                }
            }

            row_index += rows;
        }

        let Some((oldest_row_index, oldest_id)) = oldest else {
            self.partitions[index].status = PartitionStatus::default();
            return Ok(());
        };

        self.partitions[index].status.oldest_row_index = oldest_row_index;

        let mut num_stored_items = 0u16;
        let mut filled_len = 0u32;
        let mut row_index = oldest_row_index;
        while num_stored_items < max_items {
            match self.read_row(index, row_index)? {
                Some(row) if row.item_id == oldest_id.wrapping_add(num_stored_items as u32) => {
                    num_stored_items += 1;
                    filled_len += row.item_len as u32;
                    row_index = self.partitions[index].next_row(row_index);
                }
                _ => break,
            }
        }

        if filled_len > mapping.write_area_len {
            #[cfg(feature = "defmt-03")]
            defmt::error!(
                "Items of partition {=u8} overlap in the write area",
                self.partitions[index].id
            );
            return Err(Error::Internal);
        }

        if num_stored_items < present_rows {
            // Everything after the newest item up to the oldest one should be erased
            for _ in num_stored_items..max_items {
                if self.read_row(index, row_index)?.is_some() {
                    #[cfg(feature = "defmt-03")]
                    defmt::warn!(
                        "Erasing orphaned row {=u16} of partition {=u8}",
                        row_index,
                        self.partitions[index].id
                    );
                    self.storage
                        .write(mapping.row_addr(row_index), &LookupTableRow::ERASED)?;
                }
                row_index = self.partitions[index].next_row(row_index);
            }
        }

        let status = &mut self.partitions[index].status;
        status.num_stored_items = num_stored_items;
        status.filled_len = filled_len;

        Ok(())
    }

    fn read_row(&mut self, index: usize, row_index: u16) -> Result<Option<LookupTableRow>, Error> {
        let mapping = self.partitions[index].mapping;

        let mut bytes = [0; ROW_SIZE];
        self.storage.read(mapping.row_addr(row_index), &mut bytes)?;

        match LookupTableRow::decode(&bytes) {
            Some(row) => {
                row.check(mapping.write_area_len)?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    /// Read a row that must be present according to the status
    fn read_stored_row(&mut self, index: usize, row_index: u16) -> Result<LookupTableRow, Error> {
        match self.read_row(index, row_index)? {
            Some(row) => Ok(row),
            None => {
                #[cfg(feature = "defmt-03")]
                defmt::error!(
                    "Row {=u16} of partition {=u8} is erased but should hold an item",
                    row_index,
                    self.partitions[index].id
                );
                Err(Error::Internal)
            }
        }
    }

    fn store_item_inner(&mut self, index: usize, data: &[u8]) -> Result<Key, Error> {
        let partition_id = self.partitions[index].id;
        let mapping = self.partitions[index].mapping;

        if data.len() > mapping.write_area_len as usize || data.len() > u16::MAX as usize {
            return Err(Error::NoMem);
        }
        let item_len = data.len() as u16;

        // The newest row is read before evicting anything, so the ids keep increasing
        // even when this item pushes out every other item
        let partition = &self.partitions[index];
        let (row_index, item_id, item_start_index) = if partition.status.num_stored_items == 0 {
            (partition.status.oldest_row_index, 0, 0)
        } else {
            let newest_row_index = partition.newest_row();
            let next_row_index = partition.next_row(newest_row_index);
            let newest = self.read_stored_row(index, newest_row_index)?;
            (
                next_row_index,
                newest.item_id.wrapping_add(1),
                newest.end_index(mapping.write_area_len),
            )
        };

        while self.partitions[index].status.filled_len + item_len as u32 > mapping.write_area_len {
            self.evict_oldest(index)?;
        }
        if self.partitions[index].status.num_stored_items == self.partitions[index].max_items {
            self.evict_oldest(index)?;
        }

        let row = LookupTableRow {
            item_id,
            item_start_index,
            item_len,
        };
        let row_addr = mapping.row_addr(row_index);
        if let Err(error) = self.write_item(&mapping, row_addr, &row, data) {
            // A row without its payload must not be taken for an item
            self.storage
                .write(row_addr, &LookupTableRow::ERASED)
                .map_err(|_| Error::Internal)?;
            return Err(error);
        }

        let status = &mut self.partitions[index].status;
        if status.num_stored_items == 0 {
            status.oldest_row_index = row_index;
        }
        status.num_stored_items += 1;
        status.filled_len += item_len as u32;

        Ok(Key {
            partition_id,
            table_row: row_index,
            item_id,
        })
    }

    fn write_item(
        &mut self,
        mapping: &PartitionMapping,
        row_addr: u32,
        row: &LookupTableRow,
        data: &[u8],
    ) -> Result<(), Error> {
        self.storage.write(row_addr, &row.encode())?;

        let first_len = data
            .len()
            .min((mapping.write_area_len - row.item_start_index) as usize);
        let (first, wrapped) = data.split_at(first_len);
        self.storage
            .write(mapping.write_area_addr + row.item_start_index, first)?;
        self.storage.write(mapping.write_area_addr, wrapped)
    }

    fn evict_oldest(&mut self, index: usize) -> Result<(), Error> {
        let mapping = self.partitions[index].mapping;
        let status = self.partitions[index].status;

        if status.num_stored_items == 0 {
            // Nothing left to evict but still no room
            return Err(Error::Internal);
        }

        let row = self.read_stored_row(index, status.oldest_row_index)?;
        self.storage.write(
            mapping.row_addr(status.oldest_row_index),
            &LookupTableRow::ERASED,
        )?;

        #[cfg(feature = "defmt-03")]
        defmt::trace!(
            "Evicted item {=u32} from partition {=u8}",
            row.item_id,
            self.partitions[index].id
        );

        let partition = &mut self.partitions[index];
        partition.status.num_stored_items -= 1;
        partition.status.filled_len = partition
            .status
            .filled_len
            .checked_sub(row.item_len as u32)
            .ok_or(Error::Internal)?;
        partition.status.oldest_row_index = partition.next_row(status.oldest_row_index);

        Ok(())
    }

    fn first_key(&mut self, index: usize) -> Result<Key, Error> {
        let status = self.partitions[index].status;
        if status.num_stored_items == 0 {
            return Err(Error::NotFound);
        }

        let row = self.read_stored_row(index, status.oldest_row_index)?;
        Ok(Key {
            partition_id: self.partitions[index].id,
            table_row: status.oldest_row_index,
            item_id: row.item_id,
        })
    }

    fn key_partition(&self, key: &Key) -> Result<usize, Error> {
        let index = self.partition_index(key.partition_id)?;
        if key.table_row >= self.partitions[index].max_items {
            return Err(Error::InvalidRange);
        }
        Ok(index)
    }

    fn increment_key_inner(&mut self, key: &mut Key) -> Result<(), Error> {
        let index = self.key_partition(key)?;

        match self.read_row(index, key.table_row)? {
            Some(row) if row.item_id == key.item_id => {
                let next_row_index = self.partitions[index].next_row(key.table_row);
                match self.read_row(index, next_row_index)? {
                    Some(next) if next.item_id == key.item_id.wrapping_add(1) => {
                        key.table_row = next_row_index;
                        key.item_id = next.item_id;
                        Ok(())
                    }
                    _ => Err(Error::NotFound),
                }
            }
            // The item is gone, continue from whatever is the oldest now
            _ => {
                *key = self.first_key(index)?;
                Ok(())
            }
        }
    }

    /// The row of the key, if it still holds the item of the key
    fn current_row(&mut self, key: &Key) -> Result<(usize, LookupTableRow), Error> {
        let index = self.key_partition(key)?;

        match self.read_row(index, key.table_row)? {
            Some(row) if row.item_id == key.item_id => Ok((index, row)),
            _ => Err(Error::NotFound),
        }
    }

    fn get_item_inner(&mut self, key: &Key, buffer: &mut [u8]) -> Result<u16, Error> {
        let (index, row) = self.current_row(key)?;
        let mapping = self.partitions[index].mapping;

        let len = row.item_len as usize;
        if buffer.len() < len {
            return Err(Error::BufferTooSmall(len));
        }

        let first_len = len.min((mapping.write_area_len - row.item_start_index) as usize);
        let (first, wrapped) = buffer[..len].split_at_mut(first_len);
        self.storage
            .read(mapping.write_area_addr + row.item_start_index, first)?;
        self.storage.read(mapping.write_area_addr, wrapped)?;

        Ok(row.item_len)
    }

    fn find_key_inner(
        &mut self,
        partition_id: PartitionId,
        buffer: &mut [u8],
        mut predicate: impl FnMut(&[u8]) -> bool,
    ) -> Result<Key, Error> {
        let index = self.partition_index(partition_id)?;
        let mut key = self.first_key(index)?;

        // Every item is visited at most once
        for _ in 0..self.partitions[index].max_items {
            match self.get_item_inner(&key, buffer) {
                Ok(len) => {
                    if predicate(&buffer[..len as usize]) {
                        return Ok(key);
                    }
                }
                // Overwritten since the key was made, skip it
                Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }

            self.increment_key_inner(&mut key)?;
        }

        Err(Error::NotFound)
    }
}
