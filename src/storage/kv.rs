//! Append-only key-value log.
//!
//! The region is split in sectors. A sector in use starts with one slot of
//! header: `"AKV1"`, a sequence number (LE), four zero bytes and the CRC-32 of
//! the first twelve bytes. The log is read in sequence order. Records follow
//! the header, aligned to [`SLOT_SIZE`] bytes:
//!
//! | offset | size | content |
//! |---|---|---|
//! | 0 | 1 | magic `0xA5` |
//! | 1 | 1 | kind: `1` insert, `2` delete |
//! | 2 | 1 | namespace length |
//! | 3 | 1 | key length |
//! | 4 | 2 | value length (LE) |
//! | 6 | 2 | reserved, zero |
//! | 8 | 4 | live records after this one (LE) |
//! | 12 | 4 | write stamp of the value (LE) |
//! | 16 | 4 | CRC-32 of bytes 0..16 and of the payload (LE) |
//! | 20 | n | namespace, key, value |
//!
//! One sector is always kept erased. When the log needs a new sector and only
//! that spare is left, the live records of the oldest sector are copied to the
//! head of the log and only then is the oldest sector erased. Copies keep
//! their write stamp, so recency survives the move.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use super::FlashRegion;
use crate::error::StoreError;

/// Records start on multiples of this many bytes.
pub const SLOT_SIZE: usize = 16;

const HEADER_SIZE: usize = 20;
const MAGIC: u8 = 0xA5;
const KIND_INSERT: u8 = 1;
const KIND_DELETE: u8 = 2;
const ERASED: u8 = 0xFF;
const SECTOR_MAGIC: [u8; 4] = *b"AKV1";

/// Location of the latest value of one key.
#[derive(Debug, Clone)]
struct IndexEntry {
    namespace: String,
    key: String,
    value_offset: u32,
    value_len: u16,
    stamp: u32,
}

impl IndexEntry {
    fn record_len(&self) -> usize {
        record_len(self.namespace.len() + self.key.len() + self.value_len as usize)
    }
}

struct Header {
    kind: u8,
    ns_len: usize,
    key_len: usize,
    value_len: usize,
    live: u32,
    stamp: u32,
    crc: u32,
}

impl Header {
    fn payload_len(&self) -> usize {
        self.ns_len + self.key_len + self.value_len
    }
}

/// A key-value store over one flash region.
///
/// Keys live in namespaces; use [`KvStore::namespace`] to operate on one.
pub struct KvStore<F: FlashRegion> {
    flash: F,
    sector_size: usize,
    /// Sequence number of each sector in use, `None` for erased sectors.
    sectors: Vec<Option<u32>>,
    /// Live entries, oldest stamp first.
    index: Vec<IndexEntry>,
    /// Sector receiving appends.
    current: Option<usize>,
    /// Offset of the first free slot of `current`.
    tail: usize,
    next_seq: u32,
    next_stamp: u32,
}

impl<F: FlashRegion> KvStore<F> {
    /// Scans the region and rebuilds the index.
    ///
    /// Sectors left half-initialized by an interrupted write are erased.
    pub async fn mount(flash: F) -> Result<Self, StoreError<F::Error>> {
        let sector_size = flash.sector_size();
        if sector_size % SLOT_SIZE != 0 || sector_size < SLOT_SIZE + record_len(0) {
            return Err(StoreError::InvalidGeometry);
        }
        let count = flash.capacity() / sector_size;
        if count < 2 {
            return Err(StoreError::InvalidGeometry);
        }

        let mut store = Self {
            flash,
            sector_size,
            sectors: vec![None; count],
            index: Vec::new(),
            current: None,
            tail: 0,
            next_seq: 0,
            next_stamp: 0,
        };

        for sector in 0..count {
            let start = store.sector_start(sector);
            let mut raw = [0u8; SLOT_SIZE];
            store
                .flash
                .read(start as u32, &mut raw)
                .await
                .map_err(StoreError::Flash)?;
            if let Some(seq) = parse_sector_header(&raw) {
                store.sectors[sector] = Some(seq);
            } else if !store.is_erased(sector).await? {
                warn!("Erasing interrupted flash sector {}", sector);
                store
                    .flash
                    .erase(start as u32)
                    .await
                    .map_err(StoreError::Flash)?;
            }
        }

        let mut order: Vec<(u32, usize)> = store
            .sectors
            .iter()
            .enumerate()
            .filter_map(|(sector, seq)| seq.map(|seq| (seq, sector)))
            .collect();
        order.sort_unstable();

        let mut recorded_live = None;
        for &(seq, sector) in &order {
            let (tail, live) = store.scan_sector(sector).await?;
            store.current = Some(sector);
            store.tail = tail;
            store.next_seq = seq.wrapping_add(1);
            recorded_live = live.or(recorded_live);
        }
        store.index.sort_by_key(|e| e.stamp);

        if let Some(live) = recorded_live
            && live as usize != store.index.len()
        {
            warn!(
                "Flash log records {} live entries, index holds {}",
                live,
                store.index.len()
            );
        }
        debug!(
            "Mounted key-value store: {} entries in {} of {} sectors",
            store.index.len(),
            order.len(),
            count
        );
        Ok(store)
    }

    /// Erases the region, dropping every namespace.
    pub async fn clear(&mut self) -> Result<(), StoreError<F::Error>> {
        for sector in 0..self.sectors.len() {
            if self.sectors[sector].is_some() {
                self.flash
                    .erase(self.sector_start(sector) as u32)
                    .await
                    .map_err(StoreError::Flash)?;
                self.sectors[sector] = None;
            }
        }
        self.index.clear();
        self.current = None;
        self.tail = 0;
        Ok(())
    }

    /// Operations scoped to `namespace`.
    pub fn namespace<'s>(&'s mut self, namespace: &'s str) -> KvNamespace<'s, F> {
        KvNamespace {
            store: self,
            namespace,
        }
    }

    /// Number of live entries across all namespaces.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Bytes of the region taken by the log, counting closed sectors whole.
    pub fn used(&self) -> usize {
        let Some(current) = self.current else {
            return 0;
        };
        let open = self.sectors.iter().filter(|s| s.is_some()).count();
        (open - 1) * self.sector_size + self.tail - self.sector_start(current)
    }

    /// Gives the flash region back.
    pub fn into_inner(self) -> F {
        self.flash
    }

    fn sector_start(&self, sector: usize) -> usize {
        sector * self.sector_size
    }

    fn sector_end(&self, sector: usize) -> usize {
        self.sector_start(sector) + self.sector_size
    }

    fn free_sectors(&self) -> usize {
        self.sectors.iter().filter(|s| s.is_none()).count()
    }

    fn oldest_sector(&self) -> Option<usize> {
        self.sectors
            .iter()
            .enumerate()
            .filter_map(|(sector, seq)| seq.map(|seq| (seq, sector)))
            .min()
            .map(|(_, sector)| sector)
    }

    fn position(&self, namespace: &str, key: &str) -> Option<usize> {
        self.index
            .iter()
            .position(|e| e.namespace == namespace && e.key == key)
    }

    async fn is_erased(&mut self, sector: usize) -> Result<bool, StoreError<F::Error>> {
        let mut chunk = [0u8; SLOT_SIZE];
        for offset in (self.sector_start(sector)..self.sector_end(sector)).step_by(SLOT_SIZE) {
            self.flash
                .read(offset as u32, &mut chunk)
                .await
                .map_err(StoreError::Flash)?;
            if chunk.iter().any(|b| *b != ERASED) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Replays the records of one sector into the index. Returns the offset
    /// following the last record, or the sector end when the rest of the
    /// sector cannot be trusted, and the live count of the last record.
    async fn scan_sector(
        &mut self,
        sector: usize,
    ) -> Result<(usize, Option<u32>), StoreError<F::Error>> {
        let end = self.sector_end(sector);
        let mut offset = self.sector_start(sector) + SLOT_SIZE;
        let mut live = None;

        while offset + HEADER_SIZE <= end {
            let mut raw = [0u8; HEADER_SIZE];
            self.flash
                .read(offset as u32, &mut raw)
                .await
                .map_err(StoreError::Flash)?;
            if raw.iter().all(|b| *b == ERASED) {
                return Ok((offset, live));
            }
            let Some(header) = parse_header(&raw) else {
                warn!("Unreadable flash record at offset {}", offset);
                return Ok((end, live));
            };
            let total = record_len(header.payload_len());
            if offset + total > end {
                warn!("Flash record at offset {} overruns its sector", offset);
                return Ok((end, live));
            }

            let mut payload = vec![0u8; header.payload_len()];
            self.flash
                .read((offset + HEADER_SIZE) as u32, &mut payload)
                .await
                .map_err(StoreError::Flash)?;
            if checksum(&raw, &payload) != header.crc {
                warn!("Skipping torn flash record at offset {}", offset);
                offset += total;
                continue;
            }
            self.next_stamp = self.next_stamp.max(header.stamp.wrapping_add(1));

            let names = core::str::from_utf8(&payload[..header.ns_len + header.key_len]);
            if let Ok(names) = names
                && names.is_char_boundary(header.ns_len)
            {
                let (namespace, key) = names.split_at(header.ns_len);
                remove_entry(&mut self.index, namespace, key);
                if header.kind == KIND_INSERT {
                    self.index.push(IndexEntry {
                        namespace: namespace.into(),
                        key: key.into(),
                        value_offset: (offset + HEADER_SIZE + header.ns_len + header.key_len)
                            as u32,
                        value_len: header.value_len as u16,
                        stamp: header.stamp,
                    });
                }
                live = Some(header.live);
            } else {
                warn!("Skipping flash record with invalid key at offset {}", offset);
            }
            offset += total;
        }
        Ok((end, live))
    }

    async fn append(
        &mut self,
        kind: u8,
        namespace: &str,
        key: &str,
        value: &[u8],
    ) -> Result<(), StoreError<F::Error>> {
        if namespace.len() > u8::MAX as usize || key.len() > u8::MAX as usize {
            return Err(StoreError::KeyTooLong);
        }
        if value.len() > u16::MAX as usize {
            return Err(StoreError::ValueTooLarge);
        }

        self.reserve(record_len(namespace.len() + key.len() + value.len()))
            .await?;

        let existing = self.position(namespace, key);
        let live = match (kind, existing) {
            (KIND_INSERT, None) => self.index.len() + 1,
            (KIND_DELETE, Some(_)) => self.index.len() - 1,
            _ => self.index.len(),
        };
        let stamp = self.next_stamp;
        let value_offset = self
            .write_record(kind, namespace, key, value, live, stamp)
            .await?;
        self.next_stamp = stamp.wrapping_add(1);

        if let Some(idx) = existing {
            self.index.remove(idx);
        }
        if kind == KIND_INSERT {
            self.index.push(IndexEntry {
                namespace: namespace.into(),
                key: key.into(),
                value_offset,
                value_len: value.len() as u16,
                stamp,
            });
        }
        Ok(())
    }

    /// Makes room for `total` bytes at the tail of the current sector.
    async fn reserve(&mut self, total: usize) -> Result<(), StoreError<F::Error>> {
        let usable = self.sector_size - SLOT_SIZE;
        if total > usable {
            return Err(StoreError::Full);
        }

        // Every round either opens a sector or erases one.
        for _ in 0..=self.sectors.len() {
            if let Some(current) = self.current
                && self.tail + total <= self.sector_end(current)
            {
                return Ok(());
            }
            if self.free_sectors() > 1 {
                self.open_sector().await?;
                continue;
            }

            let live: usize = self.index.iter().map(IndexEntry::record_len).sum();
            if live + total > (self.sectors.len() - 1) * usable {
                return Err(StoreError::Full);
            }
            self.collect_garbage().await?;
        }
        Err(StoreError::Full)
    }

    /// Starts a new sector after the current one.
    async fn open_sector(&mut self) -> Result<(), StoreError<F::Error>> {
        let count = self.sectors.len();
        let first = self.current.map_or(0, |c| c + 1);
        let sector = (first..first + count)
            .map(|i| i % count)
            .find(|&i| self.sectors[i].is_none())
            .ok_or(StoreError::Full)?;

        let start = self.sector_start(sector);
        if !self.is_erased(sector).await? {
            self.flash
                .erase(start as u32)
                .await
                .map_err(StoreError::Flash)?;
        }

        let seq = self.next_seq;
        let mut header = [0u8; SLOT_SIZE];
        header[..4].copy_from_slice(&SECTOR_MAGIC);
        header[4..8].copy_from_slice(&seq.to_le_bytes());
        let crc = crc32fast::hash(&header[..12]);
        header[12..].copy_from_slice(&crc.to_le_bytes());
        self.flash
            .write(start as u32, &header)
            .await
            .map_err(StoreError::Flash)?;

        trace!("Opened flash sector {} with sequence {}", sector, seq);
        self.sectors[sector] = Some(seq);
        self.next_seq = seq.wrapping_add(1);
        self.current = Some(sector);
        self.tail = start + SLOT_SIZE;
        Ok(())
    }

    /// Moves the live records of the oldest sector to the head of the log,
    /// then erases that sector.
    async fn collect_garbage(&mut self) -> Result<(), StoreError<F::Error>> {
        let oldest = self.oldest_sector().ok_or(StoreError::Full)?;
        let (start, end) = (self.sector_start(oldest), self.sector_end(oldest));
        let moving: Vec<usize> = self
            .index
            .iter()
            .enumerate()
            .filter(|(_, e)| (start..end).contains(&(e.value_offset as usize)))
            .map(|(idx, _)| idx)
            .collect();
        debug!(
            "Reclaiming flash sector {}, moving {} live entries",
            oldest,
            moving.len()
        );

        if !moving.is_empty() {
            let needed: usize = moving.iter().map(|&idx| self.index[idx].record_len()).sum();
            let fits = matches!(self.current, Some(current)
                if current != oldest && self.tail + needed <= self.sector_end(current));
            if !fits {
                self.open_sector().await?;
            }
            for idx in moving {
                let entry = self.index[idx].clone();
                let mut value = vec![0u8; entry.value_len as usize];
                self.flash
                    .read(entry.value_offset, &mut value)
                    .await
                    .map_err(StoreError::Flash)?;
                let live = self.index.len();
                let value_offset = self
                    .write_record(
                        KIND_INSERT,
                        &entry.namespace,
                        &entry.key,
                        &value,
                        live,
                        entry.stamp,
                    )
                    .await?;
                self.index[idx].value_offset = value_offset;
            }
        }

        self.flash
            .erase(start as u32)
            .await
            .map_err(StoreError::Flash)?;
        self.sectors[oldest] = None;
        if self.current == Some(oldest) {
            self.current = None;
            self.tail = 0;
        }
        Ok(())
    }

    /// Programs one record at the tail and returns the offset of its value.
    /// Space must have been reserved by the caller.
    async fn write_record(
        &mut self,
        kind: u8,
        namespace: &str,
        key: &str,
        value: &[u8],
        live: usize,
        stamp: u32,
    ) -> Result<u32, StoreError<F::Error>> {
        let payload_len = namespace.len() + key.len() + value.len();
        let mut record = Vec::with_capacity(HEADER_SIZE + payload_len);
        record.extend_from_slice(&[
            MAGIC,
            kind,
            namespace.len() as u8,
            key.len() as u8,
        ]);
        record.extend_from_slice(&(value.len() as u16).to_le_bytes());
        record.extend_from_slice(&[0, 0]);
        record.extend_from_slice(&(live as u32).to_le_bytes());
        record.extend_from_slice(&stamp.to_le_bytes());
        record.extend_from_slice(&[0; 4]);
        record.extend_from_slice(namespace.as_bytes());
        record.extend_from_slice(key.as_bytes());
        record.extend_from_slice(value);
        let crc = checksum(&record[..HEADER_SIZE], &record[HEADER_SIZE..]);
        record[16..20].copy_from_slice(&crc.to_le_bytes());

        self.flash
            .write(self.tail as u32, &record)
            .await
            .map_err(StoreError::Flash)?;

        let value_offset = (self.tail + HEADER_SIZE + namespace.len() + key.len()) as u32;
        self.tail += record_len(payload_len);
        Ok(value_offset)
    }
}

/// A namespace of a [`KvStore`]. Keys returned by this view never include the
/// namespace.
pub struct KvNamespace<'s, F: FlashRegion> {
    store: &'s mut KvStore<F>,
    namespace: &'s str,
}

impl<F: FlashRegion> KvNamespace<'_, F> {
    /// Inserts or overwrites `key`.
    pub async fn insert(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError<F::Error>> {
        self.store
            .append(KIND_INSERT, self.namespace, key, value)
            .await
    }

    /// Reads the value of `key`.
    ///
    /// With `None` only the size of the value is returned, so callers can
    /// allocate exactly before reading.
    pub async fn find(
        &mut self,
        key: &str,
        out: Option<&mut [u8]>,
    ) -> Result<usize, StoreError<F::Error>> {
        let idx = self
            .store
            .position(self.namespace, key)
            .ok_or(StoreError::NotFound)?;
        let entry = &self.store.index[idx];
        let len = entry.value_len as usize;
        let offset = entry.value_offset;

        let Some(out) = out else {
            return Ok(len);
        };
        let dst = out
            .get_mut(..len)
            .ok_or(StoreError::BufferTooSmall { required: len })?;
        self.store
            .flash
            .read(offset, dst)
            .await
            .map_err(StoreError::Flash)?;
        Ok(len)
    }

    /// Reads the value of `key` into a new vector.
    pub async fn find_vec(&mut self, key: &str) -> Result<Vec<u8>, StoreError<F::Error>> {
        let len = self.find(key, None).await?;
        let mut value = vec![0u8; len];
        self.find(key, Some(&mut value)).await?;
        Ok(value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.position(self.namespace, key).is_some()
    }

    /// Deletes `key` by appending a delete marker.
    pub async fn delete(&mut self, key: &str) -> Result<(), StoreError<F::Error>> {
        if !self.contains(key) {
            return Err(StoreError::NotFound);
        }
        self.store
            .append(KIND_DELETE, self.namespace, key, &[])
            .await
    }

    /// Keys of the namespace, most recently written first.
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        let namespace = self.namespace;
        self.store
            .index
            .iter()
            .rev()
            .filter(move |e| e.namespace == namespace)
            .map(|e| e.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.keys().count()
    }

    pub fn is_empty(&self) -> bool {
        self.keys().next().is_none()
    }
}

fn parse_header(raw: &[u8; HEADER_SIZE]) -> Option<Header> {
    if raw[0] != MAGIC || !(raw[1] == KIND_INSERT || raw[1] == KIND_DELETE) {
        return None;
    }
    Some(Header {
        kind: raw[1],
        ns_len: raw[2] as usize,
        key_len: raw[3] as usize,
        value_len: u16::from_le_bytes([raw[4], raw[5]]) as usize,
        live: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
        stamp: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        crc: u32::from_le_bytes([raw[16], raw[17], raw[18], raw[19]]),
    })
}

fn parse_sector_header(raw: &[u8; SLOT_SIZE]) -> Option<u32> {
    if raw[..4] != SECTOR_MAGIC {
        return None;
    }
    let crc = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]);
    if crc32fast::hash(&raw[..12]) != crc {
        return None;
    }
    Some(u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]))
}

fn checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[..16]);
    hasher.update(payload);
    hasher.finalize()
}

fn record_len(payload_len: usize) -> usize {
    (HEADER_SIZE + payload_len).div_ceil(SLOT_SIZE) * SLOT_SIZE
}

fn remove_entry(index: &mut Vec<IndexEntry>, namespace: &str, key: &str) {
    if let Some(idx) = index
        .iter()
        .position(|e| e.namespace == namespace && e.key == key)
    {
        index.remove(idx);
    }
}
