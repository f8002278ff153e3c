//! # Persistent Storage
//!
//! A namespaced key-value store kept as an append-only log on a flash region.
//! Writes never rewrite flash in place: every insert or delete appends a
//! record, and an in-memory index rebuilt at mount time resolves each key to
//! its most recent record. Space is reclaimed one sector at a time, so erases
//! are spread over the region and never touch a committed value that has not
//! been copied elsewhere first.
//!
//! The flash itself is abstracted by [`FlashRegion`], so the store runs on any
//! driver as well as on the RAM-backed [`RamFlash`].

mod flash;
mod kv;

pub use flash::{RamFlash, RamFlashError};
pub use kv::{KvNamespace, KvStore, SLOT_SIZE};

/// A region of NOR-like flash dedicated to one [`KvStore`].
///
/// Writes may only target erased bytes; `erase` resets one sector to `0xFF`.
/// The capacity should be a multiple of the sector size, trailing bytes are
/// left unused.
#[allow(async_fn_in_trait)]
pub trait FlashRegion {
    /// The error type returned by the flash driver.
    type Error: core::fmt::Debug;

    /// Size of the region in bytes.
    fn capacity(&self) -> usize;

    /// Size of the smallest erasable unit in bytes.
    fn sector_size(&self) -> usize;

    /// Reads `buf.len()` bytes starting at `offset`.
    async fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Programs `data` starting at `offset`.
    async fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Erases the sector starting at `offset`, a multiple of the sector size.
    async fn erase(&mut self, offset: u32) -> Result<(), Self::Error>;
}
