//! RAM-backed flash region.

use alloc::vec;
use alloc::vec::Vec;

use super::FlashRegion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RamFlashError {
    /// The access falls outside the region.
    OutOfBounds,
    /// An erase did not start on a sector boundary.
    Unaligned,
}

/// A flash region emulated in RAM.
///
/// It follows NOR semantics: programming can only clear bits, so writing over
/// already programmed bytes yields the AND of old and new content, exactly as
/// a torn or repeated write would on real hardware.
#[derive(Debug, Clone)]
pub struct RamFlash {
    data: Vec<u8>,
    sector_size: usize,
}

impl RamFlash {
    /// An erased region of `sectors` sectors of `sector_size` bytes each.
    pub fn new(sector_size: usize, sectors: usize) -> Self {
        Self {
            data: vec![0xFF; sector_size * sectors],
            sector_size,
        }
    }

    /// Raw content of the region.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Raw mutable content of the region, to simulate corruption.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn range(&self, offset: u32, len: usize) -> Result<core::ops::Range<usize>, RamFlashError> {
        let start = offset as usize;
        let end = start.checked_add(len).ok_or(RamFlashError::OutOfBounds)?;
        if end > self.data.len() {
            return Err(RamFlashError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl FlashRegion for RamFlash {
    type Error = RamFlashError;

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    async fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    async fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, data.len())?;
        for (dst, src) in self.data[range].iter_mut().zip(data) {
            *dst &= *src;
        }
        Ok(())
    }

    async fn erase(&mut self, offset: u32) -> Result<(), Self::Error> {
        if offset as usize % self.sector_size != 0 {
            return Err(RamFlashError::Unaligned);
        }
        let range = self.range(offset, self.sector_size)?;
        self.data[range].fill(0xFF);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    #[test]
    fn writes_only_clear_bits() {
        let mut flash = RamFlash::new(2, 2);
        block_on(flash.write(0, &[0x0F, 0xF0, 0x00])).unwrap();
        block_on(flash.write(0, &[0xF0])).unwrap();
        assert_eq!(flash.as_bytes(), &[0x00, 0xF0, 0x00, 0xFF]);

        block_on(flash.erase(0)).unwrap();
        assert_eq!(flash.as_bytes(), &[0xFF, 0xFF, 0x00, 0xFF]);
    }

    #[test]
    fn out_of_bounds() {
        let mut flash = RamFlash::new(2, 2);
        let mut buf = [0u8; 2];
        assert_eq!(
            block_on(flash.read(3, &mut buf)),
            Err(RamFlashError::OutOfBounds)
        );
        assert_eq!(
            block_on(flash.write(4, &[0])),
            Err(RamFlashError::OutOfBounds)
        );
        assert_eq!(block_on(flash.erase(1)), Err(RamFlashError::Unaligned));
        assert_eq!(block_on(flash.erase(4)), Err(RamFlashError::OutOfBounds));
    }
}
