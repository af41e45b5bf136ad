// Linear memory: page-granular, little-endian, bounds-checked.

#![allow(
    clippy::cast_possible_truncation, // narrowing stores keep the low bytes
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

use crate::Trap;
use crate::wasm::{LoadKind, MemoryType, StoreKind};

pub const PAGE_SIZE: usize = 65536;

/// Largest supported memory in pages. Keeps every valid address below
/// `i32::MAX`, so a negative base address is always out of bounds.
pub const MAX_PAGES: u32 = 32767;

#[derive(Debug, Clone)]
pub struct Memory {
    bytes: Vec<u8>,
    maximum: u32,
}

impl Memory {
    /// `None` when the initial size exceeds [`MAX_PAGES`].
    #[must_use]
    pub fn new(ty: MemoryType) -> Option<Self> {
        if ty.initial > MAX_PAGES {
            return None;
        }
        Some(Self {
            bytes: vec![0; ty.initial as usize * PAGE_SIZE],
            maximum: ty.maximum.map_or(MAX_PAGES, |m| m.min(MAX_PAGES)),
        })
    }

    #[must_use]
    pub fn pages(&self) -> u32 {
        (self.bytes.len() / PAGE_SIZE) as u32
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Grow by `delta` pages, returning the previous size, or `None` when
    /// the maximum would be exceeded.
    pub fn grow(&mut self, delta: u32) -> Option<u32> {
        let old = self.pages();
        let new = old.checked_add(delta).filter(|n| *n <= self.maximum)?;
        self.bytes.resize(new as usize * PAGE_SIZE, 0);
        Some(old)
    }

    fn range(&self, addr: u64, len: u64) -> Result<std::ops::Range<usize>, Trap> {
        let end = addr.checked_add(len).ok_or(Trap::MemoryOutOfBounds)?;
        if end > self.bytes.len() as u64 {
            return Err(Trap::MemoryOutOfBounds);
        }
        Ok(addr as usize..end as usize)
    }

    pub fn read(&self, addr: u64, len: usize) -> Result<&[u8], Trap> {
        let range = self.range(addr, len as u64)?;
        Ok(&self.bytes[range])
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), Trap> {
        let range = self.range(addr, data.len() as u64)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Typed read, returning the value's raw 64-bit payload.
    pub fn load(&self, kind: LoadKind, addr: u64) -> Result<u64, Trap> {
        let bytes = self.read(addr, kind.width())?;
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        let raw = u64::from_le_bytes(buf);
        Ok(match kind {
            LoadKind::I32 | LoadKind::F32 | LoadKind::I64 | LoadKind::F64 => raw,
            LoadKind::I32_8U | LoadKind::I32_16U => raw,
            LoadKind::I32_8S => u64::from(raw as u8 as i8 as i32 as u32),
            LoadKind::I32_16S => u64::from(raw as u16 as i16 as i32 as u32),
            LoadKind::I64_8S => raw as u8 as i8 as i64 as u64,
            LoadKind::I64_16S => raw as u16 as i16 as i64 as u64,
            LoadKind::I64_32S => raw as u32 as i32 as i64 as u64,
            LoadKind::I64_8U | LoadKind::I64_16U | LoadKind::I64_32U => raw,
        })
    }

    /// Typed write of the low `kind.width()` bytes of `bits`.
    pub fn store(&mut self, kind: StoreKind, addr: u64, bits: u64) -> Result<(), Trap> {
        let bytes = bits.to_le_bytes();
        self.write(addr, &bytes[..kind.width()])
    }

    pub fn fill(&mut self, dst: u32, value: u8, len: u32) -> Result<(), Trap> {
        let range = self.range(u64::from(dst), u64::from(len))?;
        self.bytes[range].fill(value);
        Ok(())
    }

    pub fn copy(&mut self, dst: u32, src: u32, len: u32) -> Result<(), Trap> {
        let src = self.range(u64::from(src), u64::from(len))?;
        let dst = self.range(u64::from(dst), u64::from(len))?;
        self.bytes.copy_within(src, dst.start);
        Ok(())
    }

    /// `memory.init`: copy `len` bytes of `data` starting at `src`.
    pub fn init(&mut self, dst: u32, data: &[u8], src: u32, len: u32) -> Result<(), Trap> {
        let end = u64::from(src) + u64::from(len);
        if end > data.len() as u64 {
            return Err(Trap::MemoryOutOfBounds);
        }
        self.write(u64::from(dst), &data[src as usize..end as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(pages: u32) -> Memory {
        Memory::new(MemoryType {
            initial: pages,
            maximum: Some(2),
        })
        .expect("memory")
    }

    #[test]
    fn test_sign_extending_loads() {
        let mut mem = memory(1);
        mem.write(0, &[0xFF, 0x80]).expect("write");
        assert_eq!(mem.load(LoadKind::I32_8S, 0), Ok(0xFFFF_FFFF));
        assert_eq!(mem.load(LoadKind::I32_8U, 0), Ok(0xFF));
        assert_eq!(mem.load(LoadKind::I64_16S, 0), Ok(0xFFFF_FFFF_FFFF_80FF));
        assert_eq!(mem.load(LoadKind::I64_16U, 0), Ok(0x80FF));
    }

    #[test]
    fn test_bounds_checks() {
        let mut mem = memory(1);
        let last = (PAGE_SIZE - 4) as u64;
        mem.store(StoreKind::I32, last, 7).expect("in bounds");
        assert_eq!(
            mem.load(LoadKind::I32, last + 1),
            Err(Trap::MemoryOutOfBounds)
        );
        assert_eq!(mem.load(LoadKind::I64, u64::MAX - 2), Err(Trap::MemoryOutOfBounds));
        assert_eq!(mem.fill(1, 0, PAGE_SIZE as u32), Err(Trap::MemoryOutOfBounds));
        assert_eq!(mem.init(0, &[1, 2, 3], 2, 2), Err(Trap::MemoryOutOfBounds));
    }

    #[test]
    fn test_grow_respects_maximum() {
        let mut mem = memory(1);
        assert_eq!(mem.grow(1), Some(1));
        assert_eq!(mem.pages(), 2);
        assert_eq!(mem.grow(1), None);
        assert_eq!(mem.grow(0), Some(2));
    }

    #[test]
    fn test_copy_overlapping() {
        let mut mem = memory(1);
        mem.write(0, &[1, 2, 3, 4]).expect("write");
        mem.copy(1, 0, 3).expect("copy");
        assert_eq!(mem.read(0, 4).expect("read"), &[1, 1, 2, 3]);
    }
}
