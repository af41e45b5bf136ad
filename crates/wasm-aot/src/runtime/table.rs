// Reference tables. Entries hold raw reference payloads (see `Value::to_bits`).

use crate::Trap;
use crate::wasm::{Value, ValueKind};

pub const NULL_REF: u64 = u64::MAX;

/// Upper bound on table growth, independent of the declared maximum.
const MAX_TABLE_SIZE: u32 = 10_000_000;

#[derive(Debug, Clone)]
pub struct Table {
    element: ValueKind,
    entries: Vec<u64>,
    maximum: Option<u32>,
}

impl Table {
    #[must_use]
    pub fn new(element: ValueKind, initial: u32, maximum: Option<u32>, init: u64) -> Self {
        Self {
            element,
            entries: vec![init; initial as usize],
            maximum,
        }
    }

    #[must_use]
    pub fn element(&self) -> ValueKind {
        self.element
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_TABLE_SIZE
    pub fn size(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn get(&self, index: u32) -> Result<u64, Trap> {
        self.entries
            .get(index as usize)
            .copied()
            .ok_or(Trap::TableOutOfBounds)
    }

    /// Entry as a typed value.
    pub fn get_value(&self, index: u32) -> Result<Value, Trap> {
        self.get(index).map(|bits| Value::from_bits(self.element, bits))
    }

    pub fn set(&mut self, index: u32, value: u64) -> Result<(), Trap> {
        let slot = self
            .entries
            .get_mut(index as usize)
            .ok_or(Trap::TableOutOfBounds)?;
        *slot = value;
        Ok(())
    }

    /// Grow by `delta` entries set to `init`; previous size or `None`.
    pub fn grow(&mut self, delta: u32, init: u64) -> Option<u32> {
        let old = self.size();
        let limit = self.maximum.unwrap_or(MAX_TABLE_SIZE).min(MAX_TABLE_SIZE);
        let new = old.checked_add(delta).filter(|n| *n <= limit)?;
        self.entries.resize(new as usize, init);
        Some(old)
    }

    fn range(&self, start: u32, len: u32) -> Result<std::ops::Range<usize>, Trap> {
        let end = u64::from(start) + u64::from(len);
        if end > self.entries.len() as u64 {
            return Err(Trap::TableOutOfBounds);
        }
        Ok(start as usize..start as usize + len as usize)
    }

    pub fn fill(&mut self, start: u32, value: u64, len: u32) -> Result<(), Trap> {
        let range = self.range(start, len)?;
        self.entries[range].fill(value);
        Ok(())
    }

    /// Copy within this table.
    pub fn copy_within(&mut self, dst: u32, src: u32, len: u32) -> Result<(), Trap> {
        let src = self.range(src, len)?;
        let dst = self.range(dst, len)?;
        self.entries.copy_within(src, dst.start);
        Ok(())
    }

    /// Copy `len` entries of `src` starting at `src_start` into this table.
    pub fn copy_from(
        &mut self,
        dst: u32,
        src: &[u64],
        src_start: u32,
        len: u32,
    ) -> Result<(), Trap> {
        let end = u64::from(src_start) + u64::from(len);
        if end > src.len() as u64 {
            return Err(Trap::TableOutOfBounds);
        }
        let dst = self.range(dst, len)?;
        self.entries[dst].copy_from_slice(&src[src_start as usize..end as usize]);
        Ok(())
    }

    #[must_use]
    pub fn entries(&self) -> &[u64] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_bounds() {
        let mut table = Table::new(ValueKind::FuncRef, 2, None, NULL_REF);
        table.set(1, 5).expect("set");
        assert_eq!(table.get(1), Ok(5));
        assert_eq!(table.get_value(0), Ok(Value::FuncRef(None)));
        assert_eq!(table.get(2), Err(Trap::TableOutOfBounds));
        assert_eq!(table.set(2, 0), Err(Trap::TableOutOfBounds));
    }

    #[test]
    fn test_grow_and_fill() {
        let mut table = Table::new(ValueKind::ExternRef, 1, Some(3), NULL_REF);
        assert_eq!(table.grow(2, 9), Some(1));
        assert_eq!(table.grow(1, 9), None);
        table.fill(0, 4, 3).expect("fill");
        assert_eq!(table.entries(), &[4, 4, 4]);
        assert_eq!(table.fill(2, 0, 2), Err(Trap::TableOutOfBounds));
    }

    #[test]
    fn test_copy_from_segment() {
        let mut table = Table::new(ValueKind::FuncRef, 4, None, NULL_REF);
        table.copy_from(1, &[10, 11, 12], 1, 2).expect("init");
        assert_eq!(table.entries(), &[NULL_REF, 11, 12, NULL_REF]);
        assert_eq!(
            table.copy_from(0, &[10], 0, 2),
            Err(Trap::TableOutOfBounds)
        );
    }
}
