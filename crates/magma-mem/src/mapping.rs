//! # CPU Mappings
//!
//! Host views of GPU-visible memory.
//!
//! A mapping is a shared, bounds-checked window over qword-granular memory.
//! Sub-views share the same backing store, so a tag carved from a page sees
//! the same words the page does. Every access is atomic: the device and the
//! host touch the same words concurrently.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use magma_core::{ByteSize, Error, Result};

/// Shared host view of a memory range
#[derive(Clone)]
pub struct CpuMapping {
    words: Arc<[AtomicU64]>,
    base_word: usize,
    len_words: usize,
}

impl CpuMapping {
    /// Allocate a zeroed backing store of `size` bytes (rounded up to qwords)
    pub fn zeroed(size: ByteSize) -> Self {
        let len_words = size.as_bytes().div_ceil(8) as usize;
        let words: Vec<AtomicU64> = (0..len_words).map(|_| AtomicU64::new(0)).collect();
        Self {
            words: words.into(),
            base_word: 0,
            len_words,
        }
    }

    /// Size of the view in bytes
    #[inline]
    pub fn len(&self) -> u64 {
        self.len_words as u64 * 8
    }

    /// Whether the view is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len_words == 0
    }

    /// Narrow the view to `[offset, offset + size)`
    pub fn subview(&self, offset: u64, size: u64) -> Result<Self> {
        if offset % 8 != 0 || size % 8 != 0 {
            return Err(Error::MisalignedAddress);
        }
        let end = offset.checked_add(size).ok_or(Error::OutOfBounds)?;
        if end > self.len() {
            return Err(Error::OutOfBounds);
        }
        Ok(Self {
            words: Arc::clone(&self.words),
            base_word: self.base_word + (offset / 8) as usize,
            len_words: (size / 8) as usize,
        })
    }

    fn word(&self, offset: u64) -> Result<&AtomicU64> {
        let index = (offset / 8) as usize;
        if index >= self.len_words {
            return Err(Error::OutOfBounds);
        }
        self.words
            .get(self.base_word + index)
            .ok_or(Error::OutOfBounds)
    }

    /// Read a qword
    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        if offset % 8 != 0 {
            return Err(Error::MisalignedAddress);
        }
        Ok(self.word(offset)?.load(Ordering::Acquire))
    }

    /// Write a qword
    pub fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        if offset % 8 != 0 {
            return Err(Error::MisalignedAddress);
        }
        self.word(offset)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Atomically add to a qword, returning the previous value
    pub fn fetch_add_u64(&self, offset: u64, value: u64) -> Result<u64> {
        if offset % 8 != 0 {
            return Err(Error::MisalignedAddress);
        }
        Ok(self.word(offset)?.fetch_add(value, Ordering::AcqRel))
    }

    /// Read a dword
    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        if offset % 4 != 0 {
            return Err(Error::MisalignedAddress);
        }
        let shift = (offset % 8) * 8;
        let word = self.word(offset - offset % 8)?.load(Ordering::Acquire);
        Ok((word >> shift) as u32)
    }

    /// Write a dword, leaving the other half of its qword untouched
    pub fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
        if offset % 4 != 0 {
            return Err(Error::MisalignedAddress);
        }
        let shift = (offset % 8) * 8;
        let mask = 0xffff_ffffu64 << shift;
        let word = self.word(offset - offset % 8)?;
        let mut current = word.load(Ordering::Relaxed);
        loop {
            let next = (current & !mask) | ((value as u64) << shift);
            match word.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Zero the whole view
    pub fn zero(&self) {
        for index in 0..self.len_words {
            if let Some(word) = self.words.get(self.base_word + index) {
                word.store(0, Ordering::Release);
            }
        }
    }

    /// Whether both views start at the same word of the same backing store
    pub fn same_view(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.words, &other.words) && self.base_word == other.base_word
    }
}

impl fmt::Debug for CpuMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuMapping")
            .field("base", &(self.base_word * 8))
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_mapping() {
        let mapping = CpuMapping::zeroed(ByteSize::from_bytes(20));
        assert_eq!(mapping.len(), 24);
        assert_eq!(mapping.read_u64(16).unwrap(), 0);
        assert!(matches!(mapping.read_u64(24), Err(Error::OutOfBounds)));
        assert!(matches!(mapping.read_u64(4), Err(Error::MisalignedAddress)));
    }

    #[test]
    fn test_subview_shares_backing() {
        let page = CpuMapping::zeroed(ByteSize::from_bytes(128));
        let tag = page.subview(64, 64).unwrap();
        tag.write_u64(8, 42).unwrap();
        assert_eq!(page.read_u64(72).unwrap(), 42);
        assert!(matches!(page.subview(96, 64), Err(Error::OutOfBounds)));
    }

    #[test]
    fn test_dword_access() {
        let mapping = CpuMapping::zeroed(ByteSize::from_bytes(8));
        mapping.write_u32(0, 3).unwrap();
        mapping.write_u32(4, 7).unwrap();
        assert_eq!(mapping.read_u64(0).unwrap(), (7u64 << 32) | 3);
        assert_eq!(mapping.read_u32(4).unwrap(), 7);
    }

    #[test]
    fn test_zero_only_touches_view() {
        let page = CpuMapping::zeroed(ByteSize::from_bytes(32));
        page.write_u64(0, 1).unwrap();
        page.write_u64(16, 1).unwrap();
        page.subview(16, 16).unwrap().zero();
        assert_eq!(page.read_u64(0).unwrap(), 1);
        assert_eq!(page.read_u64(16).unwrap(), 0);
    }
}
