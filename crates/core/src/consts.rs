//! Constant heap
//!
//! A write-once word array emulating flash: erased words hold the
//! all-ones sentinel, a write succeeds into an erased slot or when it
//! repeats the value already there, and a differing rewrite fails.
//! Values lifted here survive every collection without being traced;
//! the collector can skip constant pointers because constants only
//! ever reference other constants or immediates.
//!
//! Lifted cons cells occupy two consecutive words (car, cdr) indexed
//! by the first; lifted byte payloads occupy whatever they need.

use crate::bytemem::WORD_BYTES;
use crate::error::CoreError;
use crate::word::Raw;

/// The erased-slot sentinel.
pub const ERASED: Raw = Raw::MAX;

/// The write-once constant region.
pub struct ConstHeap {
    words: Box<[Raw]>,
    /// First never-written index; appends go here.
    write_ix: usize,
}

impl ConstHeap {
    pub fn new(num_words: usize) -> Self {
        ConstHeap {
            words: vec![ERASED; num_words].into_boxed_slice(),
            write_ix: 0,
        }
    }

    #[inline]
    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    /// Index the next append lands on.
    #[inline]
    pub fn write_index(&self) -> usize {
        self.write_ix
    }

    #[inline]
    pub fn read(&self, ix: usize) -> Raw {
        self.words[ix]
    }

    /// Write-once store. Erased slots accept any word; set slots
    /// accept only an identical rewrite.
    pub fn write(&mut self, ix: usize, w: Raw) -> Result<(), CoreError> {
        if ix >= self.words.len() {
            return Err(CoreError::ConstFull);
        }
        if self.words[ix] == ERASED {
            self.words[ix] = w;
            self.write_ix = self.write_ix.max(ix + 1);
            Ok(())
        } else if self.words[ix] == w {
            Ok(())
        } else {
            Err(CoreError::ConstConflict { index: ix })
        }
    }

    /// Append one word, returning its index.
    pub fn append(&mut self, w: Raw) -> Result<usize, CoreError> {
        let ix = self.write_ix;
        if ix >= self.words.len() {
            return Err(CoreError::ConstFull);
        }
        self.write(ix, w)?;
        Ok(ix)
    }

    /// Append a run of words, returning the index of the first.
    pub fn append_all(&mut self, ws: &[Raw]) -> Result<usize, CoreError> {
        if self.write_ix + ws.len() > self.words.len() {
            return Err(CoreError::ConstFull);
        }
        let base = self.write_ix;
        for &w in ws {
            self.append(w)?;
        }
        Ok(base)
    }

    /// Read one byte out of a lifted byte region.
    #[inline]
    pub fn get_byte(&self, base: usize, byte_off: usize) -> u8 {
        let w = self.words[base + byte_off / WORD_BYTES];
        (w >> ((byte_off % WORD_BYTES) * 8)) as u8
    }

    /// Snapshot of the written prefix (for image save).
    pub fn written(&self) -> &[Raw] {
        &self.words[..self.write_ix]
    }

    /// Restore the written prefix (for image boot). Fails if any of
    /// the target slots has already been written differently.
    pub fn restore(&mut self, words: &[Raw]) -> Result<(), CoreError> {
        if words.len() > self.words.len() {
            return Err(CoreError::ConstFull);
        }
        for (ix, &w) in words.iter().enumerate() {
            // ERASED inside a snapshot stays erased.
            if w != ERASED {
                self.write(ix, w)?;
            }
        }
        self.write_ix = self.write_ix.max(words.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_once_laws() {
        let mut c = ConstHeap::new(8);
        // Erased slot accepts a write.
        c.write(3, 42).unwrap();
        assert_eq!(c.read(3), 42);
        // Identical rewrite is idempotent.
        c.write(3, 42).unwrap();
        // Differing rewrite fails.
        assert!(matches!(
            c.write(3, 43),
            Err(CoreError::ConstConflict { index: 3 })
        ));
        assert_eq!(c.read(3), 42);
    }

    #[test]
    fn test_append_sequence() {
        let mut c = ConstHeap::new(4);
        assert_eq!(c.append(10).unwrap(), 0);
        assert_eq!(c.append(11).unwrap(), 1);
        assert_eq!(c.write_index(), 2);
        let base = c.append_all(&[20, 21]).unwrap();
        assert_eq!(base, 2);
        assert!(matches!(c.append(99), Err(CoreError::ConstFull)));
    }

    #[test]
    fn test_append_after_indexed_write() {
        let mut c = ConstHeap::new(8);
        c.write(5, 1).unwrap();
        // Appends continue past the highest written slot.
        assert_eq!(c.append(2).unwrap(), 6);
    }

    #[test]
    fn test_restore_roundtrip() {
        let mut c = ConstHeap::new(8);
        c.append_all(&[1, 2, 3]).unwrap();
        let snap: Vec<Raw> = c.written().to_vec();

        let mut fresh = ConstHeap::new(8);
        fresh.restore(&snap).unwrap();
        assert_eq!(fresh.written(), &snap[..]);
        assert_eq!(fresh.write_index(), 3);
    }

    #[test]
    fn test_byte_view() {
        let mut c = ConstHeap::new(4);
        let packed = Raw::from_le_bytes({
            let mut b = [0u8; WORD_BYTES];
            b[0] = 0xAA;
            b[1] = 0xBB;
            b
        });
        let base = c.append(packed).unwrap();
        assert_eq!(c.get_byte(base, 0), 0xAA);
        assert_eq!(c.get_byte(base, 1), 0xBB);
    }
}
