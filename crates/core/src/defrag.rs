//! Defragmenting byte pool
//!
//! A contiguous region inside byte memory for byte arrays that must
//! keep a stable handle but may be compacted on demand. Layout:
//!
//! ```text
//! pool:    [ size-in-words | flags | data words ... ]
//! record:  [ size-in-bytes | data-pointer | back-cell | payload, padded ]
//! ```
//!
//! Every live record's back-cell is a heap cell whose car holds the
//! record's absolute word index and whose cdr is the defrag-array
//! type symbol; the two-way link lets compaction update the handle
//! when a record moves. Holes are runs of zero words, so a zero
//! header word terminates nothing and the scan just steps over it.
//!
//! Compaction runs only at GC-safe points; no caller holds a raw
//! offset into the pool across one.

use bitflags::bitflags;
use tracing::debug;

use crate::bytemem::{ByteMem, bytes_to_words};
use crate::error::ErrKind;
use crate::heap::ConsHeap;
use crate::word::{Raw, Tag, Word, sym};

/// Words of record bookkeeping ahead of the payload.
pub const RECORD_HEADER_WORDS: usize = 3;

bitflags! {
    /// The pool's flags word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolFlags: Raw {
        /// Set when an allocation failed; the next attempt compacts
        /// before scanning.
        const NEEDS_COMPACTION = 1;
    }
}

/// A defrag pool rooted at a byte-memory allocation.
#[derive(Debug, Clone, Copy)]
pub struct DefragPool {
    /// Word index of the pool header in byte memory.
    base: usize,
}

impl DefragPool {
    /// Carve a pool of at least `nbytes` payload capacity out of
    /// byte memory.
    pub fn create(bytes: &mut ByteMem, nbytes: usize) -> Result<DefragPool, ErrKind> {
        let nwords = bytes_to_words(nbytes);
        if nwords == 0 {
            return Err(ErrKind::Type);
        }
        let base = bytes.alloc(2 + nwords)?;
        bytes.write(base, nwords as Raw);
        bytes.write(base + 1, PoolFlags::empty().bits());
        Ok(DefragPool { base })
    }

    #[inline]
    fn size_words(&self, bytes: &ByteMem) -> usize {
        bytes.read(self.base) as usize
    }

    #[inline]
    fn data_base(&self) -> usize {
        self.base + 2
    }

    #[inline]
    pub fn flags(&self, bytes: &ByteMem) -> PoolFlags {
        PoolFlags::from_bits_truncate(bytes.read(self.base + 1))
    }

    #[inline]
    fn set_flags(&self, bytes: &mut ByteMem, flags: PoolFlags) {
        bytes.write(self.base + 1, flags.bits());
    }

    /// Allocate `nbytes` from the pool, returning a defrag-array
    /// handle. The first failed scan sets the compaction flag and
    /// reports out-of-memory; the retry compacts first.
    pub fn alloc(
        &self,
        bytes: &mut ByteMem,
        heap: &mut ConsHeap,
        nbytes: usize,
    ) -> Result<Word, ErrKind> {
        let cell = heap.allocate(Word::NIL, Word::symbol(sym::TYPE_DEFRAG_ARRAY))?;

        if self.flags(bytes).contains(PoolFlags::NEEDS_COMPACTION) {
            self.defrag(bytes, heap);
            self.set_flags(bytes, PoolFlags::empty());
        }

        let alloc_words = RECORD_HEADER_WORDS + bytes_to_words(nbytes);
        match self.find_free_run(bytes, alloc_words) {
            Some(rel) => {
                let record = self.data_base() + rel;
                bytes.write(record, nbytes as Raw);
                bytes.write(record + 1, (record + RECORD_HEADER_WORDS) as Raw);
                bytes.write(record + 2, cell.index() as Raw);
                heap.set_car(cell, Word::small_uint(record as u64))?;
                Ok(Word::ptr(Tag::DefragArray, cell.index()))
            }
            None => {
                self.set_flags(bytes, PoolFlags::NEEDS_COMPACTION);
                // Neutralize the handle so the sweep does not treat
                // it as a live record.
                heap.set_car(cell, Word::NIL)?;
                heap.set_cdr(cell, Word::NIL)?;
                Err(ErrKind::OutOfMemory)
            }
        }
    }

    /// First-fit scan for `alloc_words` consecutive zero words,
    /// skipping over live records by their stored size.
    fn find_free_run(&self, bytes: &ByteMem, alloc_words: usize) -> Option<usize> {
        let size = self.size_words(bytes);
        let data = self.data_base();
        let mut i = 0usize;
        let mut free_start = 0usize;
        let mut free_words = 0usize;
        while i < size {
            let w = bytes.read(data + i);
            if w != 0 {
                // The scan only lands on header boundaries or inside
                // holes, so a nonzero word is always a record header.
                free_words = 0;
                i += RECORD_HEADER_WORDS + bytes_to_words(w as usize);
                continue;
            }
            if free_words == 0 {
                free_start = i;
            }
            free_words += 1;
            if free_words >= alloc_words {
                return Some(free_start);
            }
            i += 1;
        }
        None
    }

    /// Slide every live record into the lowest unused offset, update
    /// its back-cell, and zero the vacated words.
    pub fn defrag(&self, bytes: &mut ByteMem, heap: &mut ConsHeap) {
        let size = self.size_words(bytes);
        let data = self.data_base();
        let mut hole_start = 0usize;
        let mut i = 0usize;
        let mut moved = 0usize;
        while i < size {
            let header = bytes.read(data + i);
            if header == 0 {
                i += 1;
                continue;
            }
            let total = RECORD_HEADER_WORDS + bytes_to_words(header as usize);
            if hole_start == i {
                i += total;
                hole_start = i;
                continue;
            }
            // Copy ascending (target below source) then zero the
            // stale words not overwritten by the new position.
            for k in 0..total {
                let w = bytes.read(data + i + k);
                bytes.write(data + hole_start + k, w);
            }
            let stale_from = i.max(hole_start + total);
            for k in stale_from..i + total {
                bytes.write(data + k, 0);
            }
            let record = data + hole_start;
            bytes.write(record + 1, (record + RECORD_HEADER_WORDS) as Raw);
            let cell_ix = bytes.read(record + 2) as usize;
            if heap
                .set_car(Word::cons(cell_ix), Word::small_uint(record as u64))
                .is_err()
            {
                debug!(cell_ix, "defrag record with stale back-cell");
            }
            moved += 1;
            i += total;
            hole_start += total;
        }
        debug!(moved, "defrag pool compacted");
    }
}

/// Resolve a defrag-array handle to its record's absolute word index.
pub fn record_of(heap: &ConsHeap, handle: Word) -> Result<usize, ErrKind> {
    if handle.tag() != Tag::DefragArray {
        return Err(ErrKind::Type);
    }
    let cell = Word::cons(handle.index());
    if heap.cdr(cell)? != Word::symbol(sym::TYPE_DEFRAG_ARRAY) {
        return Err(ErrKind::Type);
    }
    Ok(heap.car(cell)?.as_small_uint() as usize)
}

/// Byte length of the record behind a defrag-array handle.
pub fn record_len(heap: &ConsHeap, bytes: &ByteMem, handle: Word) -> Result<usize, ErrKind> {
    Ok(bytes.read(record_of(heap, handle)?) as usize)
}
