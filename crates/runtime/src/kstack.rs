//! Continuation stack
//!
//! A per-context growable array of tagged words with an explicit
//! stack pointer and high-water mark. The stack holds continuation
//! frames and nothing else; the only operations are push, pop, and
//! peek. Growth doubles capacity up to a per-context cap; exhaustion
//! reports a stack overflow, which terminates the context.

use sprig_core::{ErrKind, Word};

/// One context's continuation stack.
#[derive(Debug)]
pub struct KStack {
    data: Vec<Word>,
    max_sp: usize,
    cap: usize,
}

impl KStack {
    pub fn new(initial: usize, cap: usize) -> Self {
        KStack {
            data: Vec::with_capacity(initial.min(cap)),
            max_sp: 0,
            cap,
        }
    }

    /// Current stack pointer.
    #[inline]
    pub fn sp(&self) -> usize {
        self.data.len()
    }

    /// Highest stack pointer ever reached.
    #[inline]
    pub fn max_sp(&self) -> usize {
        self.max_sp
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Push one word. Capacity doubles as needed, up to the cap.
    pub fn push(&mut self, w: Word) -> Result<(), ErrKind> {
        if self.data.len() >= self.cap {
            return Err(ErrKind::StackOverflow);
        }
        if self.data.len() == self.data.capacity() {
            let grown = (self.data.capacity() * 2).clamp(16, self.cap);
            self.data.reserve_exact(grown - self.data.len());
        }
        self.data.push(w);
        self.max_sp = self.max_sp.max(self.data.len());
        Ok(())
    }

    /// Push a frame: operand words first, kind tag last.
    pub fn push_frame(&mut self, words: &[Word]) -> Result<(), ErrKind> {
        for &w in words {
            self.push(w)?;
        }
        Ok(())
    }

    /// Pop one word. Popping an empty stack is an invariant
    /// violation, not a user error.
    pub fn pop(&mut self) -> Result<Word, ErrKind> {
        self.data.pop().ok_or(ErrKind::Fatal)
    }

    /// The word `depth` below the top, without popping.
    pub fn peek(&self, depth: usize) -> Result<Word, ErrKind> {
        if depth >= self.data.len() {
            return Err(ErrKind::Fatal);
        }
        Ok(self.data[self.data.len() - 1 - depth])
    }

    /// Drop every frame (failed evaluation, context teardown).
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Live words, bottom to top; these are GC roots.
    pub fn words(&self) -> &[Word] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_peek() {
        let mut k = KStack::new(4, 64);
        k.push(Word::small_int(1)).unwrap();
        k.push(Word::small_int(2)).unwrap();
        assert_eq!(k.sp(), 2);
        assert_eq!(k.peek(0).unwrap().as_small_int(), 2);
        assert_eq!(k.peek(1).unwrap().as_small_int(), 1);
        assert_eq!(k.pop().unwrap().as_small_int(), 2);
        assert_eq!(k.pop().unwrap().as_small_int(), 1);
        assert_eq!(k.pop().unwrap_err(), ErrKind::Fatal);
    }

    #[test]
    fn test_growth_tracks_high_water() {
        let mut k = KStack::new(2, 128);
        for i in 0..100 {
            k.push(Word::small_int(i)).unwrap();
        }
        assert_eq!(k.sp(), 100);
        assert_eq!(k.max_sp(), 100);
        for _ in 0..100 {
            k.pop().unwrap();
        }
        assert_eq!(k.sp(), 0);
        assert_eq!(k.max_sp(), 100);
    }

    #[test]
    fn test_cap_overflow() {
        let mut k = KStack::new(2, 8);
        for i in 0..8 {
            k.push(Word::small_int(i)).unwrap();
        }
        assert_eq!(
            k.push(Word::small_int(9)).unwrap_err(),
            ErrKind::StackOverflow
        );
    }

    #[test]
    fn test_push_frame_order() {
        let mut k = KStack::new(4, 64);
        k.push_frame(&[Word::small_int(1), Word::small_int(2), Word::small_uint(7)])
            .unwrap();
        // Tag on top, operands under it.
        assert_eq!(k.pop().unwrap().as_small_uint(), 7);
        assert_eq!(k.pop().unwrap().as_small_int(), 2);
        assert_eq!(k.pop().unwrap().as_small_int(), 1);
    }
}
