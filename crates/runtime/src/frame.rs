//! Continuation frames
//!
//! A frame is a small-uint-tagged kind word on top of its operand
//! words in a fixed per-kind layout (operands pushed first, kind
//! last):
//!
//! ```text
//! done             [ tag ]
//! eval             [ tag ]
//! set-global       [ key, tag ]
//! progn-rest       [ rest, tag ]
//! function         [ head, tag ]
//! function-app     [ args, tag ]
//! arg-list         [ env, acc, rest, tag ]
//! bind-to-key-rest [ rest, env, key, tag ]
//! if               [ else, then, tag ]
//! ```
//!
//! The `let` form additionally parks its body word under the first
//! bind-to-key-rest frame; the final binding pops it.

use num_enum::TryFromPrimitive;
use sprig_core::{ErrKind, Word};

/// The closed set of continuation kinds.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum FrameKind {
    Done = 1,
    SetGlobal = 2,
    FunctionApp = 3,
    Function = 4,
    BindToKeyRest = 5,
    If = 6,
    ArgList = 7,
    Eval = 8,
    PrognRest = 9,
}

impl FrameKind {
    /// The kind as a small-uint stack word.
    #[inline]
    pub const fn word(self) -> Word {
        Word::small_uint(self as u32 as u64)
    }

    /// Decode a popped kind word.
    pub fn from_word(w: Word) -> Result<FrameKind, ErrKind> {
        if !w.is_small_uint() {
            return Err(ErrKind::Fatal);
        }
        FrameKind::try_from(w.as_small_uint() as u32).map_err(|_| ErrKind::Fatal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_word_roundtrip() {
        for kind in [
            FrameKind::Done,
            FrameKind::SetGlobal,
            FrameKind::FunctionApp,
            FrameKind::Function,
            FrameKind::BindToKeyRest,
            FrameKind::If,
            FrameKind::ArgList,
            FrameKind::Eval,
            FrameKind::PrognRest,
        ] {
            assert_eq!(FrameKind::from_word(kind.word()).unwrap(), kind);
        }
    }

    #[test]
    fn test_bad_kind_word() {
        assert!(FrameKind::from_word(Word::small_uint(0)).is_err());
        assert!(FrameKind::from_word(Word::small_uint(99)).is_err());
        assert!(FrameKind::from_word(Word::small_int(1)).is_err());
    }
}
