//! Symbol registry
//!
//! Interns names to small integer ids and back. Built-in special
//! forms, type descriptors, and error kinds occupy fixed ids below
//! the user range; primitive operators and extensions reserve ids in
//! their own ranges as the runtime registers them. Names are owned
//! by the registry, so they are stable across collections.

use std::collections::HashMap;

use crate::error::ErrKind;
use crate::word::{Raw, sym};

/// Fixed names for the reserved id space.
const BUILTIN_NAMES: &[(Raw, &str)] = &[
    (sym::NIL, "nil"),
    (sym::TRUE, "t"),
    (sym::QUOTE, "quote"),
    (sym::DEFINE, "define"),
    (sym::PROGN, "progn"),
    (sym::LAMBDA, "lambda"),
    (sym::IF, "if"),
    (sym::LET, "let"),
    (sym::CLOSURE, "closure"),
    (sym::TYPE_BOXED_I, "boxed-i-type"),
    (sym::TYPE_BOXED_U, "boxed-u-type"),
    (sym::TYPE_BOXED_F, "boxed-f-type"),
    (sym::TYPE_ARRAY, "array-type"),
    (sym::TYPE_CHANNEL, "channel-type"),
    (sym::TYPE_CUSTOM, "custom-type"),
    (sym::TYPE_DEFRAG_ARRAY, "defrag-array-type"),
    (sym::FREE_CELL, "free-cell"),
];

const ERROR_KINDS: &[ErrKind] = &[
    ErrKind::Type,
    ErrKind::Eval,
    ErrKind::Arity,
    ErrKind::Unbound,
    ErrKind::OutOfMemory,
    ErrKind::GcProgress,
    ErrKind::StackOverflow,
    ErrKind::Timeout,
    ErrKind::Fatal,
];

/// The name ↔ id mapping.
pub struct SymbolTable {
    by_name: HashMap<String, Raw>,
    by_id: HashMap<Raw, String>,
    next_user: Raw,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut t = SymbolTable {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            next_user: sym::USER_BASE,
        };
        for &(id, name) in BUILTIN_NAMES {
            t.insert(id, name);
        }
        for &kind in ERROR_KINDS {
            t.insert(kind as u32 as Raw, kind.name());
        }
        t
    }

    fn insert(&mut self, id: Raw, name: &str) {
        self.by_name.insert(name.to_string(), id);
        self.by_id.insert(id, name.to_string());
    }

    /// Intern a name, allocating a fresh user id on first sight.
    pub fn intern(&mut self, name: &str) -> Raw {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.next_user;
        self.next_user += 1;
        self.insert(id, name);
        id
    }

    /// Look up an already-interned name without allocating an id.
    pub fn lookup(&self, name: &str) -> Option<Raw> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, id: Raw) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// Reserve a fixed id (primitive or extension range) for a name.
    /// Re-registering the same pair is idempotent.
    pub fn add_reserved(&mut self, id: Raw, name: &str) -> Result<(), ErrKind> {
        match self.by_id.get(&id) {
            Some(existing) if existing == name => Ok(()),
            Some(_) => Err(ErrKind::Fatal),
            None => {
                if self.by_name.contains_key(name) {
                    return Err(ErrKind::Fatal);
                }
                self.insert(id, name);
                Ok(())
            }
        }
    }

    /// Re-intern a symbol at a known id (image boot). The table must
    /// not have drifted past it.
    pub fn restore_user(&mut self, id: Raw, name: &str) -> Result<(), ErrKind> {
        if id < sym::USER_BASE {
            return Err(ErrKind::Fatal);
        }
        if let Some(existing) = self.by_id.get(&id) {
            return if existing == name {
                Ok(())
            } else {
                Err(ErrKind::Fatal)
            };
        }
        self.insert(id, name);
        self.next_user = self.next_user.max(id + 1);
        Ok(())
    }

    /// User-interned symbols in id order (for :symbols and images).
    pub fn user_symbols(&self) -> Vec<(Raw, &str)> {
        let mut out: Vec<(Raw, &str)> = self
            .by_id
            .iter()
            .filter(|&(&id, _)| id >= sym::USER_BASE)
            .map(|(&id, name)| (id, name.as_str()))
            .collect();
        out.sort_by_key(|&(id, _)| id);
        out
    }

    /// All names, for the :symbols listing.
    pub fn all_symbols(&self) -> Vec<(Raw, &str)> {
        let mut out: Vec<(Raw, &str)> = self
            .by_id
            .iter()
            .map(|(&id, name)| (id, name.as_str()))
            .collect();
        out.sort_by_key(|&(id, _)| id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_preinterned() {
        let mut t = SymbolTable::new();
        assert_eq!(t.intern("nil"), sym::NIL);
        assert_eq!(t.intern("lambda"), sym::LAMBDA);
        assert_eq!(t.intern("out-of-memory"), sym::ERR_OUT_OF_MEMORY);
        assert_eq!(t.name_of(sym::IF), Some("if"));
    }

    #[test]
    fn test_user_interning_stable() {
        let mut t = SymbolTable::new();
        let a = t.intern("foo");
        let b = t.intern("bar");
        assert!(a >= sym::USER_BASE);
        assert_ne!(a, b);
        assert_eq!(t.intern("foo"), a);
        assert_eq!(t.name_of(a), Some("foo"));
    }

    #[test]
    fn test_reserved_registration() {
        let mut t = SymbolTable::new();
        t.add_reserved(sym::PRIM_BASE, "+").unwrap();
        assert_eq!(t.intern("+"), sym::PRIM_BASE);
        // Idempotent re-registration.
        t.add_reserved(sym::PRIM_BASE, "+").unwrap();
        // Conflicting registration is refused.
        assert!(t.add_reserved(sym::PRIM_BASE, "-").is_err());
    }

    #[test]
    fn test_restore_user_keeps_ids() {
        let mut t = SymbolTable::new();
        t.restore_user(sym::USER_BASE + 5, "later").unwrap();
        t.restore_user(sym::USER_BASE, "early").unwrap();
        assert_eq!(t.intern("later"), sym::USER_BASE + 5);
        // Fresh interning continues after the highest restored id.
        let fresh = t.intern("fresh");
        assert_eq!(fresh, sym::USER_BASE + 6);
        assert!(t.restore_user(sym::USER_BASE, "conflict").is_err());
    }

    #[test]
    fn test_user_symbols_sorted() {
        let mut t = SymbolTable::new();
        t.intern("zz");
        t.intern("aa");
        let syms = t.user_symbols();
        assert_eq!(syms.len(), 2);
        assert!(syms[0].0 < syms[1].0);
        assert_eq!(syms[0].1, "zz");
    }
}
