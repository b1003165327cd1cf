//! Environments
//!
//! A local environment is an association list of `(symbol . value)`
//! binding pairs threaded ahead of the captured environment. The
//! global environment is a fixed array of slots hashed by symbol id;
//! each slot holds an association list searched linearly.
//!
//! Bindings restored from an image live in the constant heap and are
//! immutable; redefinition shadows them by prepending a fresh RAM
//! binding, which lookup finds first.

use sprig_core::{ErrKind, Store, Word};

/// Global environment slot count. Power of two; symbol ids hash by
/// masking.
pub const GLOBAL_ENV_ROOTS: usize = 32;

/// The global environment array.
pub struct GlobalEnv {
    slots: [Word; GLOBAL_ENV_ROOTS],
}

impl Default for GlobalEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalEnv {
    pub fn new() -> Self {
        GlobalEnv {
            slots: [Word::NIL; GLOBAL_ENV_ROOTS],
        }
    }

    #[inline]
    fn slot_of(key: Word) -> usize {
        (key.sym_id() as usize) & (GLOBAL_ENV_ROOTS - 1)
    }

    /// Look a symbol up in its slot.
    pub fn lookup(&self, store: &Store, key: Word) -> Result<Option<Word>, ErrKind> {
        let mut curr = self.slots[Self::slot_of(key)];
        while curr.is_cons() {
            let binding = store.car(curr)?;
            if store.car(binding)? == key {
                return Ok(Some(store.cdr(binding)?));
            }
            curr = store.cdr(curr)?;
        }
        Ok(None)
    }

    /// Bind or rebind a symbol. An existing mutable binding is
    /// updated in place; a constant one is shadowed by prepending.
    pub fn define(&mut self, store: &mut Store, key: Word, val: Word) -> Result<(), ErrKind> {
        let slot = Self::slot_of(key);
        let mut curr = self.slots[slot];
        while curr.is_cons() {
            let binding = store.car(curr)?;
            if store.car(binding)? == key {
                if !binding.is_const_ptr() {
                    return store.set_cdr(binding, val);
                }
                break;
            }
            curr = store.cdr(curr)?;
        }
        let binding = store.cons(key, val)?;
        self.slots[slot] = store.cons(binding, self.slots[slot])?;
        Ok(())
    }

    /// Remove every binding of a symbol from its slot. Returns true
    /// if anything was removed. The slot spine is rebuilt so constant
    /// tails can be dropped too.
    pub fn undefine(&mut self, store: &mut Store, key: Word) -> Result<bool, ErrKind> {
        let slot = Self::slot_of(key);
        let mut kept: Vec<Word> = Vec::new();
        let mut removed = false;
        let mut curr = self.slots[slot];
        while curr.is_cons() {
            let binding = store.car(curr)?;
            if store.car(binding)? == key {
                removed = true;
            } else {
                kept.push(binding);
            }
            curr = store.cdr(curr)?;
        }
        if removed {
            let mut rebuilt = Word::NIL;
            for &binding in kept.iter().rev() {
                rebuilt = store.cons(binding, rebuilt)?;
            }
            self.slots[slot] = rebuilt;
        }
        Ok(removed)
    }

    /// The slot words; every one is a GC root.
    pub fn slots(&self) -> &[Word; GLOBAL_ENV_ROOTS] {
        &self.slots
    }

    /// Raw slot access for image boot.
    pub fn slots_mut(&mut self) -> &mut [Word; GLOBAL_ENV_ROOTS] {
        &mut self.slots
    }
}

/// Look a symbol up in a local environment chain.
pub fn lookup_local(store: &Store, mut env: Word, key: Word) -> Result<Option<Word>, ErrKind> {
    while env.is_cons() {
        let binding = store.car(env)?;
        if binding.is_cons() && store.car(binding)? == key {
            return Ok(Some(store.cdr(binding)?));
        }
        env = store.cdr(env)?;
    }
    Ok(None)
}

/// Rebind a symbol already present in a local environment
/// (letrec-style second pass). The binding pair is mutated so every
/// closure capturing this environment sees the new value.
pub fn modify_binding(store: &mut Store, mut env: Word, key: Word, val: Word) -> Result<(), ErrKind> {
    while env.is_cons() {
        let binding = store.car(env)?;
        if binding.is_cons() && store.car(binding)? == key {
            return store.set_cdr(binding, val);
        }
        env = store.cdr(env)?;
    }
    Err(ErrKind::Unbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprig_core::{StoreConfig, SymbolTable};

    fn setup() -> (Store, SymbolTable, GlobalEnv) {
        (
            Store::new(StoreConfig {
                heap_cells: 256,
                gc_stack: 64,
                mem_words: 256,
                const_words: 256,
            }),
            SymbolTable::new(),
            GlobalEnv::new(),
        )
    }

    #[test]
    fn test_define_then_lookup() {
        let (mut store, mut syms, mut env) = setup();
        let key = Word::symbol(syms.intern("answer"));
        env.define(&mut store, key, Word::small_int(42)).unwrap();
        let got = env.lookup(&store, key).unwrap().unwrap();
        assert_eq!(got.as_small_int(), 42);
    }

    #[test]
    fn test_redefine_updates_in_place() {
        let (mut store, mut syms, mut env) = setup();
        let key = Word::symbol(syms.intern("x"));
        env.define(&mut store, key, Word::small_int(1)).unwrap();
        let cells_used = store.num_cells() - store.num_free_cells();
        env.define(&mut store, key, Word::small_int(2)).unwrap();
        // In-place update allocates nothing.
        assert_eq!(store.num_cells() - store.num_free_cells(), cells_used);
        assert_eq!(
            env.lookup(&store, key).unwrap().unwrap().as_small_int(),
            2
        );
    }

    #[test]
    fn test_slot_collision_keeps_both() {
        let (mut store, _, mut env) = setup();
        // Ids 1 and 33 hash to the same slot.
        let a = Word::symbol(sprig_core::sym::USER_BASE + 1);
        let b = Word::symbol(sprig_core::sym::USER_BASE + 1 + GLOBAL_ENV_ROOTS as sprig_core::Raw);
        env.define(&mut store, a, Word::small_int(10)).unwrap();
        env.define(&mut store, b, Word::small_int(20)).unwrap();
        assert_eq!(env.lookup(&store, a).unwrap().unwrap().as_small_int(), 10);
        assert_eq!(env.lookup(&store, b).unwrap().unwrap().as_small_int(), 20);
    }

    #[test]
    fn test_undefine() {
        let (mut store, mut syms, mut env) = setup();
        let key = Word::symbol(syms.intern("gone"));
        let other = Word::symbol(syms.intern("stays"));
        env.define(&mut store, key, Word::small_int(1)).unwrap();
        env.define(&mut store, other, Word::small_int(2)).unwrap();
        assert!(env.undefine(&mut store, key).unwrap());
        assert!(env.lookup(&store, key).unwrap().is_none());
        assert!(!env.undefine(&mut store, key).unwrap());
        assert_eq!(
            env.lookup(&store, other).unwrap().unwrap().as_small_int(),
            2
        );
    }

    #[test]
    fn test_local_env_shadows() {
        let (mut store, mut syms, _) = setup();
        let key = Word::symbol(syms.intern("n"));
        let outer_binding = store.cons(key, Word::small_int(1)).unwrap();
        let outer = store.cons(outer_binding, Word::NIL).unwrap();
        let inner_binding = store.cons(key, Word::small_int(2)).unwrap();
        let inner = store.cons(inner_binding, outer).unwrap();
        assert_eq!(
            lookup_local(&store, inner, key).unwrap().unwrap().as_small_int(),
            2
        );
        assert_eq!(
            lookup_local(&store, outer, key).unwrap().unwrap().as_small_int(),
            1
        );
    }

    #[test]
    fn test_modify_binding_shared_with_capture() {
        let (mut store, mut syms, _) = setup();
        let key = Word::symbol(syms.intern("f"));
        let binding = store.cons(key, Word::NIL).unwrap();
        let env = store.cons(binding, Word::NIL).unwrap();
        // A "closure" capturing env before the rebind.
        let captured = env;
        modify_binding(&mut store, env, key, Word::small_int(9)).unwrap();
        assert_eq!(
            lookup_local(&store, captured, key)
                .unwrap()
                .unwrap()
                .as_small_int(),
            9
        );
    }
}
