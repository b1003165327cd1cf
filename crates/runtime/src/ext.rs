//! Extension operators
//!
//! Host-registered operators the evaluator can apply like any other
//! function. The registry is a fixed-capacity array of slots; an
//! extension's symbol id encodes its slot index, so lookup by id is
//! constant time. Extensions may allocate from the store, but only
//! at a safe point (i.e. before returning).

use sprig_core::{ErrKind, Raw, Store, SymbolTable, Word, sym};

/// Shape of an extension: a contiguous argument vector in, one
/// result word out.
pub type ExtFn = fn(&mut Store, &mut SymbolTable, &[Word]) -> Result<Word, ErrKind>;

struct ExtSlot {
    name: String,
    f: ExtFn,
}

/// Fixed-capacity name → function registry.
pub struct ExtRegistry {
    slots: Vec<Option<ExtSlot>>,
}

impl ExtRegistry {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min((sym::EXT_END - sym::EXT_BASE) as usize);
        ExtRegistry {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Register an extension, reserving its symbol id. Re-registering
    /// a name replaces its function in place.
    pub fn register(
        &mut self,
        symbols: &mut SymbolTable,
        name: &str,
        f: ExtFn,
    ) -> Result<Word, ErrKind> {
        // Replace in place if the name is already registered.
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(existing) = slot
                && existing.name == name
            {
                existing.f = f;
                return Ok(Word::symbol(sym::EXT_BASE + i as Raw));
            }
        }
        let free = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ErrKind::Fatal)?;
        let id = sym::EXT_BASE + free as Raw;
        symbols.add_reserved(id, name)?;
        self.slots[free] = Some(ExtSlot {
            name: name.to_string(),
            f,
        });
        Ok(Word::symbol(id))
    }

    /// Constant-time lookup by symbol id.
    pub fn lookup(&self, id: Raw) -> Option<ExtFn> {
        if !sym::is_ext_id(id) {
            return None;
        }
        self.slots
            .get((id - sym::EXT_BASE) as usize)?
            .as_ref()
            .map(|s| s.f)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(_: &mut Store, _: &mut SymbolTable, args: &[Word]) -> Result<Word, ErrKind> {
        Ok(args.first().copied().unwrap_or(Word::NIL))
    }

    fn nothing(_: &mut Store, _: &mut SymbolTable, _: &[Word]) -> Result<Word, ErrKind> {
        Ok(Word::NIL)
    }

    #[test]
    fn test_register_and_lookup() {
        let mut reg = ExtRegistry::new(4);
        let mut syms = SymbolTable::new();
        let w = reg.register(&mut syms, "echo", echo).unwrap();
        assert!(sym::is_ext_id(w.sym_id()));
        assert!(reg.lookup(w.sym_id()).is_some());
        assert_eq!(syms.name_of(w.sym_id()), Some("echo"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_reregister_replaces() {
        let mut reg = ExtRegistry::new(4);
        let mut syms = SymbolTable::new();
        let a = reg.register(&mut syms, "op", echo).unwrap();
        let b = reg.register(&mut syms, "op", nothing).unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_capacity_exhausted() {
        let mut reg = ExtRegistry::new(1);
        let mut syms = SymbolTable::new();
        reg.register(&mut syms, "one", echo).unwrap();
        assert_eq!(
            reg.register(&mut syms, "two", echo).unwrap_err(),
            ErrKind::Fatal
        );
    }

    #[test]
    fn test_lookup_out_of_range() {
        let reg = ExtRegistry::new(4);
        assert!(reg.lookup(sym::PRIM_BASE).is_none());
        assert!(reg.lookup(sym::EXT_BASE + 99).is_none());
    }
}
