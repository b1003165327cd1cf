//! Value printer
//!
//! Renders a word for the done callback and the shell: symbolic
//! names for symbols (errors print their error name), decimal for
//! numbers, `(a b . c)` notation for lists, quoted strings for byte
//! arrays. Depth is bounded so cyclic structures print instead of
//! hanging.

use sprig_core::{Store, SymbolTable, Tag, Word};

const MAX_DEPTH: usize = 64;

/// Render one value.
pub fn print_value(store: &Store, symbols: &SymbolTable, w: Word) -> String {
    let mut out = String::new();
    print_into(&mut out, store, symbols, w, MAX_DEPTH);
    out
}

fn print_into(out: &mut String, store: &Store, symbols: &SymbolTable, w: Word, depth: usize) {
    if depth == 0 {
        out.push_str("...");
        return;
    }
    match w.tag() {
        Tag::Symbol => match symbols.name_of(w.sym_id()) {
            Some(name) => out.push_str(name),
            None => out.push_str(&format!("sym<{}>", w.sym_id())),
        },
        Tag::SmallInt => out.push_str(&w.as_small_int().to_string()),
        Tag::SmallUint => out.push_str(&w.as_small_uint().to_string()),
        Tag::Char => out.push_str(&format!("#\\{}", w.as_char())),
        Tag::BoxedInt | Tag::BoxedUint => match store.to_i64(w) {
            Ok(v) => out.push_str(&v.to_string()),
            Err(_) => out.push_str("<bad-box>"),
        },
        Tag::BoxedFloat => match store.to_f64(w) {
            Ok(v) => out.push_str(&format!("{v:?}")),
            Err(_) => out.push_str("<bad-box>"),
        },
        Tag::Array | Tag::DefragArray => match store.string_value(w) {
            Ok(s) => out.push_str(&format!("{s:?}")),
            Err(_) => out.push_str("<bad-array>"),
        },
        Tag::Channel => match store.channel_id(w) {
            Ok(id) => out.push_str(&format!("<channel {id}>")),
            Err(_) => out.push_str("<channel ?>"),
        },
        Tag::Custom => out.push_str("<custom>"),
        Tag::Cons => print_list(out, store, symbols, w, depth),
    }
}

fn print_list(out: &mut String, store: &Store, symbols: &SymbolTable, w: Word, depth: usize) {
    out.push('(');
    let mut curr = w;
    let mut first = true;
    let mut remaining = 256usize;
    while curr.is_cons() {
        if remaining == 0 {
            out.push_str(" ...");
            break;
        }
        remaining -= 1;
        let (Ok(car), Ok(cdr)) = (store.car(curr), store.cdr(curr)) else {
            out.push_str("<bad-cell>");
            break;
        };
        if !first {
            out.push(' ');
        }
        first = false;
        print_into(out, store, symbols, car, depth - 1);
        if !cdr.is_cons() && !cdr.is_nil() {
            out.push_str(" . ");
            print_into(out, store, symbols, cdr, depth - 1);
            break;
        }
        curr = cdr;
    }
    out.push(')');
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprig_core::{ErrKind, StoreConfig};

    fn setup() -> (Store, SymbolTable) {
        (Store::new(StoreConfig::default()), SymbolTable::new())
    }

    #[test]
    fn test_atoms() {
        let (mut store, mut syms) = setup();
        assert_eq!(print_value(&store, &syms, Word::small_int(-3)), "-3");
        assert_eq!(print_value(&store, &syms, Word::NIL), "nil");
        assert_eq!(print_value(&store, &syms, Word::TRUE), "t");
        let f = store.float_value(1.5).unwrap();
        assert_eq!(print_value(&store, &syms, f), "1.5");
        let s = Word::symbol(syms.intern("hello"));
        assert_eq!(print_value(&store, &syms, s), "hello");
    }

    #[test]
    fn test_error_symbols_print_names() {
        let (store, syms) = setup();
        assert_eq!(
            print_value(&store, &syms, ErrKind::OutOfMemory.sym()),
            "out-of-memory"
        );
        assert_eq!(
            print_value(&store, &syms, ErrKind::Arity.sym()),
            "arity-error"
        );
    }

    #[test]
    fn test_lists() {
        let (mut store, syms) = setup();
        let l = store
            .list(&[Word::small_int(1), Word::small_int(2), Word::small_int(3)])
            .unwrap();
        assert_eq!(print_value(&store, &syms, l), "(1 2 3)");
        let pair = store.cons(Word::small_int(1), Word::small_int(2)).unwrap();
        assert_eq!(print_value(&store, &syms, pair), "(1 . 2)");
    }

    #[test]
    fn test_string_and_cycle() {
        let (mut store, syms) = setup();
        let s = store.alloc_string("hi").unwrap();
        assert_eq!(print_value(&store, &syms, s), "\"hi\"");
        let a = store.cons(Word::small_int(1), Word::NIL).unwrap();
        store.set_cdr(a, a).unwrap();
        // Cyclic list terminates with an ellipsis.
        assert!(print_value(&store, &syms, a).contains("..."));
    }
}
