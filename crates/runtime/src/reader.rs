//! Reader
//!
//! Tokenizer and parser from a character source to heap values. The
//! source contract is push-back capable so the tokenizer can
//! overscan; `'X` expands to `(quote X)`; `(a . b)` builds dotted
//! pairs. Read failures are host-facing errors, never panics.

use thiserror::Error;

use sprig_core::{ErrKind, Store, SymbolTable, Word, sym};

/// The tokenizer-facing character stream.
pub trait CharSource {
    /// More characters remain.
    fn more(&self) -> bool;
    /// Look `k` characters ahead without consuming.
    fn peek(&self, k: usize) -> Option<char>;
    /// Consume one character.
    fn get(&mut self) -> Option<char>;
    /// Consume `k` characters.
    fn drop_n(&mut self, k: usize);
    /// Push one character back.
    fn put(&mut self, c: char);
}

/// An in-memory character source.
pub struct StrSource {
    chars: Vec<char>,
    pos: usize,
    pushback: Vec<char>,
}

impl StrSource {
    pub fn new(s: &str) -> Self {
        StrSource {
            chars: s.chars().collect(),
            pos: 0,
            pushback: Vec::new(),
        }
    }
}

impl CharSource for StrSource {
    fn more(&self) -> bool {
        !self.pushback.is_empty() || self.pos < self.chars.len()
    }

    fn peek(&self, k: usize) -> Option<char> {
        if k < self.pushback.len() {
            Some(self.pushback[self.pushback.len() - 1 - k])
        } else {
            self.chars.get(self.pos + k - self.pushback.len()).copied()
        }
    }

    fn get(&mut self) -> Option<char> {
        if let Some(c) = self.pushback.pop() {
            return Some(c);
        }
        let c = self.chars.get(self.pos).copied();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn drop_n(&mut self, k: usize) {
        for _ in 0..k {
            self.get();
        }
    }

    fn put(&mut self, c: char) {
        self.pushback.push(c);
    }
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected character '{0}'")]
    Unexpected(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("bad number '{0}'")]
    BadNumber(String),
    #[error("allocation failed while reading: {0}")]
    Alloc(#[from] ErrKind),
}

#[derive(Debug, PartialEq)]
enum Token {
    LParen,
    RParen,
    Quote,
    Dot,
    Int(i64),
    Float(f64),
    Sym(String),
    Str(String),
    Char(char),
    Eof,
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '\'' | ';' | '"')
}

fn skip_blank(src: &mut impl CharSource) {
    while let Some(c) = src.peek(0) {
        if c == ';' {
            while let Some(c) = src.get() {
                if c == '\n' {
                    break;
                }
            }
        } else if c.is_whitespace() {
            src.get();
        } else {
            break;
        }
    }
}

fn next_token(src: &mut impl CharSource) -> Result<Token, ReadError> {
    skip_blank(src);
    let Some(c) = src.get() else {
        return Ok(Token::Eof);
    };
    match c {
        '(' => Ok(Token::LParen),
        ')' => Ok(Token::RParen),
        '\'' => Ok(Token::Quote),
        '"' => {
            let mut s = String::new();
            loop {
                match src.get() {
                    Some('"') => return Ok(Token::Str(s)),
                    Some('\\') => match src.get() {
                        Some('n') => s.push('\n'),
                        Some('t') => s.push('\t'),
                        Some(esc) => s.push(esc),
                        None => return Err(ReadError::UnterminatedString),
                    },
                    Some(other) => s.push(other),
                    None => return Err(ReadError::UnterminatedString),
                }
            }
        }
        '#' if src.peek(0) == Some('\\') => {
            src.get();
            src.get().map(Token::Char).ok_or(ReadError::UnexpectedEof)
        }
        '.' if src.peek(0).is_none_or(is_delimiter) => Ok(Token::Dot),
        _ => {
            let mut word = String::from(c);
            while let Some(next) = src.peek(0) {
                if is_delimiter(next) {
                    break;
                }
                word.push(src.get().expect("peeked character is consumable"));
            }
            let starts_number = c.is_ascii_digit()
                || (c == '-' && word.len() > 1 && word[1..].starts_with(|d: char| d.is_ascii_digit()));
            if starts_number {
                if let Ok(v) = word.parse::<i64>() {
                    Ok(Token::Int(v))
                } else {
                    word.parse::<f64>()
                        .map(Token::Float)
                        .map_err(|_| ReadError::BadNumber(word))
                }
            } else {
                Ok(Token::Sym(word))
            }
        }
    }
}

/// Read one expression.
pub fn read_expr(
    store: &mut Store,
    symbols: &mut SymbolTable,
    src: &mut impl CharSource,
) -> Result<Word, ReadError> {
    let tok = next_token(src)?;
    parse(store, symbols, src, tok)
}

/// Read every top-level form into a program list.
pub fn read_program(
    store: &mut Store,
    symbols: &mut SymbolTable,
    src: &mut impl CharSource,
) -> Result<Word, ReadError> {
    let mut forms = Vec::new();
    loop {
        let tok = next_token(src)?;
        if tok == Token::Eof {
            break;
        }
        forms.push(parse(store, symbols, src, tok)?);
    }
    Ok(store.list(&forms)?)
}

fn parse(
    store: &mut Store,
    symbols: &mut SymbolTable,
    src: &mut impl CharSource,
    tok: Token,
) -> Result<Word, ReadError> {
    match tok {
        Token::LParen => parse_list(store, symbols, src),
        Token::Quote => {
            let quoted = read_expr(store, symbols, src)?;
            Ok(store.list(&[Word::symbol(sym::QUOTE), quoted])?)
        }
        Token::Int(v) => Ok(store.int_value(v)?),
        Token::Float(v) => Ok(store.float_value(v)?),
        Token::Sym(name) => Ok(Word::symbol(symbols.intern(&name))),
        Token::Str(s) => Ok(store.alloc_string(&s)?),
        Token::Char(c) => Ok(Word::ch(c)),
        Token::RParen => Err(ReadError::Unexpected(')')),
        Token::Dot => Err(ReadError::Unexpected('.')),
        Token::Eof => Err(ReadError::UnexpectedEof),
    }
}

fn parse_list(
    store: &mut Store,
    symbols: &mut SymbolTable,
    src: &mut impl CharSource,
) -> Result<Word, ReadError> {
    let mut items = Vec::new();
    let mut tail = Word::NIL;
    loop {
        let tok = next_token(src)?;
        match tok {
            Token::RParen => break,
            Token::Dot => {
                tail = read_expr(store, symbols, src)?;
                match next_token(src)? {
                    Token::RParen => break,
                    _ => return Err(ReadError::Unexpected('.')),
                }
            }
            Token::Eof => return Err(ReadError::UnexpectedEof),
            other => items.push(parse(store, symbols, src, other)?),
        }
    }
    let mut out = tail;
    for &item in items.iter().rev() {
        out = store.cons(item, out)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprig_core::StoreConfig;

    fn setup() -> (Store, SymbolTable) {
        (Store::new(StoreConfig::default()), SymbolTable::new())
    }

    fn read_one(store: &mut Store, symbols: &mut SymbolTable, s: &str) -> Word {
        read_expr(store, symbols, &mut StrSource::new(s)).unwrap()
    }

    #[test]
    fn test_source_pushback() {
        let mut src = StrSource::new("ab");
        assert_eq!(src.peek(0), Some('a'));
        assert_eq!(src.get(), Some('a'));
        src.put('x');
        assert_eq!(src.peek(0), Some('x'));
        assert_eq!(src.peek(1), Some('b'));
        assert_eq!(src.get(), Some('x'));
        assert_eq!(src.get(), Some('b'));
        assert!(!src.more());
    }

    #[test]
    fn test_atoms() {
        let (mut store, mut syms) = setup();
        assert_eq!(read_one(&mut store, &mut syms, "42").as_small_int(), 42);
        assert_eq!(read_one(&mut store, &mut syms, "-7").as_small_int(), -7);
        let s = read_one(&mut store, &mut syms, "foo");
        assert_eq!(s.sym_id(), syms.intern("foo"));
        let st = read_one(&mut store, &mut syms, "\"hi\\n\"");
        assert_eq!(store.string_value(st).unwrap(), "hi\n");
        assert_eq!(read_one(&mut store, &mut syms, "#\\z").as_char(), 'z');
    }

    #[test]
    fn test_lists_and_quote() {
        let (mut store, mut syms) = setup();
        let l = read_one(&mut store, &mut syms, "(+ 1 2)");
        assert_eq!(store.list_len(l).unwrap(), 3);
        assert_eq!(store.car(l).unwrap().sym_id(), syms.intern("+"));

        let q = read_one(&mut store, &mut syms, "'(1 2)");
        assert_eq!(store.car(q).unwrap().sym_id(), sym::QUOTE);

        let d = read_one(&mut store, &mut syms, "(1 . 2)");
        assert_eq!(store.cdr(d).unwrap().as_small_int(), 2);
    }

    #[test]
    fn test_float_literals() {
        let (mut store, mut syms) = setup();
        let f = read_one(&mut store, &mut syms, "1.5");
        assert_eq!(store.to_f64(f).unwrap(), 1.5);
        let n = read_one(&mut store, &mut syms, "-0.25");
        assert_eq!(store.to_f64(n).unwrap(), -0.25);
    }

    #[test]
    fn test_minus_is_a_symbol() {
        let (mut store, mut syms) = setup();
        let m = read_one(&mut store, &mut syms, "-");
        assert_eq!(m.sym_id(), syms.intern("-"));
    }

    #[test]
    fn test_comments_skipped() {
        let (mut store, mut syms) = setup();
        let l = read_one(&mut store, &mut syms, "; header\n(1 ; inline\n 2)");
        assert_eq!(store.list_len(l).unwrap(), 2);
    }

    #[test]
    fn test_program_of_forms() {
        let (mut store, mut syms) = setup();
        let p = read_program(
            &mut store,
            &mut syms,
            &mut StrSource::new("(define x 1) (+ x 2)"),
        )
        .unwrap();
        assert_eq!(store.list_len(p).unwrap(), 2);
    }

    #[test]
    fn test_errors() {
        let (mut store, mut syms) = setup();
        assert!(matches!(
            read_expr(&mut store, &mut syms, &mut StrSource::new(")")),
            Err(ReadError::Unexpected(')'))
        ));
        assert!(matches!(
            read_expr(&mut store, &mut syms, &mut StrSource::new("(1 2")),
            Err(ReadError::UnexpectedEof)
        ));
        assert!(matches!(
            read_expr(&mut store, &mut syms, &mut StrSource::new("\"open")),
            Err(ReadError::UnterminatedString)
        ));
    }
}
