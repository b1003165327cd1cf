//! Primitive operators
//!
//! The built-in registry the evaluator consumes. Every primitive is
//! a function of a contiguous argument vector producing one result
//! word; scheduler-visible operators (send, recv, spawn, yield,
//! sleep, kill) additionally change the context's state and report
//! it through the step result.
//!
//! Operator symbols live in the reserved primitive id range, so
//! lookup is a match on the id and the head of an application never
//! needs an environment entry.

use std::time::{Duration, Instant};

use sprig_core::{ErrKind, Raw, SymbolTable, Word, sym};

use crate::context::{BlockCond, Context, CtxState};
use crate::eval::StepResult;
use crate::runtime::Runtime;

pub const PRIM_ADD: Raw = sym::PRIM_BASE;
pub const PRIM_SUB: Raw = sym::PRIM_BASE + 1;
pub const PRIM_MUL: Raw = sym::PRIM_BASE + 2;
pub const PRIM_DIV: Raw = sym::PRIM_BASE + 3;
pub const PRIM_NUM_EQ: Raw = sym::PRIM_BASE + 4;
pub const PRIM_LT: Raw = sym::PRIM_BASE + 5;
pub const PRIM_GT: Raw = sym::PRIM_BASE + 6;
pub const PRIM_CONS: Raw = sym::PRIM_BASE + 7;
pub const PRIM_CAR: Raw = sym::PRIM_BASE + 8;
pub const PRIM_CDR: Raw = sym::PRIM_BASE + 9;
pub const PRIM_LIST: Raw = sym::PRIM_BASE + 10;
pub const PRIM_EQ: Raw = sym::PRIM_BASE + 11;
pub const PRIM_NOT: Raw = sym::PRIM_BASE + 12;
pub const PRIM_SEND: Raw = sym::PRIM_BASE + 13;
pub const PRIM_RECV: Raw = sym::PRIM_BASE + 14;
pub const PRIM_SPAWN: Raw = sym::PRIM_BASE + 15;
pub const PRIM_YIELD: Raw = sym::PRIM_BASE + 16;
pub const PRIM_SLEEP: Raw = sym::PRIM_BASE + 17;
pub const PRIM_KILL: Raw = sym::PRIM_BASE + 18;
pub const PRIM_EVAL: Raw = sym::PRIM_BASE + 19;

const NAMES: &[(Raw, &str)] = &[
    (PRIM_ADD, "+"),
    (PRIM_SUB, "-"),
    (PRIM_MUL, "*"),
    (PRIM_DIV, "/"),
    (PRIM_NUM_EQ, "="),
    (PRIM_LT, "<"),
    (PRIM_GT, ">"),
    (PRIM_CONS, "cons"),
    (PRIM_CAR, "car"),
    (PRIM_CDR, "cdr"),
    (PRIM_LIST, "list"),
    (PRIM_EQ, "eq"),
    (PRIM_NOT, "not"),
    (PRIM_SEND, "send"),
    (PRIM_RECV, "recv"),
    (PRIM_SPAWN, "spawn"),
    (PRIM_YIELD, "yield"),
    (PRIM_SLEEP, "sleep"),
    (PRIM_KILL, "kill"),
    (PRIM_EVAL, "eval"),
];

/// Intern every operator name at its reserved id.
pub fn register(symbols: &mut SymbolTable) {
    for &(id, name) in NAMES {
        symbols
            .add_reserved(id, name)
            .expect("primitive ids are disjoint from builtins");
    }
}

#[inline]
fn bool_word(b: bool) -> Word {
    if b { Word::TRUE } else { Word::NIL }
}

/// Apply primitive `id` to `argv`. The context is detached from the
/// scheduler for the duration of the step.
pub(crate) fn apply(
    rt: &mut Runtime,
    ctx: &mut Context,
    id: Raw,
    argv: &[Word],
) -> Result<StepResult, ErrKind> {
    match id {
        PRIM_ADD | PRIM_SUB | PRIM_MUL | PRIM_DIV => {
            ctx.result = arith(rt, id, argv)?;
            Ok(StepResult::Continue)
        }
        PRIM_NUM_EQ | PRIM_LT | PRIM_GT => {
            ctx.result = compare(rt, id, argv)?;
            Ok(StepResult::Continue)
        }
        PRIM_CONS => {
            if argv.len() != 2 {
                return Err(ErrKind::Arity);
            }
            ctx.result = rt.store.cons(argv[0], argv[1])?;
            Ok(StepResult::Continue)
        }
        PRIM_CAR => {
            if argv.len() != 1 {
                return Err(ErrKind::Arity);
            }
            ctx.result = rt.store.car(argv[0])?;
            Ok(StepResult::Continue)
        }
        PRIM_CDR => {
            if argv.len() != 1 {
                return Err(ErrKind::Arity);
            }
            ctx.result = rt.store.cdr(argv[0])?;
            Ok(StepResult::Continue)
        }
        PRIM_LIST => {
            ctx.result = rt.store.list(argv)?;
            Ok(StepResult::Continue)
        }
        PRIM_EQ => {
            if argv.len() != 2 {
                return Err(ErrKind::Arity);
            }
            ctx.result = bool_word(rt.store.struct_eq(argv[0], argv[1]));
            Ok(StepResult::Continue)
        }
        PRIM_NOT => {
            if argv.len() != 1 {
                return Err(ErrKind::Arity);
            }
            ctx.result = bool_word(argv[0].is_nil());
            Ok(StepResult::Continue)
        }
        PRIM_SEND => {
            if argv.len() != 2 {
                return Err(ErrKind::Arity);
            }
            let cid = rt.store.to_i64(argv[0])? as u32;
            let delivered = if cid == ctx.id {
                ctx.deliver(argv[1])
            } else {
                rt.send(cid, argv[1])
            };
            ctx.result = bool_word(delivered);
            Ok(StepResult::Continue)
        }
        PRIM_RECV => {
            let deadline = match argv {
                [] => None,
                [ms] => Some(Instant::now() + Duration::from_millis(rt.store.to_i64(*ms)? as u64)),
                _ => return Err(ErrKind::Arity),
            };
            if let Some(msg) = ctx.mailbox.pop_front() {
                ctx.result = msg;
                Ok(StepResult::Continue)
            } else {
                ctx.block = Some(BlockCond::Recv { deadline });
                ctx.state = CtxState::Blocked;
                Ok(StepResult::Blocked)
            }
        }
        PRIM_SPAWN => {
            if argv.len() != 1 {
                return Err(ErrKind::Arity);
            }
            let program = rt.store.cons(argv[0], Word::NIL)?;
            let cid = rt.spawn_program(program)?;
            ctx.result = rt.store.int_value(cid as i64)?;
            Ok(StepResult::Continue)
        }
        PRIM_YIELD => {
            ctx.result = Word::TRUE;
            Ok(StepResult::Yielded)
        }
        PRIM_SLEEP => {
            if argv.len() != 1 {
                return Err(ErrKind::Arity);
            }
            let ms = rt.store.to_i64(argv[0])?;
            if ms < 0 {
                return Err(ErrKind::Type);
            }
            ctx.wakeup = Some(Instant::now() + Duration::from_millis(ms as u64));
            ctx.state = CtxState::Sleeping;
            ctx.result = Word::TRUE;
            Ok(StepResult::Sleeping)
        }
        PRIM_KILL => {
            if argv.len() != 1 {
                return Err(ErrKind::Arity);
            }
            let cid = rt.store.to_i64(argv[0])? as u32;
            if cid == ctx.id {
                return Ok(crate::eval::terminate(ctx, Word::NIL));
            }
            ctx.result = bool_word(rt.kill(cid));
            Ok(StepResult::Continue)
        }
        PRIM_EVAL => {
            if argv.len() != 1 {
                return Err(ErrKind::Arity);
            }
            // The eval frame re-enters dispatch on the result.
            ctx.k.push(crate::frame::FrameKind::Eval.word())?;
            ctx.result = argv[0];
            Ok(StepResult::Continue)
        }
        _ => Err(ErrKind::Eval),
    }
}

/// Numeric fold. Integers throughout unless any operand is a float.
fn arith(rt: &mut Runtime, id: Raw, argv: &[Word]) -> Result<Word, ErrKind> {
    if argv.is_empty() {
        return Err(ErrKind::Arity);
    }
    let any_float = argv
        .iter()
        .any(|w| w.tag() == sprig_core::Tag::BoxedFloat);
    if any_float {
        let mut acc = rt.store.to_f64(argv[0])?;
        if argv.len() == 1 && id == PRIM_SUB {
            acc = -acc;
        }
        for &w in &argv[1..] {
            let v = rt.store.to_f64(w)?;
            acc = match id {
                PRIM_ADD => acc + v,
                PRIM_SUB => acc - v,
                PRIM_MUL => acc * v,
                PRIM_DIV => {
                    if v == 0.0 {
                        return Err(ErrKind::Eval);
                    }
                    acc / v
                }
                _ => unreachable!("arith called with non-arith id"),
            };
        }
        return rt.store.float_value(acc);
    }
    let mut acc = rt.store.to_i64(argv[0])?;
    if argv.len() == 1 && id == PRIM_SUB {
        acc = -acc;
    }
    for &w in &argv[1..] {
        let v = rt.store.to_i64(w)?;
        acc = match id {
            PRIM_ADD => acc.wrapping_add(v),
            PRIM_SUB => acc.wrapping_sub(v),
            PRIM_MUL => acc.wrapping_mul(v),
            PRIM_DIV => {
                if v == 0 {
                    return Err(ErrKind::Eval);
                }
                acc / v
            }
            _ => unreachable!("arith called with non-arith id"),
        };
    }
    rt.store.int_value(acc)
}

/// Chained numeric comparison.
fn compare(rt: &Runtime, id: Raw, argv: &[Word]) -> Result<Word, ErrKind> {
    if argv.len() < 2 {
        return Err(ErrKind::Arity);
    }
    for pair in argv.windows(2) {
        let a = rt.store.to_f64(pair[0])?;
        let b = rt.store.to_f64(pair[1])?;
        let ok = match id {
            PRIM_NUM_EQ => a == b,
            PRIM_LT => a < b,
            PRIM_GT => a > b,
            _ => unreachable!("compare called with non-compare id"),
        };
        if !ok {
            return Ok(Word::NIL);
        }
    }
    Ok(Word::TRUE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_cover_ids() {
        let mut syms = SymbolTable::new();
        register(&mut syms);
        assert_eq!(syms.lookup("+"), Some(PRIM_ADD));
        assert_eq!(syms.lookup("recv"), Some(PRIM_RECV));
        assert_eq!(syms.name_of(PRIM_KILL), Some("kill"));
        // Registration is idempotent.
        register(&mut syms);
    }

    #[test]
    fn test_ids_in_prim_range() {
        for &(id, _) in NAMES {
            assert!(sym::is_prim_id(id), "{} outside primitive range", id);
        }
    }
}
