//! CPS evaluator
//!
//! A tight loop over one phase variable per context: `dispatch`
//! inspects the expression register and either resolves it or pushes
//! continuation frames for its parts; `apply-cont` pops the top
//! frame and consumes the result register. Each call to [`step`]
//! performs exactly one of the two.
//!
//! ## Out-of-memory recovery
//!
//! Any cell allocation inside a step can fail. The failing case
//! restores the continuation stack to its pre-step state, flags the
//! context so the next step collects first, and re-executes the same
//! step. Two consecutive collections that recover nothing terminate
//! the context with the gc-progress error.
//!
//! ## Tail positions
//!
//! The tails of `progn`, `if`, and `let` bodies, and closure bodies
//! themselves, never push a frame; self-tail-recursion runs in
//! constant stack.

use tracing::trace;

use sprig_core::{ErrKind, Word, sym};

use crate::context::{Context, CtxState, Phase};
use crate::env;
use crate::frame::FrameKind;
use crate::prims;
use crate::runtime::Runtime;

/// What one evaluator step did to the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// Keep stepping within the quantum.
    Continue,
    /// The context gave up the rest of its quantum.
    Yielded,
    /// The context installed a wake condition.
    Blocked,
    /// The context set a wakeup timestamp.
    Sleeping,
    /// The context is dead; release it.
    Finished,
}

/// Terminate the context with `result` in its result register. The
/// continuation stack is released unconditionally.
pub(crate) fn terminate(ctx: &mut Context, result: Word) -> StepResult {
    ctx.result = result;
    ctx.k.clear();
    ctx.state = CtxState::Dead;
    StepResult::Finished
}

/// Flag the context to collect and retry the current step.
pub(crate) fn oom_retry(ctx: &mut Context) {
    ctx.pending_gc = true;
}

/// Run one evaluator step for a detached context.
pub(crate) fn step(rt: &mut Runtime, ctx: &mut Context) -> StepResult {
    if ctx.pending_gc {
        // A second collection with no completed step in between
        // cannot help: the failing allocation is retrying against
        // the same fully-rooted heap.
        ctx.gc_no_progress += 1;
        if ctx.gc_no_progress >= 2 {
            return terminate(ctx, ErrKind::GcProgress.sym());
        }
        rt.collect_now(Some(ctx));
        ctx.pending_gc = false;
    }
    let out = match ctx.phase {
        Phase::Dispatch => dispatch(rt, ctx),
        Phase::ApplyCont => apply_cont(rt, ctx),
    };
    if !ctx.pending_gc {
        ctx.gc_no_progress = 0;
    }
    out
}

// =============================================================================
// Dispatch
// =============================================================================

fn dispatch(rt: &mut Runtime, ctx: &mut Context) -> StepResult {
    let exp = ctx.exp;
    trace!(cid = ctx.id, exp = ?exp, "dispatch");
    if exp.is_symbol() {
        let id = exp.sym_id();
        // Self-evaluating symbols: nil, t, errors, operator names.
        if id == sym::NIL
            || id == sym::TRUE
            || sym::is_error_id(id)
            || sym::is_prim_id(id)
            || sym::is_ext_id(id)
        {
            ctx.result = exp;
            ctx.phase = Phase::ApplyCont;
            return StepResult::Continue;
        }
        return match resolve(rt, ctx, exp) {
            Ok(Some(v)) => {
                ctx.result = v;
                ctx.phase = Phase::ApplyCont;
                StepResult::Continue
            }
            Ok(None) => terminate(ctx, ErrKind::Unbound.sym()),
            Err(e) => terminate(ctx, e.sym()),
        };
    }
    if !exp.is_cons() {
        // Every other value is self-evaluating.
        ctx.result = exp;
        ctx.phase = Phase::ApplyCont;
        return StepResult::Continue;
    }
    match dispatch_form(rt, ctx) {
        Ok(res) => res,
        Err(ErrKind::OutOfMemory) => {
            oom_retry(ctx);
            StepResult::Continue
        }
        Err(e) => terminate(ctx, e.sym()),
    }
}

fn resolve(rt: &Runtime, ctx: &Context, key: Word) -> Result<Option<Word>, ErrKind> {
    if let Some(v) = env::lookup_local(&rt.store, ctx.env, key)? {
        return Ok(Some(v));
    }
    rt.globals.lookup(&rt.store, key)
}

/// Dispatch a compound form. Allocations happen before any frame is
/// pushed or register written, so an out-of-memory unwinds cleanly
/// to a retry of the same expression.
fn dispatch_form(rt: &mut Runtime, ctx: &mut Context) -> Result<StepResult, ErrKind> {
    let exp = ctx.exp;
    let head = rt.store.car(exp)?;
    if head.is_symbol() {
        match head.sym_id() {
            sym::QUOTE => {
                ctx.result = rt.store.car(rt.store.cdr(exp)?)?;
                ctx.phase = Phase::ApplyCont;
                return Ok(StepResult::Continue);
            }
            sym::DEFINE => {
                let key = rt.store.car(rt.store.cdr(exp)?)?;
                let val_exp = rt.store.car(rt.store.cdr(rt.store.cdr(exp)?)?)?;
                if !key.is_symbol() || key.is_nil() {
                    return Err(ErrKind::Eval);
                }
                ctx.k.push_frame(&[key, FrameKind::SetGlobal.word()])?;
                ctx.exp = val_exp;
                return Ok(StepResult::Continue);
            }
            sym::PROGN => {
                let exps = rt.store.cdr(exp)?;
                if exps.is_nil() {
                    ctx.result = Word::NIL;
                    ctx.phase = Phase::ApplyCont;
                    return Ok(StepResult::Continue);
                }
                let rest = rt.store.cdr(exps)?;
                if !rest.is_nil() {
                    ctx.k.push_frame(&[rest, FrameKind::PrognRest.word()])?;
                }
                ctx.exp = rt.store.car(exps)?;
                return Ok(StepResult::Continue);
            }
            sym::LAMBDA => {
                let params = rt.store.car(rt.store.cdr(exp)?)?;
                let body = rt.store.car(rt.store.cdr(rt.store.cdr(exp)?)?)?;
                let closure =
                    rt.store
                        .list(&[Word::symbol(sym::CLOSURE), params, body, ctx.env])?;
                ctx.result = closure;
                ctx.phase = Phase::ApplyCont;
                return Ok(StepResult::Continue);
            }
            sym::IF => {
                let cond = rt.store.car(rt.store.cdr(exp)?)?;
                let tail = rt.store.cdr(rt.store.cdr(exp)?)?;
                let then_b = rt.store.car(tail)?;
                let else_tail = rt.store.cdr(tail)?;
                let else_b = if else_tail.is_cons() {
                    rt.store.car(else_tail)?
                } else {
                    Word::NIL
                };
                ctx.k
                    .push_frame(&[else_b, then_b, FrameKind::If.word()])?;
                ctx.exp = cond;
                return Ok(StepResult::Continue);
            }
            sym::LET => {
                let binds = rt.store.car(rt.store.cdr(exp)?)?;
                let body = rt.store.car(rt.store.cdr(rt.store.cdr(exp)?)?)?;
                if !binds.is_cons() {
                    ctx.exp = body;
                    return Ok(StepResult::Continue);
                }
                // Letrec-style: pre-bind every key to nil, then
                // evaluate value expressions left to right in the
                // populated environment.
                let mut new_env = ctx.env;
                let mut curr = binds;
                while curr.is_cons() {
                    let bind = rt.store.car(curr)?;
                    let key = rt.store.car(bind)?;
                    if !key.is_symbol() || key.is_nil() {
                        return Err(ErrKind::Eval);
                    }
                    let binding = rt.store.cons(key, Word::NIL)?;
                    new_env = rt.store.cons(binding, new_env)?;
                    curr = rt.store.cdr(curr)?;
                }
                let bind0 = rt.store.car(binds)?;
                let key0 = rt.store.car(bind0)?;
                let val0 = rt.store.car(rt.store.cdr(bind0)?)?;
                ctx.k.push_frame(&[
                    body,
                    rt.store.cdr(binds)?,
                    new_env,
                    key0,
                    FrameKind::BindToKeyRest.word(),
                ])?;
                ctx.exp = val0;
                ctx.env = new_env;
                return Ok(StepResult::Continue);
            }
            _ => {}
        }
    }
    application(rt, ctx, exp)?;
    Ok(StepResult::Continue)
}

/// General application: evaluate the operands left to right into a
/// reversed accumulator, then the head, then apply.
fn application(rt: &mut Runtime, ctx: &mut Context, exp: Word) -> Result<(), ErrKind> {
    let head = rt.store.car(exp)?;
    ctx.k.push_frame(&[head, FrameKind::Function.word()])?;
    let operands = rt.store.cdr(exp)?;
    if operands.is_nil() {
        // No operands folds into the general path with an empty
        // accumulator.
        ctx.result = Word::NIL;
        ctx.phase = Phase::ApplyCont;
    } else {
        ctx.k.push_frame(&[
            ctx.env,
            Word::NIL,
            rt.store.cdr(operands)?,
            FrameKind::ArgList.word(),
        ])?;
        ctx.exp = rt.store.car(operands)?;
    }
    Ok(())
}

// =============================================================================
// Apply continuation
// =============================================================================

fn apply_cont(rt: &mut Runtime, ctx: &mut Context) -> StepResult {
    // An error result reaching a continuation terminates the context
    // through the default handler.
    if ctx.result.is_error() {
        let err = ctx.result;
        return terminate(ctx, err);
    }
    let kind = match ctx.k.pop().and_then(FrameKind::from_word) {
        Ok(kind) => kind,
        Err(_) => return terminate(ctx, ErrKind::Fatal.sym()),
    };
    trace!(cid = ctx.id, ?kind, "apply-cont");
    match try_apply(rt, ctx, kind) {
        Ok(res) => res,
        Err(ErrKind::OutOfMemory) => {
            // The failing case already restored the stack.
            oom_retry(ctx);
            StepResult::Continue
        }
        Err(e) => terminate(ctx, e.sym()),
    }
}

fn try_apply(rt: &mut Runtime, ctx: &mut Context, kind: FrameKind) -> Result<StepResult, ErrKind> {
    match kind {
        FrameKind::Done => {
            if ctx.program.is_cons() {
                ctx.exp = rt.store.car(ctx.program)?;
                ctx.program = rt.store.cdr(ctx.program)?;
                ctx.env = Word::NIL;
                // Clear anything a failed form left behind.
                ctx.k.clear();
                ctx.k.push(FrameKind::Done.word())?;
                ctx.phase = Phase::Dispatch;
                Ok(StepResult::Continue)
            } else {
                ctx.state = CtxState::Dead;
                Ok(StepResult::Finished)
            }
        }
        FrameKind::Eval => {
            ctx.exp = ctx.result;
            ctx.phase = Phase::Dispatch;
            Ok(StepResult::Continue)
        }
        FrameKind::SetGlobal => {
            let key = ctx.k.pop()?;
            match rt.globals.define(&mut rt.store, key, ctx.result) {
                Ok(()) => {
                    ctx.result = key;
                    Ok(StepResult::Continue)
                }
                Err(ErrKind::OutOfMemory) => {
                    ctx.k.push_frame(&[key, FrameKind::SetGlobal.word()])?;
                    Err(ErrKind::OutOfMemory)
                }
                Err(e) => Err(e),
            }
        }
        FrameKind::PrognRest => {
            let rest = ctx.k.pop()?;
            ctx.exp = rt.store.car(rest)?;
            let tail = rt.store.cdr(rest)?;
            if tail.is_cons() {
                ctx.k.push_frame(&[tail, FrameKind::PrognRest.word()])?;
            }
            ctx.phase = Phase::Dispatch;
            Ok(StepResult::Continue)
        }
        FrameKind::If => {
            let then_b = ctx.k.pop()?;
            let else_b = ctx.k.pop()?;
            // Only the literal symbol t selects the then branch.
            ctx.exp = if ctx.result == Word::TRUE {
                then_b
            } else {
                else_b
            };
            ctx.phase = Phase::Dispatch;
            Ok(StepResult::Continue)
        }
        FrameKind::Function => {
            let head = ctx.k.pop()?;
            ctx.k
                .push_frame(&[ctx.result, FrameKind::FunctionApp.word()])?;
            if head.is_symbol()
                && (sym::is_prim_id(head.sym_id()) || sym::is_ext_id(head.sym_id()))
            {
                ctx.result = head;
            } else {
                ctx.exp = head;
                ctx.phase = Phase::Dispatch;
            }
            Ok(StepResult::Continue)
        }
        FrameKind::ArgList => {
            let rest = ctx.k.pop()?;
            let acc = ctx.k.pop()?;
            let env = ctx.k.pop()?;
            let acc2 = match rt.store.cons(ctx.result, acc) {
                Ok(acc2) => acc2,
                Err(e) => {
                    ctx.k
                        .push_frame(&[env, acc, rest, FrameKind::ArgList.word()])?;
                    return Err(e);
                }
            };
            if rest.is_nil() {
                ctx.result = acc2;
            } else {
                ctx.k.push_frame(&[
                    env,
                    acc2,
                    rt.store.cdr(rest)?,
                    FrameKind::ArgList.word(),
                ])?;
                ctx.env = env;
                ctx.exp = rt.store.car(rest)?;
                ctx.phase = Phase::Dispatch;
            }
            Ok(StepResult::Continue)
        }
        FrameKind::BindToKeyRest => {
            let key = ctx.k.pop()?;
            let env = ctx.k.pop()?;
            let rest = ctx.k.pop()?;
            env::modify_binding(&mut rt.store, env, key, ctx.result)?;
            if rest.is_cons() {
                let bind = rt.store.car(rest)?;
                let keyn = rt.store.car(bind)?;
                let valn = rt.store.car(rt.store.cdr(bind)?)?;
                ctx.k.push_frame(&[
                    rt.store.cdr(rest)?,
                    env,
                    keyn,
                    FrameKind::BindToKeyRest.word(),
                ])?;
                ctx.exp = valn;
            } else {
                // The body was parked under the first binding frame.
                ctx.exp = ctx.k.pop()?;
            }
            ctx.env = env;
            ctx.phase = Phase::Dispatch;
            Ok(StepResult::Continue)
        }
        FrameKind::FunctionApp => {
            let args = ctx.k.pop()?;
            apply_function(rt, ctx, args)
        }
    }
}

/// Apply the evaluated function in the result register to the
/// reversed argument accumulator.
fn apply_function(rt: &mut Runtime, ctx: &mut Context, args: Word) -> Result<StepResult, ErrKind> {
    let fun = ctx.result;

    // Restore the frame and retry after collection.
    macro_rules! restore_on_oom {
        ($expr:expr) => {
            match $expr {
                Ok(v) => v,
                Err(ErrKind::OutOfMemory) => {
                    ctx.k
                        .push_frame(&[args, FrameKind::FunctionApp.word()])?;
                    return Err(ErrKind::OutOfMemory);
                }
                Err(e) => return Err(e),
            }
        };
    }

    // Arguments were accumulated in reverse of evaluation order.
    let args_rev = if args.is_cons() {
        restore_on_oom!(rt.store.list_reverse(args))
    } else {
        args
    };

    if fun.is_cons() && rt.store.car(fun)? == Word::symbol(sym::CLOSURE) {
        let params = rt.store.car(rt.store.cdr(fun)?)?;
        let body = rt.store.car(rt.store.cdr(rt.store.cdr(fun)?)?)?;
        let clo_env = rt
            .store
            .car(rt.store.cdr(rt.store.cdr(rt.store.cdr(fun)?)?)?)?;
        if rt.store.list_len(params)? != rt.store.list_len(args_rev)? {
            return Err(ErrKind::Arity);
        }
        let mut new_env = clo_env;
        let mut p = params;
        let mut a = args_rev;
        while p.is_cons() {
            let key = rt.store.car(p)?;
            let val = rt.store.car(a)?;
            let binding = restore_on_oom!(rt.store.cons(key, val));
            new_env = restore_on_oom!(rt.store.cons(binding, new_env));
            p = rt.store.cdr(p)?;
            a = rt.store.cdr(a)?;
        }
        // Tail call: the application frames are already popped.
        ctx.exp = body;
        ctx.env = new_env;
        ctx.phase = Phase::Dispatch;
        return Ok(StepResult::Continue);
    }

    if fun.is_symbol() && sym::is_prim_id(fun.sym_id()) {
        // Primitives receive a contiguous argument vector.
        let mut argv = Vec::new();
        let mut a = args_rev;
        while a.is_cons() {
            argv.push(rt.store.car(a)?);
            a = rt.store.cdr(a)?;
        }
        return match prims::apply(rt, ctx, fun.sym_id(), &argv) {
            Ok(res) => Ok(res),
            Err(ErrKind::OutOfMemory) => {
                ctx.k
                    .push_frame(&[args, FrameKind::FunctionApp.word()])?;
                Err(ErrKind::OutOfMemory)
            }
            Err(e) => Err(e),
        };
    }

    if fun.is_symbol() && sym::is_ext_id(fun.sym_id()) {
        let mut argv = Vec::new();
        let mut a = args_rev;
        while a.is_cons() {
            argv.push(rt.store.car(a)?);
            a = rt.store.cdr(a)?;
        }
        let result = match rt.call_extension(fun.sym_id(), &argv) {
            Ok(v) => v,
            Err(ErrKind::OutOfMemory) => {
                ctx.k
                    .push_frame(&[args, FrameKind::FunctionApp.word()])?;
                return Err(ErrKind::OutOfMemory);
            }
            Err(e) => return Err(e),
        };
        ctx.result = result;
        return Ok(StepResult::Continue);
    }

    Err(ErrKind::Eval)
}
