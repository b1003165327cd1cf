//! The runtime
//!
//! Groups the store, symbol registry, global environment, context
//! table, and scheduler queues into one value passed explicitly to
//! every entry point. The single worker thread owns the only mutable
//! borrow while running; auxiliary threads reach it through the
//! pause-and-resume discipline in [`crate::sched`].

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use sprig_core::{CoreError, ErrKind, GcReport, Raw, Store, StoreConfig, SymbolTable, Word};

use crate::config::Config;
use crate::context::{BlockCond, Cid, Context, CtxState};
use crate::env::GlobalEnv;
use crate::eval::{self, StepResult};
use crate::ext::{ExtFn, ExtRegistry};
use crate::frame::FrameKind;
use crate::kstack::KStack;
use crate::print;
use crate::prims;
use crate::reader::{self, ReadError, StrSource};

/// Extension registry capacity.
const EXTENSION_SLOTS: usize = 64;

/// Host-facing failures.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime error: {0}")]
    Eval(#[from] ErrKind),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error("worker did not reach a safe point in time")]
    PauseTimeout,
    #[error("worker is not paused")]
    NotPaused,
}

/// A finished context's terminal state.
#[derive(Debug, Clone)]
pub struct DoneEvent {
    pub cid: Cid,
    pub result: Word,
    pub printed: String,
}

/// Scheduler-facing context summary (the :ctxs listing).
#[derive(Debug, Clone)]
pub struct CtxInfo {
    pub cid: Cid,
    pub state: CtxState,
    pub sp: usize,
    pub max_sp: usize,
    pub result: String,
}

/// The whole interpreter state.
pub struct Runtime {
    pub store: Store,
    pub symbols: SymbolTable,
    pub globals: GlobalEnv,
    pub config: Config,
    pub(crate) ctxs: HashMap<Cid, Context>,
    pub(crate) ready: VecDeque<Cid>,
    pub(crate) blocked: Vec<Cid>,
    pub(crate) sleeping: Vec<Cid>,
    exts: ExtRegistry,
    next_cid: Cid,
    done: VecDeque<DoneEvent>,
    done_cb: Option<Box<dyn FnMut(&DoneEvent) + Send>>,
    /// Destructors for host objects behind custom handles, keyed by
    /// custom id; invoked when the sweep frees the handle cell.
    customs: HashMap<Raw, fn(Raw)>,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self, RuntimeError> {
        let mut store = Store::new(StoreConfig {
            heap_cells: config.heap_cells,
            gc_stack: config.gc_stack,
            mem_words: config.mem_words,
            const_words: config.const_words,
        });
        if config.defrag_pool_bytes > 0 {
            store.create_defrag_pool(config.defrag_pool_bytes)?;
        }
        let mut symbols = SymbolTable::new();
        prims::register(&mut symbols);
        Ok(Runtime {
            store,
            symbols,
            globals: GlobalEnv::new(),
            config,
            ctxs: HashMap::new(),
            ready: VecDeque::new(),
            blocked: Vec::new(),
            sleeping: Vec::new(),
            exts: ExtRegistry::new(EXTENSION_SLOTS),
            next_cid: 1,
            done: VecDeque::new(),
            done_cb: None,
            customs: HashMap::new(),
        })
    }

    // =========================================================================
    // Contexts
    // =========================================================================

    /// Start a context over a list of top-level forms.
    pub fn spawn_program(&mut self, program: Word) -> Result<Cid, ErrKind> {
        let (exp, rest) = if program.is_cons() {
            (self.store.car(program)?, self.store.cdr(program)?)
        } else {
            (Word::NIL, Word::NIL)
        };
        let cid = self.next_cid;
        self.next_cid += 1;
        let mut k = KStack::new(self.config.kstack_initial, self.config.kstack_cap);
        k.push(FrameKind::Done.word())?;
        let ctx = Context::new(cid, rest, exp, k, self.config.mailbox_cap);
        self.ctxs.insert(cid, ctx);
        self.ready.push_back(cid);
        debug!(cid, "context spawned");
        Ok(cid)
    }

    /// Parse source text and start a context over it.
    pub fn load_str(&mut self, src: &str) -> Result<Cid, RuntimeError> {
        let program = reader::read_program(
            &mut self.store,
            &mut self.symbols,
            &mut StrSource::new(src),
        )?;
        Ok(self.spawn_program(program)?)
    }

    /// Queue a message for a context. False if the target is missing,
    /// dead, or its mailbox is full.
    pub fn send(&mut self, cid: Cid, msg: Word) -> bool {
        match self.ctxs.get_mut(&cid) {
            Some(ctx) if ctx.state != CtxState::Dead => ctx.deliver(msg),
            _ => false,
        }
    }

    /// Kill a context: it runs no further steps, leaves every queue,
    /// and its stack and mailbox are released.
    pub fn kill(&mut self, cid: Cid) -> bool {
        self.ready.retain(|&c| c != cid);
        self.blocked.retain(|&c| c != cid);
        self.sleeping.retain(|&c| c != cid);
        match self.ctxs.remove(&cid) {
            Some(mut ctx) => {
                ctx.state = CtxState::Dead;
                ctx.k.clear();
                debug!(cid, "context killed");
                self.finish(ctx);
                true
            }
            None => false,
        }
    }

    fn finish(&mut self, ctx: Context) {
        let printed = print::print_value(&self.store, &self.symbols, ctx.result);
        debug!(cid = ctx.id, result = %printed, "context done");
        let ev = DoneEvent {
            cid: ctx.id,
            result: ctx.result,
            printed,
        };
        if let Some(cb) = &mut self.done_cb {
            cb(&ev);
        }
        self.done.push_back(ev);
        // The context drops here: stack and mailbox go with it.
    }

    /// Install the done callback (the shell's printer).
    pub fn set_done_callback(&mut self, cb: Box<dyn FnMut(&DoneEvent) + Send>) {
        self.done_cb = Some(cb);
    }

    /// Drain finished-context events.
    pub fn take_done_events(&mut self) -> Vec<DoneEvent> {
        self.done.drain(..).collect()
    }

    pub fn ctx_infos(&self) -> Vec<CtxInfo> {
        let mut infos: Vec<CtxInfo> = self
            .ctxs
            .values()
            .map(|ctx| CtxInfo {
                cid: ctx.id,
                state: ctx.state,
                sp: ctx.k.sp(),
                max_sp: ctx.k.max_sp(),
                result: print::print_value(&self.store, &self.symbols, ctx.result),
            })
            .collect();
        infos.sort_by_key(|i| i.cid);
        infos
    }

    pub fn has_contexts(&self) -> bool {
        !self.ctxs.is_empty()
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Move due sleepers to the ready queue.
    pub(crate) fn advance_sleepers(&mut self, now: Instant) {
        let mut still = Vec::new();
        for cid in std::mem::take(&mut self.sleeping) {
            let Some(ctx) = self.ctxs.get_mut(&cid) else {
                continue;
            };
            match ctx.wakeup {
                Some(at) if at <= now => {
                    ctx.wakeup = None;
                    ctx.state = CtxState::Ready;
                    self.ready.push_back(cid);
                }
                _ => still.push(cid),
            }
        }
        self.sleeping = still;
    }

    /// Evaluate every blocked context's wake condition; satisfied
    /// ones move to ready with the unblocking value in the result
    /// register, expired ones with the timeout error.
    pub(crate) fn poll_blocked(&mut self, now: Instant) {
        let mut still = Vec::new();
        for cid in std::mem::take(&mut self.blocked) {
            let Some(ctx) = self.ctxs.get_mut(&cid) else {
                continue;
            };
            let woke = match ctx.block {
                Some(BlockCond::Recv { deadline }) => {
                    if let Some(msg) = ctx.mailbox.pop_front() {
                        Some(msg)
                    } else if deadline.is_some_and(|d| d <= now) {
                        Some(ErrKind::Timeout.sym())
                    } else {
                        None
                    }
                }
                Some(BlockCond::Predicate {
                    pred,
                    cookie,
                    deadline,
                }) => {
                    if pred(cookie) {
                        Some(cookie)
                    } else if deadline.is_some_and(|d| d <= now) {
                        Some(ErrKind::Timeout.sym())
                    } else {
                        None
                    }
                }
                None => Some(Word::NIL),
            };
            match woke {
                Some(value) => {
                    ctx.result = value;
                    ctx.block = None;
                    ctx.state = CtxState::Ready;
                    self.ready.push_back(cid);
                }
                None => still.push(cid),
            }
        }
        self.blocked = still;
    }

    /// Pop the next live ready context id.
    pub(crate) fn next_ready(&mut self) -> Option<Cid> {
        while let Some(cid) = self.ready.pop_front() {
            if self.ctxs.contains_key(&cid) {
                return Some(cid);
            }
        }
        None
    }

    /// Earliest instant anything sleeping or timed-blocked wakes.
    pub(crate) fn nearest_wakeup(&self) -> Option<Instant> {
        let sleepers = self
            .sleeping
            .iter()
            .filter_map(|cid| self.ctxs.get(cid))
            .filter_map(|ctx| ctx.wakeup);
        let deadlines = self
            .blocked
            .iter()
            .filter_map(|cid| self.ctxs.get(cid))
            .filter_map(|ctx| match &ctx.block {
                Some(BlockCond::Recv { deadline }) => *deadline,
                Some(BlockCond::Predicate { deadline, .. }) => *deadline,
                None => None,
            });
        sleepers.chain(deadlines).min()
    }

    /// Run one quantum of a ready context.
    pub fn run_quantum(&mut self, cid: Cid) {
        let Some(mut ctx) = self.ctxs.remove(&cid) else {
            return;
        };
        for _ in 0..self.config.quantum {
            match eval::step(self, &mut ctx) {
                StepResult::Continue => {}
                StepResult::Finished => {
                    self.finish(ctx);
                    return;
                }
                StepResult::Yielded | StepResult::Blocked | StepResult::Sleeping => break,
            }
        }
        match ctx.state {
            CtxState::Dead => self.finish(ctx),
            CtxState::Blocked => {
                self.blocked.push(cid);
                self.ctxs.insert(cid, ctx);
            }
            CtxState::Sleeping => {
                self.sleeping.push(cid);
                self.ctxs.insert(cid, ctx);
            }
            CtxState::Ready => {
                self.ready.push_back(cid);
                self.ctxs.insert(cid, ctx);
            }
        }
    }

    /// Synchronous driver: rotate contexts until everything is done,
    /// deadlocked, or `max_quanta` is spent. Returns quanta run.
    pub fn run_until_idle(&mut self, max_quanta: usize) -> usize {
        let mut quanta = 0;
        while quanta < max_quanta {
            let now = Instant::now();
            self.advance_sleepers(now);
            self.poll_blocked(now);
            if let Some(cid) = self.next_ready() {
                self.run_quantum(cid);
                quanta += 1;
                continue;
            }
            match self.nearest_wakeup() {
                Some(at) => {
                    let now = Instant::now();
                    if at > now {
                        std::thread::sleep(at - now);
                    }
                }
                // Nothing ready, nothing to wake: idle or deadlocked.
                None => break,
            }
        }
        quanta
    }

    // =========================================================================
    // Collection
    // =========================================================================

    /// The full root set: the global environment array plus every
    /// context's continuation stack, registers, program, and mailbox.
    /// A context detached for the current quantum is passed in
    /// `extra`.
    pub(crate) fn gc_roots(&self, extra: Option<&Context>) -> Vec<Word> {
        let mut roots: Vec<Word> = Vec::with_capacity(64);
        roots.extend_from_slice(self.globals.slots());
        for ctx in self.ctxs.values() {
            roots.extend(ctx.roots());
        }
        if let Some(ctx) = extra {
            roots.extend(ctx.roots());
        }
        roots
    }

    /// Collect now. Only call at a GC-safe point.
    pub fn collect_now(&mut self, extra: Option<&Context>) -> GcReport {
        let roots = self.gc_roots(extra);
        let report = self.store.collect(roots);
        for &id in &report.freed_customs {
            if let Some(destructor) = self.customs.remove(&id) {
                destructor(id);
            }
        }
        for &id in &report.freed_channels {
            debug!(id, "channel handle collected");
        }
        report
    }

    // =========================================================================
    // Extensions
    // =========================================================================

    /// Register a named operator; returns its symbol.
    pub fn register_extension(&mut self, name: &str, f: ExtFn) -> Result<Word, ErrKind> {
        self.exts.register(&mut self.symbols, name, f)
    }

    pub(crate) fn call_extension(&mut self, id: Raw, argv: &[Word]) -> Result<Word, ErrKind> {
        let f = self.exts.lookup(id).ok_or(ErrKind::Unbound)?;
        f(&mut self.store, &mut self.symbols, argv)
    }

    /// Wrap a host object in a custom handle; `destructor` runs when
    /// the handle is collected.
    pub fn register_custom(&mut self, id: Raw, destructor: fn(Raw)) -> Result<Word, ErrKind> {
        let w = self.store.custom_value(id)?;
        self.customs.insert(id, destructor);
        Ok(w)
    }

    // =========================================================================
    // Host conveniences
    // =========================================================================

    /// Look up a global by name and print it.
    pub fn inspect(&mut self, name: &str) -> Option<String> {
        let id = self.symbols.lookup(name)?;
        let val = self
            .globals
            .lookup(&self.store, Word::symbol(id))
            .ok()
            .flatten()?;
        Some(print::print_value(&self.store, &self.symbols, val))
    }

    /// Drop every global binding of a name.
    pub fn undefine(&mut self, name: &str) -> bool {
        match self.symbols.lookup(name) {
            Some(id) => self
                .globals
                .undefine(&mut self.store, Word::symbol(id))
                .unwrap_or(false),
            None => false,
        }
    }

    /// Printed bindings of every global slot (the :env listing).
    pub fn global_bindings(&self) -> Vec<(usize, Vec<String>)> {
        let mut out = Vec::new();
        for (i, &slot) in self.globals.slots().iter().enumerate() {
            let mut entries = Vec::new();
            let mut curr = slot;
            while curr.is_cons() {
                let Ok(binding) = self.store.car(curr) else {
                    break;
                };
                entries.push(print::print_value(&self.store, &self.symbols, binding));
                let Ok(next) = self.store.cdr(curr) else {
                    break;
                };
                curr = next;
            }
            if !entries.is_empty() {
                out.push((i, entries));
            }
        }
        out
    }

    /// Look a symbol up in the local environment of every live
    /// context (the :inspect listing).
    pub fn inspect_locals(&self, name_id: Raw) -> Vec<(Cid, String)> {
        let key = Word::symbol(name_id);
        let mut out = Vec::new();
        for ctx in self.ctxs.values() {
            if let Ok(Some(v)) = crate::env::lookup_local(&self.store, ctx.env, key) {
                out.push((ctx.id, print::print_value(&self.store, &self.symbols, v)));
            }
        }
        out.sort_by_key(|&(cid, _)| cid);
        out
    }

    #[doc(hidden)]
    pub fn sym_word(&mut self, name: &str) -> Word {
        Word::symbol(self.symbols.intern(name))
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("contexts", &self.ctxs.len())
            .field("ready", &self.ready.len())
            .field("free_cells", &self.store.num_free_cells())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    static PRED_FLAG: AtomicBool = AtomicBool::new(false);

    fn flag_pred(_cookie: Word) -> bool {
        PRED_FLAG.load(Ordering::SeqCst)
    }

    #[test]
    fn test_predicate_block_and_wake() {
        let mut rt = Runtime::new(Config::default()).unwrap();
        let cid = rt.load_str("(recv)").unwrap();
        rt.run_until_idle(10);

        // Swap the recv condition for a host predicate with a cookie.
        PRED_FLAG.store(false, Ordering::SeqCst);
        rt.ctxs.get_mut(&cid).unwrap().block = Some(BlockCond::Predicate {
            pred: flag_pred,
            cookie: Word::small_int(7),
            deadline: None,
        });

        rt.poll_blocked(Instant::now());
        assert_eq!(rt.ctxs[&cid].state, CtxState::Blocked);

        // Satisfied predicate delivers the cookie and readies the
        // context.
        PRED_FLAG.store(true, Ordering::SeqCst);
        rt.run_until_idle(10);
        let done = rt.take_done_events();
        assert_eq!(done.iter().find(|e| e.cid == cid).unwrap().printed, "7");
    }

    #[test]
    fn test_predicate_timeout_forces_false() {
        let mut rt = Runtime::new(Config::default()).unwrap();
        let cid = rt.load_str("(recv)").unwrap();
        rt.run_until_idle(10);
        PRED_FLAG.store(false, Ordering::SeqCst);
        rt.ctxs.get_mut(&cid).unwrap().block = Some(BlockCond::Predicate {
            pred: flag_pred,
            cookie: Word::NIL,
            deadline: Some(Instant::now()),
        });
        rt.run_until_idle(10);
        let done = rt.take_done_events();
        assert_eq!(
            done.iter().find(|e| e.cid == cid).unwrap().printed,
            "timeout"
        );
    }

    static CUSTOM_DROPS: AtomicU32 = AtomicU32::new(0);

    fn count_drop(_id: Raw) {
        CUSTOM_DROPS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_custom_destructor_runs_on_collection() {
        let mut rt = Runtime::new(Config::default()).unwrap();
        CUSTOM_DROPS.store(0, Ordering::SeqCst);
        let handle = rt.register_custom(9, count_drop).unwrap();
        // Rooted through a global, the handle survives.
        let key = rt.sym_word("keeper");
        rt.globals.define(&mut rt.store, key, handle).unwrap();
        rt.collect_now(None);
        assert_eq!(CUSTOM_DROPS.load(Ordering::SeqCst), 0);
        // Unrooted, the destructor fires exactly once.
        rt.undefine("keeper");
        rt.collect_now(None);
        assert_eq!(CUSTOM_DROPS.load(Ordering::SeqCst), 1);
        rt.collect_now(None);
        assert_eq!(CUSTOM_DROPS.load(Ordering::SeqCst), 1);
    }
}
