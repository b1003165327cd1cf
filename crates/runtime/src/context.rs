//! Evaluation contexts
//!
//! One context is one cooperative task: its program (remaining
//! top-level forms), the expression under evaluation, its
//! environment, result register, continuation stack, and mailbox.
//! Contexts move between the scheduler's ready, blocked, and
//! sleeping queues; a dead context is released at the next scheduler
//! tick, stack and mailbox included.

use std::collections::VecDeque;
use std::time::Instant;

use sprig_core::Word;

use crate::kstack::KStack;

/// Context id. Unique for the lifetime of a runtime.
pub type Cid = u32;

/// Scheduler-visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxState {
    Ready,
    Blocked,
    Sleeping,
    Dead,
}

/// Which evaluator phase the next step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Dispatch,
    ApplyCont,
}

/// Why a blocked context is waiting, and until when.
#[derive(Clone, Copy)]
pub enum BlockCond {
    /// Waiting for mail; wakes with the message in the result
    /// register.
    Recv { deadline: Option<Instant> },
    /// Waiting on an installed predicate over a context-supplied
    /// cookie; wakes with the cookie in the result register.
    Predicate {
        pred: fn(Word) -> bool,
        cookie: Word,
        deadline: Option<Instant>,
    },
}

/// One cooperative evaluation task.
pub struct Context {
    pub id: Cid,
    /// Top-level forms still to evaluate after the current one.
    pub program: Word,
    /// Expression register.
    pub exp: Word,
    /// Environment register.
    pub env: Word,
    /// Result register.
    pub result: Word,
    /// Continuation stack.
    pub k: KStack,
    pub mailbox: VecDeque<Word>,
    pub mailbox_cap: usize,
    pub state: CtxState,
    pub phase: Phase,
    pub wakeup: Option<Instant>,
    pub block: Option<BlockCond>,
    /// Set when the next step must collect before retrying.
    pub pending_gc: bool,
    /// Consecutive collections without recovering anything.
    pub gc_no_progress: u8,
}

impl Context {
    pub fn new(id: Cid, program: Word, exp: Word, k: KStack, mailbox_cap: usize) -> Self {
        Context {
            id,
            program,
            exp,
            env: Word::NIL,
            result: Word::NIL,
            k,
            mailbox: VecDeque::new(),
            mailbox_cap,
            state: CtxState::Ready,
            phase: Phase::Dispatch,
            wakeup: None,
            block: None,
            pending_gc: false,
            gc_no_progress: 0,
        }
    }

    /// Queue a message; false when the mailbox is full.
    pub fn deliver(&mut self, msg: Word) -> bool {
        if self.mailbox.len() >= self.mailbox_cap {
            return false;
        }
        self.mailbox.push_back(msg);
        true
    }

    /// Every word of this context the collector must treat as live.
    pub fn roots(&self) -> impl Iterator<Item = Word> + '_ {
        self.k
            .words()
            .iter()
            .copied()
            .chain([self.exp, self.env, self.result, self.program])
            .chain(self.mailbox.iter().copied())
    }
}
