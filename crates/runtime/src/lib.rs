//! Sprig runtime
//!
//! The evaluator half of the Sprig language: continuation stacks and
//! frames, the CPS evaluator, cooperative contexts and the scheduler
//! worker, primitive and extension operators, the reader and
//! printer, and image snapshots. Memory lives in `sprig-core`; a
//! [`Runtime`] owns one [`sprig_core::Store`] and passes it
//! explicitly to every entry point.

pub mod config;
pub mod context;
pub mod env;
pub mod eval;
pub mod ext;
pub mod frame;
pub mod image;
pub mod kstack;
pub mod print;
pub mod prims;
pub mod reader;
pub mod runtime;
pub mod sched;

pub use config::Config;
pub use context::{Cid, Context, CtxState};
pub use ext::ExtFn;
pub use image::{ImageError, boot, save};
pub use print::print_value;
pub use reader::{CharSource, ReadError, StrSource};
pub use runtime::{CtxInfo, DoneEvent, Runtime, RuntimeError};
pub use sched::{EvalState, WorkerHandle, launch};

// Re-export the core surface host programs need.
pub use sprig_core::{ErrKind, Raw, Store, SymbolTable, Word, sym};
