//! Worker thread and host control surface
//!
//! A single worker thread drives the evaluator: it rotates ready
//! contexts a quantum at a time, advances sleepers, polls blocked
//! wake conditions, and otherwise parks until the nearest wakeup.
//!
//! Auxiliary host threads never touch the runtime directly. They
//! either enqueue host operations (send, kill, load) that the worker
//! drains between quanta, or take exclusive access under the
//! pause-and-resume discipline: request a pause, wait until the
//! worker reports the paused state, mutate through
//! [`WorkerHandle::with_paused_runtime`], then continue. The worker
//! reads the pause request only between quanta, so a paused runtime
//! is always at a GC-safe point.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use num_enum::TryFromPrimitive;
use tracing::{debug, warn};

use sprig_core::Word;

use crate::context::Cid;
use crate::ext::ExtFn;
use crate::runtime::{Runtime, RuntimeError};

/// Worker lifecycle, observable from any thread.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum EvalState {
    None = 0,
    Running = 1,
    Paused = 2,
    Dead = 3,
}

/// Operations auxiliary threads enqueue for the worker. Ops from one
/// sender drain in the order they were enqueued.
enum HostOp {
    Send(Cid, i64),
    Kill(Cid),
    Load(String),
}

struct Control {
    state: AtomicU8,
    pause_requested: AtomicBool,
    pause_gc: AtomicBool,
    kill: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
    ops: Mutex<VecDeque<HostOp>>,
}

impl Control {
    fn new() -> Self {
        Control {
            state: AtomicU8::new(EvalState::None as u8),
            pause_requested: AtomicBool::new(false),
            pause_gc: AtomicBool::new(false),
            kill: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            ops: Mutex::new(VecDeque::new()),
        }
    }

    fn state(&self) -> EvalState {
        EvalState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(EvalState::None)
    }

    fn set_state(&self, s: EvalState) {
        // Hold the lock across the store so waiters never miss the
        // transition.
        let _guard = self.lock.lock().expect("control lock poisoned");
        self.state.store(s as u8, Ordering::Release);
        self.cond.notify_all();
    }

    fn notify(&self) {
        let _guard = self.lock.lock().expect("control lock poisoned");
        self.cond.notify_all();
    }
}

/// Handle to a launched worker. Dropping without `shutdown` detaches
/// the thread.
pub struct WorkerHandle {
    rt: Arc<Mutex<Runtime>>,
    ctl: Arc<Control>,
    thread: Option<JoinHandle<()>>,
}

/// Move a runtime onto its worker thread.
pub fn launch(rt: Runtime) -> WorkerHandle {
    let rt = Arc::new(Mutex::new(rt));
    let ctl = Arc::new(Control::new());
    let thread = {
        let rt = Arc::clone(&rt);
        let ctl = Arc::clone(&ctl);
        std::thread::Builder::new()
            .name("sprig-worker".into())
            .spawn(move || worker_loop(&rt, &ctl))
            .expect("failed to spawn worker thread")
    };
    WorkerHandle {
        rt,
        ctl,
        thread: Some(thread),
    }
}

fn worker_loop(rt: &Mutex<Runtime>, ctl: &Control) {
    ctl.set_state(EvalState::Running);
    debug!("worker running");
    loop {
        if ctl.kill.load(Ordering::Acquire) {
            break;
        }
        if ctl.pause_requested.load(Ordering::Acquire) {
            if ctl.pause_gc.swap(false, Ordering::AcqRel) {
                let mut g = rt.lock().expect("runtime lock poisoned");
                let report = g.collect_now(None);
                debug!(recovered = report.recovered, "pause-requested collection");
            }
            ctl.set_state(EvalState::Paused);
            let mut guard = ctl.lock.lock().expect("control lock poisoned");
            while ctl.pause_requested.load(Ordering::Acquire) && !ctl.kill.load(Ordering::Acquire)
            {
                let (g, _) = ctl
                    .cond
                    .wait_timeout(guard, Duration::from_millis(50))
                    .expect("control wait poisoned");
                guard = g;
            }
            drop(guard);
            if ctl.kill.load(Ordering::Acquire) {
                break;
            }
            ctl.set_state(EvalState::Running);
            continue;
        }

        let mut g = rt.lock().expect("runtime lock poisoned");
        drain_ops(&mut g, ctl);
        let now = Instant::now();
        g.advance_sleepers(now);
        g.poll_blocked(now);
        if let Some(cid) = g.next_ready() {
            g.run_quantum(cid);
            continue;
        }
        let wake = g.nearest_wakeup();
        drop(g);

        // Nothing runnable: park until the nearest sleeper or a host
        // notification.
        let timeout = wake
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_millis(50));
        let guard = ctl.lock.lock().expect("control lock poisoned");
        let _ = ctl
            .cond
            .wait_timeout(guard, timeout.max(Duration::from_millis(1)))
            .expect("control wait poisoned");
    }
    ctl.set_state(EvalState::Dead);
    debug!("worker stopped");
}

fn drain_ops(rt: &mut Runtime, ctl: &Control) {
    let ops: Vec<HostOp> = {
        let mut q = ctl.ops.lock().expect("op queue poisoned");
        q.drain(..).collect()
    };
    for op in ops {
        match op {
            HostOp::Send(cid, v) => {
                if !rt.send(cid, Word::small_int(v)) {
                    warn!(cid, "host send failed");
                }
            }
            HostOp::Kill(cid) => {
                rt.kill(cid);
            }
            HostOp::Load(src) => {
                if let Err(e) = rt.load_str(&src) {
                    warn!(error = %e, "host load failed");
                }
            }
        }
    }
}

impl WorkerHandle {
    pub fn state(&self) -> EvalState {
        self.ctl.state()
    }

    /// Ask the worker to pause at its next safe point and wait for
    /// it. On timeout the request is withdrawn.
    pub fn pause(&self, timeout: Duration) -> Result<(), RuntimeError> {
        self.pause_inner(timeout, false)
    }

    /// Pause and collect on the way into the safe point.
    pub fn pause_with_gc(&self, timeout: Duration) -> Result<(), RuntimeError> {
        self.pause_inner(timeout, true)
    }

    fn pause_inner(&self, timeout: Duration, gc: bool) -> Result<(), RuntimeError> {
        if gc {
            self.ctl.pause_gc.store(true, Ordering::Release);
        }
        self.ctl.pause_requested.store(true, Ordering::Release);
        self.ctl.notify();
        let deadline = Instant::now() + timeout;
        let mut guard = self.ctl.lock.lock().expect("control lock poisoned");
        loop {
            match self.ctl.state() {
                EvalState::Paused | EvalState::Dead => return Ok(()),
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                self.ctl.pause_requested.store(false, Ordering::Release);
                self.ctl.pause_gc.store(false, Ordering::Release);
                return Err(RuntimeError::PauseTimeout);
            }
            let (g, _) = self
                .ctl
                .cond
                .wait_timeout(guard, deadline - now)
                .expect("control wait poisoned");
            guard = g;
        }
    }

    /// Resume after a pause.
    pub fn continue_eval(&self) {
        self.ctl.pause_requested.store(false, Ordering::Release);
        self.ctl.notify();
    }

    /// Exclusive access to the runtime. Legal only while paused (or
    /// after the worker died); the worker is parked off the lock.
    pub fn with_paused_runtime<R>(
        &self,
        f: impl FnOnce(&mut Runtime) -> R,
    ) -> Result<R, RuntimeError> {
        match self.ctl.state() {
            EvalState::Paused | EvalState::Dead => {}
            _ => return Err(RuntimeError::NotPaused),
        }
        let mut g = self.rt.lock().expect("runtime lock poisoned");
        Ok(f(&mut g))
    }

    /// Enqueue a message for a context (drained between quanta).
    pub fn send(&self, cid: Cid, value: i64) {
        self.ctl
            .ops
            .lock()
            .expect("op queue poisoned")
            .push_back(HostOp::Send(cid, value));
        self.ctl.notify();
    }

    /// Enqueue a kill.
    pub fn kill_ctx(&self, cid: Cid) {
        self.ctl
            .ops
            .lock()
            .expect("op queue poisoned")
            .push_back(HostOp::Kill(cid));
        self.ctl.notify();
    }

    /// Enqueue source text to load and run.
    pub fn load(&self, src: String) {
        self.ctl
            .ops
            .lock()
            .expect("op queue poisoned")
            .push_back(HostOp::Load(src));
        self.ctl.notify();
    }

    /// Register a named operator from an auxiliary thread. Takes the
    /// pause-and-resume path for exclusive access.
    pub fn register_extension(&self, name: &str, f: ExtFn) -> Result<(), RuntimeError> {
        self.pause(Duration::from_millis(2500))?;
        let registered = self.with_paused_runtime(|rt| rt.register_extension(name, f));
        self.continue_eval();
        registered?.map(|_| ()).map_err(RuntimeError::Eval)
    }

    /// Stop the worker and join it.
    pub fn shutdown(mut self) {
        self.ctl.kill.store(true, Ordering::Release);
        self.ctl.notify();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn launch_default() -> WorkerHandle {
        launch(Runtime::new(Config::default()).unwrap())
    }

    /// Pause, observe, continue. Retries until `f` yields Some.
    fn poll_until<R>(h: &WorkerHandle, mut f: impl FnMut(&mut Runtime) -> Option<R>) -> R {
        for _ in 0..200 {
            h.pause(Duration::from_secs(1)).unwrap();
            let got = h.with_paused_runtime(&mut f).unwrap();
            h.continue_eval();
            if let Some(r) = got {
                return r;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("worker never produced the expected state");
    }

    #[test]
    fn test_pause_continue_load() {
        let h = launch_default();
        h.pause(Duration::from_secs(1)).unwrap();
        assert_eq!(h.state(), EvalState::Paused);
        h.with_paused_runtime(|rt| rt.load_str("(+ 40 2)").unwrap())
            .unwrap();
        h.continue_eval();

        let printed = poll_until(&h, |rt| {
            rt.take_done_events().pop().map(|ev| ev.printed)
        });
        assert_eq!(printed, "42");
        h.shutdown();
    }

    #[test]
    fn test_with_runtime_requires_pause() {
        let h = launch_default();
        // Wait for the worker to come up.
        for _ in 0..100 {
            if h.state() == EvalState::Running {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(
            h.with_paused_runtime(|_| ()),
            Err(RuntimeError::NotPaused)
        ));
        h.shutdown();
    }

    #[test]
    fn test_host_send_unblocks_recv() {
        let h = launch_default();
        h.pause(Duration::from_secs(1)).unwrap();
        let cid = h
            .with_paused_runtime(|rt| rt.load_str("(recv)").unwrap())
            .unwrap();
        h.continue_eval();

        h.send(cid, 42);
        let printed = poll_until(&h, |rt| {
            rt.take_done_events()
                .into_iter()
                .find(|ev| ev.cid == cid)
                .map(|ev| ev.printed)
        });
        assert_eq!(printed, "42");
        h.shutdown();
    }

    #[test]
    fn test_host_kill() {
        let h = launch_default();
        h.pause(Duration::from_secs(1)).unwrap();
        // A context that blocks forever.
        let cid = h
            .with_paused_runtime(|rt| rt.load_str("(recv)").unwrap())
            .unwrap();
        h.continue_eval();

        h.kill_ctx(cid);
        poll_until(&h, |rt| {
            if rt.has_contexts() { None } else { Some(()) }
        });
        h.shutdown();
    }

    #[test]
    fn test_register_extension_from_host() {
        let h = launch_default();
        h.register_extension("triple", |store, _symbols, args| {
            let v = store.to_i64(args[0])?;
            store.int_value(v * 3)
        })
        .unwrap();
        h.pause(Duration::from_secs(1)).unwrap();
        h.with_paused_runtime(|rt| rt.load_str("(triple 14)").unwrap())
            .unwrap();
        h.continue_eval();
        let printed = poll_until(&h, |rt| {
            rt.take_done_events().pop().map(|ev| ev.printed)
        });
        assert_eq!(printed, "42");
        h.shutdown();
    }

    #[test]
    fn test_shutdown_reports_dead() {
        let h = launch_default();
        let ctl = Arc::clone(&h.ctl);
        h.shutdown();
        assert_eq!(ctl.state(), EvalState::Dead);
    }

    #[test]
    fn test_pause_with_gc_runs_collection() {
        let h = launch_default();
        let before = {
            h.pause(Duration::from_secs(1)).unwrap();
            let n = h
                .with_paused_runtime(|rt| rt.store.heap_stats().gc_count)
                .unwrap();
            h.continue_eval();
            n
        };
        h.pause_with_gc(Duration::from_secs(1)).unwrap();
        let after = h
            .with_paused_runtime(|rt| rt.store.heap_stats().gc_count)
            .unwrap();
        h.continue_eval();
        assert!(after > before);
        h.shutdown();
    }
}
