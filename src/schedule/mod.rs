//! Cooperative scheduler shared by every logical core of the machine.
//!
//! Each registered [`Worker`] runs on its own OS thread, but only the thread
//! holding the *baton* executes. A worker gives the baton away only inside
//! [`Scheduler::wait`], so between two suspension points exactly one logical
//! core touches shared state, the same discipline the hardware relies on.
//!
//! # Architecture
//!
//! ```text
//!   Scheduler::run()                       worker threads
//!   ────────────────                       ──────────────
//!   baton = first live ──────────────►  [0] run() ... wait(p) ─┐
//!                                                               │ handoff
//!                                       [1] run() ... wait(q) ◄─┘
//!                                              │ handoff
//!                                       [2] finished ──► skip
//!                                              │
//!   ◄──── quiescent: every live worker re-checked its predicate
//!         once without progress, or all finished
//! ```
//!
//! Predicates are polled: a blocked worker re-evaluates its predicate every
//! time the baton comes back around. The order in which workers are offered
//! the baton is round-robin by registration index and nothing stronger is
//! promised.
//!
//! `run()` returns at quiescence. Workers still parked in `wait()` keep their
//! place and are resumed by the next `run()`.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use tensix_emu::schedule::{Scheduler, Worker};
//! use tensix_emu::Result;
//!
//! #[derive(Debug)]
//! struct Bump(Arc<Scheduler>, Arc<AtomicU32>);
//!
//! impl Worker for Bump {
//!     fn run(&self) -> Result<()> {
//!         self.1.fetch_add(1, Ordering::AcqRel);
//!         let counter = self.1.clone();
//!         self.0.wait(move || counter.load(Ordering::Acquire) >= 2)
//!     }
//! }
//!
//! let sched = Arc::new(Scheduler::new());
//! let counter = Arc::new(AtomicU32::new(0));
//! sched.add_worker(Arc::new(Bump(sched.clone(), counter.clone())));
//! sched.add_worker(Arc::new(Bump(sched.clone(), counter.clone())));
//! sched.run().unwrap();
//! assert_eq!(counter.load(Ordering::Acquire), 2);
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use crate::error::{EmuError, Result};

/// A logical core driven by the [`Scheduler`].
pub trait Worker: Send + Sync + fmt::Debug {
    /// Body of the worker. Runs once; returning finishes the worker.
    fn run(&self) -> Result<()>;

    /// Called each time the worker regains the baton, including the first
    /// time it starts.
    fn on_resume(&self) {}
}

/// Lifecycle of one scheduled worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Registered, thread not yet holding the baton.
    NotStarted,
    /// Holding the baton.
    Running,
    /// Parked in `wait()` on a false predicate.
    Blocked,
    /// `run()` returned or panicked.
    Finished,
}

struct Task {
    worker: Arc<dyn Worker>,
    state: TaskState,
    spawned: bool,
}

struct SchedState {
    tasks: Vec<Task>,
    /// Index of the task allowed to execute.
    baton: Option<usize>,
    /// True between the start of `run()` and quiescence.
    active: bool,
    /// Consecutive predicate checks that made no progress.
    stalled: usize,
    error: Option<EmuError>,
    threads: HashMap<ThreadId, usize>,
}

impl SchedState {
    fn live(&self) -> usize {
        self.tasks.iter().filter(|t| t.state != TaskState::Finished).count()
    }

    fn next_live(&self, from: usize) -> Option<usize> {
        let n = self.tasks.len();
        (1..=n).map(|k| (from + k) % n).find(|&j| self.tasks[j].state != TaskState::Finished)
    }
}

/// Baton-passing cooperative scheduler.
pub struct Scheduler {
    state: Mutex<SchedState>,
    cond: Condvar,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SchedState {
                tasks: Vec::new(),
                baton: None,
                active: false,
                stalled: 0,
                error: None,
                threads: HashMap::new(),
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedState> {
        // Worker panics are caught before they can poison the lock while held,
        // so recovering the guard is always sound here.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn park<'a>(&self, mut st: MutexGuard<'a, SchedState>, idx: usize) -> MutexGuard<'a, SchedState> {
        while st.baton != Some(idx) {
            st = self.cond.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        st
    }

    /// Register a worker. It starts at the next [`run`](Self::run).
    pub fn add_worker(&self, worker: Arc<dyn Worker>) -> usize {
        let mut st = self.lock();
        st.tasks.push(Task { worker, state: TaskState::NotStarted, spawned: false });
        st.tasks.len() - 1
    }

    /// Number of registered workers.
    pub fn num_workers(&self) -> usize {
        self.lock().tasks.len()
    }

    /// State of worker `idx`, if registered.
    pub fn task_state(&self, idx: usize) -> Option<TaskState> {
        self.lock().tasks.get(idx).map(|t| t.state)
    }

    /// Run workers until quiescence and return the first worker error.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        let mut st = self.lock();
        if st.active {
            return Err(EmuError::invariant("scheduler is already running"));
        }

        for idx in 0..st.tasks.len() {
            if st.tasks[idx].spawned || st.tasks[idx].state == TaskState::Finished {
                continue;
            }
            let sched = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("worker-{}", idx))
                .spawn(move || sched.task_main(idx))
                .map_err(|e| EmuError::invariant(format!("cannot spawn worker thread: {}", e)))?;
            st.threads.insert(handle.thread().id(), idx);
            st.tasks[idx].spawned = true;
        }

        let first = match st.tasks.iter().position(|t| t.state != TaskState::Finished) {
            Some(idx) => idx,
            None => return Ok(()),
        };

        log::trace!("scheduler: run, {} live workers", st.live());
        st.active = true;
        st.stalled = 0;
        st.baton = Some(first);
        self.cond.notify_all();

        while st.active {
            st = self.cond.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        log::trace!("scheduler: quiescent, {} live workers", st.live());

        match st.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Suspend the calling worker until `pred` holds.
    ///
    /// Returns immediately when `pred` is already true. Calling this from a
    /// thread the scheduler does not own with a false predicate is an error,
    /// since nothing could ever make progress.
    pub fn wait<F>(&self, mut pred: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        if pred() {
            return Ok(());
        }

        let me = thread::current().id();
        let (idx, worker) = {
            let st = self.lock();
            match st.threads.get(&me) {
                Some(&idx) => (idx, Arc::clone(&st.tasks[idx].worker)),
                None => {
                    return Err(EmuError::invariant("wait() with a false predicate outside a scheduled worker"))
                }
            }
        };

        loop {
            let mut st = self.lock();
            st.tasks[idx].state = TaskState::Blocked;
            st.stalled += 1;
            self.handoff(&mut st, idx);
            let st = self.park(st, idx);
            drop(st);

            if pred() {
                let mut st = self.lock();
                st.tasks[idx].state = TaskState::Running;
                st.stalled = 0;
                drop(st);
                worker.on_resume();
                return Ok(());
            }
        }
    }

    fn handoff(&self, st: &mut SchedState, from: usize) {
        let live = st.live();
        if live == 0 || st.stalled >= live || st.error.is_some() {
            st.baton = None;
            st.active = false;
        } else {
            st.baton = st.next_live(from);
        }
        self.cond.notify_all();
    }

    fn task_main(self: Arc<Self>, idx: usize) {
        let worker = {
            let st = self.lock();
            let mut st = self.park(st, idx);
            st.tasks[idx].state = TaskState::Running;
            st.stalled = 0;
            Arc::clone(&st.tasks[idx].worker)
        };

        worker.on_resume();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker.run()));
        let err = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(payload) => Some(EmuError::WorkerPanicked { worker: idx, message: panic_message(&*payload) }),
        };

        let mut st = self.lock();
        st.tasks[idx].state = TaskState::Finished;
        st.threads.remove(&thread::current().id());
        if let Some(e) = err {
            log::warn!("worker {} failed: {}", idx, e);
            if st.error.is_none() {
                st.error = Some(e);
            }
        }
        self.handoff(&mut st, idx);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.lock();
        f.debug_struct("Scheduler")
            .field("workers", &st.tasks.len())
            .field("baton", &st.baton)
            .field("active", &st.active)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Debug)]
    struct Producer {
        sched: Arc<Scheduler>,
        slots: Arc<AtomicU32>,
        produced: Arc<AtomicU32>,
    }

    impl Worker for Producer {
        fn run(&self) -> Result<()> {
            for _ in 0..10 {
                let slots = self.slots.clone();
                self.sched.wait(move || slots.load(Ordering::Acquire) < 2)?;
                self.slots.fetch_add(1, Ordering::AcqRel);
                self.produced.fetch_add(1, Ordering::AcqRel);
            }
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Consumer {
        sched: Arc<Scheduler>,
        slots: Arc<AtomicU32>,
        consumed: Arc<AtomicU32>,
    }

    impl Worker for Consumer {
        fn run(&self) -> Result<()> {
            for _ in 0..10 {
                let slots = self.slots.clone();
                self.sched.wait(move || slots.load(Ordering::Acquire) > 0)?;
                assert!(self.slots.load(Ordering::Acquire) <= 2);
                self.slots.fetch_sub(1, Ordering::AcqRel);
                self.consumed.fetch_add(1, Ordering::AcqRel);
            }
            Ok(())
        }
    }

    #[test]
    fn test_producer_consumer() {
        let sched = Arc::new(Scheduler::new());
        let slots = Arc::new(AtomicU32::new(0));
        let produced = Arc::new(AtomicU32::new(0));
        let consumed = Arc::new(AtomicU32::new(0));
        sched.add_worker(Arc::new(Consumer { sched: sched.clone(), slots: slots.clone(), consumed: consumed.clone() }));
        sched.add_worker(Arc::new(Producer { sched: sched.clone(), slots: slots.clone(), produced: produced.clone() }));

        sched.run().unwrap();

        assert_eq!(produced.load(Ordering::Acquire), 10);
        assert_eq!(consumed.load(Ordering::Acquire), 10);
        assert_eq!(sched.task_state(0), Some(TaskState::Finished));
        assert_eq!(sched.task_state(1), Some(TaskState::Finished));
    }

    #[test]
    fn test_wait_outside_worker() {
        let sched = Scheduler::new();
        assert!(sched.wait(|| true).is_ok());
        assert!(matches!(sched.wait(|| false), Err(EmuError::InvariantViolation(_))));
    }

    #[derive(Debug)]
    struct Gate {
        sched: Arc<Scheduler>,
        open: Arc<AtomicBool>,
        passed: Arc<AtomicBool>,
    }

    impl Worker for Gate {
        fn run(&self) -> Result<()> {
            let open = self.open.clone();
            self.sched.wait(move || open.load(Ordering::Acquire))?;
            self.passed.store(true, Ordering::Release);
            Ok(())
        }
    }

    #[test]
    fn test_quiescence_then_resume() {
        let sched = Arc::new(Scheduler::new());
        let open = Arc::new(AtomicBool::new(false));
        let passed = Arc::new(AtomicBool::new(false));
        sched.add_worker(Arc::new(Gate { sched: sched.clone(), open: open.clone(), passed: passed.clone() }));

        // never satisfied: run returns with the worker parked
        sched.run().unwrap();
        assert_eq!(sched.task_state(0), Some(TaskState::Blocked));
        assert!(!passed.load(Ordering::Acquire));

        open.store(true, Ordering::Release);
        sched.run().unwrap();
        assert!(passed.load(Ordering::Acquire));
        assert_eq!(sched.task_state(0), Some(TaskState::Finished));
    }

    #[derive(Debug)]
    struct Boom;

    impl Worker for Boom {
        fn run(&self) -> Result<()> {
            panic!("kernel fault");
        }
    }

    #[derive(Debug)]
    struct Fails;

    impl Worker for Fails {
        fn run(&self) -> Result<()> {
            Err(EmuError::unsupported("bfp8 pack"))
        }
    }

    #[test]
    fn test_worker_panic_reported() {
        let sched = Arc::new(Scheduler::new());
        sched.add_worker(Arc::new(Boom));
        let err = sched.run().unwrap_err();
        assert_eq!(err, EmuError::WorkerPanicked { worker: 0, message: "kernel fault".into() });
    }

    #[test]
    fn test_worker_error_propagates() {
        let sched = Arc::new(Scheduler::new());
        sched.add_worker(Arc::new(Fails));
        assert_eq!(sched.run().unwrap_err(), EmuError::unsupported("bfp8 pack"));
        // nothing left to run
        assert!(sched.run().is_ok());
    }

    #[derive(Debug)]
    struct Resumes {
        sched: Arc<Scheduler>,
        resumed: Arc<AtomicU32>,
        flag: Arc<AtomicBool>,
    }

    impl Worker for Resumes {
        fn run(&self) -> Result<()> {
            let flag = self.flag.clone();
            self.sched.wait(move || flag.load(Ordering::Acquire))
        }

        fn on_resume(&self) {
            self.resumed.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[derive(Debug)]
    struct Setter(Arc<AtomicBool>);

    impl Worker for Setter {
        fn run(&self) -> Result<()> {
            self.0.store(true, Ordering::Release);
            Ok(())
        }
    }

    #[test]
    fn test_on_resume_called_on_start_and_wake() {
        let sched = Arc::new(Scheduler::new());
        let resumed = Arc::new(AtomicU32::new(0));
        let flag = Arc::new(AtomicBool::new(false));
        sched.add_worker(Arc::new(Resumes { sched: sched.clone(), resumed: resumed.clone(), flag: flag.clone() }));
        sched.add_worker(Arc::new(Setter(flag)));
        sched.run().unwrap();
        assert_eq!(resumed.load(Ordering::Acquire), 2);
    }
}
