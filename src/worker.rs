//! Worker dispatch
//!
//! A fixed pool of OS threads executing read, write and generic tasks off the
//! selector threads. Every worker owns a bounded lock-free ring
//! ([`ArrayQueue`]) that any thread may push into; the worker pops and runs
//! tasks in order and then drains a thread-local overflow queue used when a
//! worker resubmits to a ring that is momentarily full.
//!
//! Submission never drops a task:
//!
//! 1. try to push into the target ring;
//! 2. if the submitter is itself a worker of this pool, defer to its own
//!    overflow queue (a worker must not spin waiting on a ring it may be the
//!    one to drain);
//! 3. otherwise log a capacity warning and retry until a slot frees up.
//!
//! Tasks for one channel may run on any worker; the channel pipeline keeps at
//! most one read task and one write task per channel in flight, which is what
//! preserves per-channel ordering.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::affinity;
use crate::error::{Error, Result};

/// Unit of work executed by a worker thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Upper bound on how long an idle worker sleeps before re-checking its ring.
const PARK_TIMEOUT: Duration = Duration::from_millis(50);

/// Spins before a blocked submitter starts yielding.
const SPIN_LIMIT: u32 = 64;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// (pool id, worker index) of the current thread, if it is a worker.
    static CURRENT_WORKER: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
    static OVERFLOW: RefCell<VecDeque<Task>> = const { RefCell::new(VecDeque::new()) };
}

struct WorkerSlot {
    ring: ArrayQueue<Task>,
    thread: OnceLock<Thread>,
}

impl WorkerSlot {
    fn wake(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }
}

struct Shared {
    id: usize,
    workers: Box<[WorkerSlot]>,
    running: AtomicBool,
    next: AtomicUsize,
}

/// Fixed-size pool of worker threads fed through per-worker rings
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts `threads` workers, each with a ring of `ring_capacity` tasks.
    pub fn new(threads: usize, ring_capacity: usize) -> io::Result<Self> {
        Self::start(threads, ring_capacity, None)
    }

    /// Starts the pool; with `pin_offset = Some(k)` worker `j` is pinned to
    /// the core of global thread index `k + j`.
    pub fn start(threads: usize, ring_capacity: usize, pin_offset: Option<usize>) -> io::Result<Self> {
        let threads = threads.max(1);
        let workers = (0..threads)
            .map(|_| WorkerSlot {
                ring: ArrayQueue::new(ring_capacity.max(1)),
                thread: OnceLock::new(),
            })
            .collect();
        let shared = Arc::new(Shared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            workers,
            running: AtomicBool::new(true),
            next: AtomicUsize::new(0),
        });

        let pool = Self {
            shared: shared.clone(),
            handles: Mutex::new(Vec::with_capacity(threads)),
        };
        for index in 0..threads {
            let worker_shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("horizon-worker-{index}"))
                .spawn(move || {
                    if let Some(offset) = pin_offset {
                        affinity::pin_current(true, offset + index, "worker");
                    }
                    worker_loop(&worker_shared, index);
                })?;
            let _ = shared.workers[index].thread.set(handle.thread().clone());
            pool.handles.lock().push(handle);
        }

        info!("worker pool started: {threads} workers, ring capacity {ring_capacity}");
        Ok(pool)
    }

    /// Number of worker threads.
    pub fn len(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.workers.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Tasks waiting in the rings (not counting overflow queues).
    pub fn pending(&self) -> usize {
        self.shared.workers.iter().map(|w| w.ring.len()).sum()
    }

    /// Submits to the next worker in round-robin order.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let index = self.shared.next.fetch_add(1, Ordering::Relaxed) % self.len();
        self.submit_to(index, Box::new(task))
    }

    /// Submits to the worker selected by `key` (typically a channel id).
    pub fn submit_keyed<F>(&self, key: u64, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let index = (key % self.len() as u64) as usize;
        self.submit_to(index, Box::new(task))
    }

    /// Submits to worker `index` (taken modulo the pool size).
    pub fn submit_to(&self, index: usize, task: Task) -> Result<()> {
        if !self.is_running() {
            return Err(Error::Shutdown);
        }
        let index = index % self.len();
        let worker = &self.shared.workers[index];

        let mut task = match worker.ring.push(task) {
            Ok(()) => {
                worker.wake();
                return Ok(());
            }
            Err(task) => task,
        };

        if CURRENT_WORKER.with(|c| c.get()).is_some_and(|(pool, _)| pool == self.shared.id) {
            OVERFLOW.with(|q| q.borrow_mut().push_back(task));
            return Ok(());
        }

        warn!("worker {index} ring full, falling back to blocking slot acquisition");
        let mut spins = 0u32;
        loop {
            worker.wake();
            if spins < SPIN_LIMIT {
                std::hint::spin_loop();
                spins += 1;
            } else {
                thread::yield_now();
            }
            if !self.is_running() {
                return Err(Error::Shutdown);
            }
            task = match worker.ring.push(task) {
                Ok(()) => {
                    worker.wake();
                    return Ok(());
                }
                Err(task) => task,
            };
        }
    }

    /// Stops accepting tasks, lets workers drain their rings and joins them.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for worker in self.shared.workers.iter() {
            worker.wake();
        }
        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("worker thread terminated by panic");
            }
        }
        info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.len())
            .field("pending", &self.pending())
            .field("running", &self.is_running())
            .finish()
    }
}

fn run_task(task: Task) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
        error!("worker task panicked: {}", Error::from_panic(payload));
    }
}

fn drain_overflow() -> bool {
    let mut ran = false;
    while let Some(task) = OVERFLOW.with(|q| q.borrow_mut().pop_front()) {
        run_task(task);
        ran = true;
    }
    ran
}

fn worker_loop(shared: &Shared, index: usize) {
    CURRENT_WORKER.with(|c| c.set(Some((shared.id, index))));
    let ring = &shared.workers[index].ring;
    debug!("worker {index} running");

    loop {
        let mut ran = false;
        while let Some(task) = ring.pop() {
            run_task(task);
            drain_overflow();
            ran = true;
        }
        ran |= drain_overflow();

        if !shared.running.load(Ordering::Acquire) && ring.is_empty() {
            break;
        }
        if !ran {
            thread::park_timeout(PARK_TIMEOUT);
        }
    }

    CURRENT_WORKER.with(|c| c.set(None));
    debug!("worker {index} exiting");
}
