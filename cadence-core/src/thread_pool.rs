//! # Worker Pool
//!
//! Bounded pool for blocking jobs the playback loop must not wait on.
//!
//! - starts with `init` workers, grows on demand up to `max`
//! - workers above `min` exit after sitting idle for 10 seconds
//! - the most recently queued job runs first (LIFO)
//!
//! Work list, worker registry and busy count share one lock; jobs run with
//! it released. Dropping the pool waits for running jobs; jobs still queued
//! at that point are discarded.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use thiserror::Error;

/// Idle time after which surplus workers exit
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("No idle worker and pool at capacity")]
    Busy,
}

struct State {
    /// Pending jobs; popped from the end
    work: Vec<Task>,
    workers: Vec<(ThreadId, JoinHandle<()>)>,
    busy: usize,
    terminate: bool,
}

struct Inner {
    state: Mutex<State>,
    wakeup: Condvar,
    min: usize,
    max: usize,
    idle_timeout: Duration,
}

pub struct ThreadPool {
    inner: Arc<Inner>,
}

impl ThreadPool {
    /// Start a pool. Fails if the `init` workers cannot all be spawned.
    ///
    /// Callers keep `min <= init`, `min <= max` and `max >= 1`.
    pub fn new(init: usize, min: usize, max: usize) -> Result<Self, PoolError> {
        Self::with_idle_timeout(init, min, max, IDLE_TIMEOUT)
    }

    pub(crate) fn with_idle_timeout(
        init: usize,
        min: usize,
        max: usize,
        idle_timeout: Duration,
    ) -> Result<Self, PoolError> {
        debug_assert!(min <= init && min <= max && max >= 1);

        let pool = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    work: Vec::new(),
                    workers: Vec::with_capacity(max),
                    busy: 0,
                    terminate: false,
                }),
                wakeup: Condvar::new(),
                min,
                max,
                idle_timeout,
            }),
        };

        {
            let mut state = pool.inner.state.lock();
            for _ in 0..init {
                spawn_worker(&pool.inner, &mut state)?;
            }
        }

        tracing::debug!("Thread pool started ({} workers, {}..={})", init, min, max);
        Ok(pool)
    }

    /// Queue a job. A worker is added when every existing one has
    /// something to do; that may fail as long as one worker is left.
    pub fn queue<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        let workers = state.workers.len();
        if state.busy + state.work.len() + 1 > workers && workers < self.inner.max {
            if let Err(e) = spawn_worker(&self.inner, &mut state) {
                if state.workers.is_empty() {
                    return Err(PoolError::Spawn(e));
                }
                tracing::warn!("Could not grow thread pool: {}", e);
            }
        }
        state.work.push(Box::new(task));
        self.inner.wakeup.notify_one();
        Ok(())
    }

    /// Like [`Self::queue`], but only if the job can start right away on an
    /// idle or new worker; never waits behind busy ones.
    pub fn run<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        let idle = state
            .workers
            .len()
            .saturating_sub(state.busy + state.work.len());
        if idle == 0 {
            if state.workers.len() >= self.inner.max {
                return Err(PoolError::Busy);
            }
            spawn_worker(&self.inner, &mut state)?;
        }
        state.work.push(Box::new(task));
        self.inner.wakeup.notify_one();
        Ok(())
    }

    pub fn num_threads(&self) -> usize {
        self.inner.state.lock().workers.len()
    }

    pub fn num_queued(&self) -> usize {
        self.inner.state.lock().work.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        let (workers, leftover) = {
            let mut state = self.inner.state.lock();
            state.terminate = true;
            self.inner.wakeup.notify_all();
            (
                std::mem::take(&mut state.workers),
                std::mem::take(&mut state.work),
            )
        };

        if !leftover.is_empty() {
            tracing::warn!("Thread pool dropped {} queued jobs", leftover.len());
        }
        drop(leftover);

        for (_, handle) in workers {
            if handle.join().is_err() {
                tracing::error!("Thread pool worker panicked");
            }
        }

        let state = self.inner.state.lock();
        debug_assert!(state.work.is_empty() && state.workers.is_empty());
    }
}

fn spawn_worker(inner: &Arc<Inner>, state: &mut State) -> std::io::Result<()> {
    let shared = inner.clone();
    let handle = thread::Builder::new()
        .name("cadence-worker".into())
        .spawn(move || worker_loop(&shared))?;
    state.workers.push((handle.thread().id(), handle));
    Ok(())
}

fn worker_loop(inner: &Inner) {
    let mut state = inner.state.lock();
    loop {
        if state.terminate {
            break;
        }

        if let Some(task) = state.work.pop() {
            state.busy += 1;
            let result =
                MutexGuard::unlocked(&mut state, || panic::catch_unwind(AssertUnwindSafe(task)));
            state.busy -= 1;
            if result.is_err() {
                tracing::error!("Thread pool job panicked");
            }
            continue;
        }

        if state.workers.len() > inner.min {
            let timed_out = inner.wakeup.wait_for(&mut state, inner.idle_timeout).timed_out();
            if timed_out
                && !state.terminate
                && state.work.is_empty()
                && state.workers.len() > inner.min
            {
                let me = thread::current().id();
                if let Some(pos) = state.workers.iter().position(|(id, _)| *id == me) {
                    // Dropping the handle detaches this thread
                    state.workers.swap_remove(pos);
                }
                tracing::trace!("idle worker exiting");
                break;
            }
        } else {
            inner.wakeup.wait(&mut state);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
