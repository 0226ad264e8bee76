use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;

use parking_lot::{Mutex, MutexGuard};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use crate::broadphase::QueryScratch;
use crate::config::ThreadConfig;
use crate::contact::Contact;
use crate::error::PhysResult;
use crate::narrowphase::Overlap;
use crate::solver::SolverScratch;

/// Per-worker scratch, created once per rayon job split and reused across
/// the islands that worker picks up.
pub struct ThreadContext {
    pub query: QueryScratch,
    pub overlaps: Vec<Overlap>,
    pub contacts: Vec<Contact>,
    pub solver: SolverScratch,
}

impl ThreadContext {
    pub fn new(candidates: usize) -> Self {
        Self {
            query: QueryScratch::with_capacity(candidates.min(256)),
            overlaps: Vec::with_capacity(16),
            contacts: Vec::with_capacity(64),
            solver: SolverScratch::default(),
        }
    }
}

/// Worker pool plus the bookkeeping that tells API calls whether a step is
/// running.
pub struct StepScheduler {
    pool: ThreadPool,
    step_lock: Mutex<()>,
    stepping: AtomicBool,
    pod_thread: ThreadId,
    min_parallel: usize,
    candidates: usize,
}

/// Held for the duration of one `time_step`.
pub struct StepGuard<'a> {
    scheduler: &'a StepScheduler,
    _lock: MutexGuard<'a, ()>,
}

impl Drop for StepGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.stepping.store(false, Ordering::Release);
    }
}

impl StepScheduler {
    pub fn new(cfg: &ThreadConfig, candidates: usize) -> PhysResult<Self> {
        let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("kinetik-worker-{i}"));
        if cfg.workers > 0 {
            builder = builder.num_threads(cfg.workers);
        }
        if let Some(stack) = cfg.stack_size {
            builder = builder.stack_size(stack);
        }
        let pool = builder.build()?;
        info!(workers = pool.current_num_threads(), "physics worker pool started");
        Ok(Self {
            pool,
            step_lock: Mutex::new(()),
            stepping: AtomicBool::new(false),
            pod_thread: std::thread::current().id(),
            min_parallel: cfg.min_parallel_islands.max(1),
            candidates,
        })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn is_stepping(&self) -> bool {
        self.stepping.load(Ordering::Acquire)
    }

    /// Whether the caller is the thread allowed to stream regions in.
    pub fn is_pod_thread(&self) -> bool {
        std::thread::current().id() == self.pod_thread
    }

    /// Serialize steps and mark one as running.
    pub fn begin_step(&self) -> StepGuard<'_> {
        let lock = self.step_lock.lock();
        self.stepping.store(true, Ordering::Release);
        StepGuard { scheduler: self, _lock: lock }
    }

    /// Run `f` over every item, in parallel when there are enough of them.
    /// Results come back in item order.
    pub fn run<T, R, F>(&self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&mut ThreadContext, &T) -> R + Sync + Send,
    {
        let candidates = self.candidates;
        if items.len() < self.min_parallel {
            let mut ctx = ThreadContext::new(candidates);
            return items.iter().map(|it| f(&mut ctx, it)).collect();
        }
        debug!(jobs = items.len(), "dispatching to worker pool");
        self.pool.install(|| {
            items
                .par_iter()
                .map_init(|| ThreadContext::new(candidates), |ctx, it| f(ctx, it))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_preserves_order_on_workers() {
        let cfg = ThreadConfig { workers: 3, min_parallel_islands: 2, ..ThreadConfig::default() };
        let s = StepScheduler::new(&cfg, 64).unwrap();
        let items: Vec<u32> = (0..100).collect();
        let names = s.run(&items, |_, _| std::thread::current().name().map(str::to_owned));
        assert!(names
            .iter()
            .all(|n| n.as_deref().is_some_and(|n| n.starts_with("kinetik-worker-"))));
        let out = s.run(&items, |ctx, x| {
            ctx.contacts.clear();
            x * 2
        });
        assert_eq!(out, items.iter().map(|x| x * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_small_batches_stay_on_caller() {
        let cfg = ThreadConfig { workers: 2, min_parallel_islands: 4, ..ThreadConfig::default() };
        let s = StepScheduler::new(&cfg, 64).unwrap();
        let me = std::thread::current().id();
        let ids = s.run(&[1, 2, 3], |_, _| std::thread::current().id());
        assert!(ids.iter().all(|id| *id == me));
        assert!(s.is_pod_thread());
    }

    #[test]
    fn test_step_guard_flags_stepping() {
        let cfg = ThreadConfig { workers: 1, ..ThreadConfig::default() };
        let s = StepScheduler::new(&cfg, 8).unwrap();
        assert!(!s.is_stepping());
        {
            let _g = s.begin_step();
            assert!(s.is_stepping());
        }
        assert!(!s.is_stepping());
    }
}
