//! # Cooperative Worker Jobs
//!
//! F1 and Fx run as fixed teams of workers that advance in lock-step
//! through count → prefix-sum → scatter phases. This module provides the
//! three coordination pieces they share:
//!
//! - [`JobBarrier`]: a reusable generation-counted barrier. One barrier is
//!   created per stage and reused across every bucket and chunk, parking
//!   workers instead of spinning.
//! - [`SharedSlice`]: an unchecked scatter window over a shared buffer.
//!   The prefix sum hands every worker disjoint index sets, which the
//!   borrow checker cannot see; writes go through raw pointers with that
//!   disjointness as the stated contract.
//! - [`CountBoard`]: the per-worker × per-bucket count matrix behind the
//!   cooperative prefix sum. Workers publish counts, hit a barrier, then
//!   each derives its disjoint, contiguous write window per bucket.
//!
//! Worker 0 is the control thread: between barriers it performs the
//! single-threaded steps (buffer begin/submit, manifest accounting).

use std::marker::PhantomData;

use parking_lot::{Condvar, Mutex};

struct BarrierState {
    waiting: usize,
    generation: u64,
}

/// Reusable barrier for a fixed team of workers.
pub struct JobBarrier {
    team: usize,
    state: Mutex<BarrierState>,
    condvar: Condvar,
}

impl JobBarrier {
    pub fn new(team: usize) -> Self {
        assert!(team > 0);
        Self {
            team,
            state: Mutex::new(BarrierState { waiting: 0, generation: 0 }),
            condvar: Condvar::new(),
        }
    }

    /// Blocks until every team member arrives. The last arrival releases
    /// the generation.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        state.waiting += 1;
        if state.waiting == self.team {
            state.waiting = 0;
            state.generation = state.generation.wrapping_add(1);
            drop(state);
            self.condvar.notify_all();
            return;
        }
        let generation = state.generation;
        while state.generation == generation {
            self.condvar.wait(&mut state);
        }
    }
}

/// Per-worker view of a running job.
#[derive(Clone, Copy)]
pub struct JobCtx<'a> {
    pub id: usize,
    pub team: usize,
    barrier: &'a JobBarrier,
}

impl<'a> JobCtx<'a> {
    /// Worker 0 performs the single-threaded control steps.
    pub fn is_control(&self) -> bool {
        self.id == 0
    }

    pub fn sync(&self) {
        self.barrier.wait();
    }
}

/// Runs `job` on a team of `team` workers and collects their results in
/// worker order.
pub fn run_jobs<R, J>(team: usize, job: J) -> Vec<R>
where
    R: Send,
    J: Fn(JobCtx<'_>) -> R + Sync,
{
    assert!(team > 0);
    let barrier = JobBarrier::new(team);

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..team)
            .map(|id| {
                let barrier = &barrier;
                let job = &job;
                scope.spawn(move || job(JobCtx { id, team, barrier }))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
            })
            .collect()
    })
}

/// Unchecked scatter window over a shared buffer.
///
/// Cloned freely into workers; every access is `unsafe` with one
/// contract: concurrent writers touch disjoint indices, and reads only
/// happen after a barrier separates them from the writes.
pub struct SharedSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

impl<'a, T> Clone for SharedSlice<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<'a, T> Copy for SharedSlice<'a, T> {}

// SAFETY: access discipline (disjoint writes, barrier-separated reads) is
// the caller's stated contract on every use site.
unsafe impl<'a, T: Send> Send for SharedSlice<'a, T> {}
unsafe impl<'a, T: Send> Sync for SharedSlice<'a, T> {}

impl<'a, T> SharedSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self { ptr: slice.as_mut_ptr(), len: slice.len(), _marker: PhantomData }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// No other thread may read or write `index` concurrently.
    pub unsafe fn write(&self, index: usize, value: T) {
        debug_assert!(index < self.len);
        self.ptr.add(index).write(value);
    }

    /// # Safety
    ///
    /// A barrier must separate this read from any write to `index`.
    pub unsafe fn get(&self, index: usize) -> T
    where
        T: Copy,
    {
        debug_assert!(index < self.len);
        self.ptr.add(index).read()
    }
}

/// Disjoint per-worker write windows derived from the count matrix.
pub struct Windows {
    /// This worker's first destination index per bucket, in global
    /// scatter-array coordinates.
    pub starts: Vec<u64>,
    /// First index of each bucket (prefix of `totals`).
    pub bucket_bases: Vec<u64>,
    /// Global entry count per bucket, across all workers.
    pub totals: Vec<u64>,
}

impl Windows {
    /// This worker's window start relative to the bucket base — the
    /// bucket-local entry index its output begins at.
    pub fn local_start(&self, bucket: usize) -> u64 {
        self.starts[bucket] - self.bucket_bases[bucket]
    }
}

/// Worker × bucket count matrix for the cooperative prefix sum.
pub struct CountBoard<'a> {
    cells: SharedSlice<'a, u64>,
    team: usize,
    buckets: usize,
}

impl<'a> CountBoard<'a> {
    /// `storage` must hold `team * buckets` zeroed cells.
    pub fn new(storage: &'a mut [u64], team: usize, buckets: usize) -> Self {
        assert_eq!(storage.len(), team * buckets);
        Self { cells: SharedSlice::new(storage), team, buckets }
    }

    /// Publishes one worker's per-bucket counts. Called once per round per
    /// worker, before the prefix-sum barrier.
    pub fn publish(&self, worker: usize, counts: &[u64]) {
        debug_assert_eq!(counts.len(), self.buckets);
        for (bucket, &count) in counts.iter().enumerate() {
            // SAFETY: each worker writes only its own row.
            unsafe { self.cells.write(worker * self.buckets + bucket, count) };
        }
    }

    /// Computes `worker`'s write windows. All workers must have published
    /// and passed a barrier first.
    pub fn windows(&self, worker: usize) -> Windows {
        let read = |w: usize, b: usize| -> u64 {
            // SAFETY: publication finished behind a barrier; the board is
            // read-only in this phase.
            unsafe { self.cells.get(w * self.buckets + b) }
        };

        let mut totals = vec![0u64; self.buckets];
        for w in 0..self.team {
            for (b, total) in totals.iter_mut().enumerate() {
                *total += read(w, b);
            }
        }

        let mut bucket_bases = vec![0u64; self.buckets];
        let mut running = 0u64;
        for (b, base) in bucket_bases.iter_mut().enumerate() {
            *base = running;
            running += totals[b];
        }

        let mut starts = vec![0u64; self.buckets];
        for b in 0..self.buckets {
            let mut start = bucket_bases[b];
            for w in 0..worker {
                start += read(w, b);
            }
            starts[b] = start;
        }

        Windows { starts, bucket_bases, totals }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn barrier_is_reusable_across_generations() {
        const TEAM: usize = 4;
        const ROUNDS: usize = 50;
        let barrier = JobBarrier::new(TEAM);
        let counter = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..TEAM {
                scope.spawn(|| {
                    for round in 0..ROUNDS {
                        counter.fetch_add(1, Ordering::Relaxed);
                        barrier.wait();
                        // Every member observes the full round's increments.
                        assert!(counter.load(Ordering::Relaxed) >= (round + 1) * TEAM);
                        barrier.wait();
                    }
                });
            }
        });

        assert_eq!(counter.load(Ordering::Relaxed), TEAM * ROUNDS);
    }

    #[test]
    fn windows_are_disjoint_and_cover_each_bucket() {
        const TEAM: usize = 3;
        const BUCKETS: usize = 4;
        let counts = [
            [5u64, 0, 2, 7],
            [1, 3, 3, 0],
            [4, 4, 0, 1],
        ];

        let mut storage = vec![0u64; TEAM * BUCKETS];
        let board = CountBoard::new(&mut storage, TEAM, BUCKETS);
        for (worker, row) in counts.iter().enumerate() {
            board.publish(worker, row);
        }

        let windows: Vec<Windows> = (0..TEAM).map(|w| board.windows(w)).collect();

        // Totals equal the column sums for every worker's view.
        for view in &windows {
            assert_eq!(view.totals, vec![10, 7, 5, 8]);
        }

        // Each bucket is covered exactly once by consecutive windows.
        for b in 0..BUCKETS {
            let mut cursor = windows[0].bucket_bases[b];
            for (worker, view) in windows.iter().enumerate() {
                assert_eq!(view.starts[b], cursor, "worker {} bucket {}", worker, b);
                cursor += counts[worker][b];
            }
            assert_eq!(cursor, windows[0].bucket_bases[b] + windows[0].totals[b]);
        }

        // Local starts are bucket-relative.
        assert_eq!(windows[1].local_start(0), 5);
        assert_eq!(windows[2].local_start(3), 7);
    }

    #[test]
    fn run_jobs_returns_results_in_worker_order() {
        let results = run_jobs(5, |ctx| {
            ctx.sync();
            ctx.id * 10
        });
        assert_eq!(results, vec![0, 10, 20, 30, 40]);
    }

    #[test]
    fn shared_slice_scatter_from_many_threads() {
        let mut data = vec![0u32; 1000];
        let slice = SharedSlice::new(&mut data);

        run_jobs(4, |ctx| {
            for i in (ctx.id..1000).step_by(ctx.team) {
                // SAFETY: index sets are disjoint by construction.
                unsafe { slice.write(i, i as u32) };
            }
        });

        for (i, &v) in data.iter().enumerate() {
            assert_eq!(v, i as u32);
        }
    }
}
