// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A thread pool computing element-wise sums at a lightweight cost.

use crate::macros::{log_debug, log_error, log_warn};
use crate::range::{ChunkRange, ChunkRangeFactory, ChunkRangeOrchestrator};
use crate::util::{SliceView, SliceViewMut, Status};
use crossbeam_utils::CachePadded;
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::cell::Cell;
use std::num::NonZeroUsize;
use std::ops::Add;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{Scope, ScopedJoinHandle};

/// Number of threads to spawn in a thread pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Resolves the number of threads to spawn.
    fn count(self) -> NonZeroUsize {
        match self {
            ThreadCount::AvailableParallelism => std::thread::available_parallelism()
                .expect("Getting the available parallelism failed"),
            ThreadCount::Count(count) => count,
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a thread pool will panic.
    Always,
}

/// A builder for [`ThreadPool`].
pub struct ThreadPoolBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_threads: ThreadCount,
    /// Number of contiguous indices assigned to a worker per scheduling unit.
    ///
    /// The index range is split into blocks of this many indices, distributed
    /// round-robin among the worker threads ahead of execution. The last block
    /// is shorter if the block size doesn't divide the number of elements.
    pub chunk_size: NonZeroUsize,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl ThreadPoolBuilder {
    /// Spawns a scoped thread pool and runs `f` on it, joining the worker
    /// threads before returning.
    ///
    /// ```rust
    /// # use parsum::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};
    /// # use std::num::NonZeroUsize;
    /// let pool_builder = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::try_from(4).unwrap(),
    ///     chunk_size: NonZeroUsize::try_from(2).unwrap(),
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// };
    ///
    /// let left = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
    /// let right = [10, 20, 30, 40, 50, 60, 70, 80, 90, 100];
    /// let mut output = [0; 10];
    ///
    /// pool_builder.scope(|thread_pool| {
    ///     thread_pool.add_slices(&left, &right, &mut output);
    /// });
    ///
    /// assert_eq!(output, [11, 22, 33, 44, 55, 66, 77, 88, 99, 110]);
    /// ```
    pub fn scope<T, R>(&self, f: impl FnOnce(ThreadPool<'_, T>) -> R) -> R
    where
        T: Add<Output = T> + Copy + Send + Sync,
    {
        std::thread::scope(|scope| {
            let thread_pool = ThreadPool::new(
                scope,
                self.num_threads.count(),
                self.chunk_size,
                self.cpu_pinning,
            );
            f(thread_pool)
        })
    }
}

/// Status of the main thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MainStatus {
    /// The main thread is waiting for the worker threads to finish a round.
    Waiting,
    /// The main thread is ready to prepare the next round.
    Ready,
}

/// Status sent to the worker threads.
#[derive(Clone, Copy, PartialEq, Eq)]
enum WorkerStatus {
    /// The worker threads need to compute a round of the given color.
    Round(RoundColor),
    /// There is nothing more to do and the worker threads must exit.
    Finished,
}

/// A 2-element enumeration to distinguish successive rounds. The "colors" are
/// only illustrative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundColor {
    Blue,
    Red,
}

impl RoundColor {
    /// Flips to the other color.
    fn toggle(&mut self) {
        *self = match self {
            RoundColor::Blue => RoundColor::Red,
            RoundColor::Red => RoundColor::Blue,
        }
    }
}

/// A thread pool tied to a scope, that computes element-wise sums of slices of
/// the given type.
pub struct ThreadPool<'scope, T> {
    /// Handles to all the worker threads in the pool.
    threads: Vec<ScopedJoinHandle<'scope, ()>>,
    /// Color of the current round.
    round: Cell<RoundColor>,
    /// Context shared with the worker threads.
    shared: Arc<SharedContext<T>>,
    /// Orchestrator for the chunked ranges distributed to the threads.
    range_orchestrator: ChunkRangeOrchestrator,
}

/// Context shared between the main thread and the worker threads.
struct SharedContext<T> {
    /// Number of worker threads active in the current round.
    num_active_threads: CachePadded<AtomicUsize>,
    /// Number of worker threads that panicked in the current round.
    num_panicking_threads: CachePadded<AtomicUsize>,
    /// Status of the worker threads.
    worker_status: Status<WorkerStatus>,
    /// Status of the main thread.
    main_status: Status<MainStatus>,
    /// Slices processed during the current round.
    job: RwLock<AddJob<T>>,
}

/// Lifetime-erased slices for one summation round.
struct AddJob<T> {
    /// Left-hand input of the sum.
    left: SliceView<T>,
    /// Right-hand input of the sum.
    right: SliceView<T>,
    /// Output slice, written by the workers with disjoint index sets.
    output: SliceViewMut<T>,
}

impl<T> AddJob<T> {
    /// Creates a job with no slices attached.
    fn empty() -> Self {
        Self {
            left: SliceView::empty(),
            right: SliceView::empty(),
            output: SliceViewMut::empty(),
        }
    }

    /// Attaches the slices for the upcoming round. Subsequent calls to
    /// [`inputs()`](Self::inputs) and [`write_output()`](Self::write_output)
    /// must not outlive the given slices.
    fn set(&mut self, left: &[T], right: &[T], output: &mut [T]) {
        debug_assert_eq!(left.len(), right.len());
        debug_assert_eq!(left.len(), output.len());
        self.left.set(left);
        self.right.set(right);
        self.output.set(output);
    }

    /// Detaches the slices of the last round.
    fn clear(&mut self) {
        self.left.clear();
        self.right.clear();
        self.output.clear();
    }

    /// Returns the input slices attached by [`set()`](Self::set), or [`None`]
    /// if the job is cleared.
    ///
    /// # Safety
    ///
    /// The underlying slices must be valid and not mutated during the whole
    /// output lifetime.
    unsafe fn inputs(&self) -> Option<(&[T], &[T])> {
        // SAFETY: forwarded to this function's requirements.
        let left = unsafe { self.left.get() }?;
        // SAFETY: forwarded to this function's requirements.
        let right = unsafe { self.right.get() }?;
        Some((left, right))
    }

    /// Writes the given value into the output slot at `index`.
    ///
    /// # Safety
    ///
    /// The attached output slice must be live and longer than `index`, and no
    /// other thread may access the same slot during the round.
    unsafe fn write_output(&self, index: usize, value: T) {
        // SAFETY: forwarded to this function's requirements.
        unsafe { self.output.write(index, value) };
    }
}

impl<'scope, T: Add<Output = T> + Copy + Send + Sync + 'scope> ThreadPool<'scope, T> {
    /// Creates a new pool tied to the given scope, spawning the given number of
    /// worker threads.
    fn new<'env>(
        thread_scope: &'scope Scope<'scope, 'env>,
        num_threads: NonZeroUsize,
        chunk_size: NonZeroUsize,
        cpu_pinning: CpuPinningPolicy,
    ) -> Self {
        let num_threads: usize = num_threads.into();
        let color = RoundColor::Blue;
        let shared = Arc::new(SharedContext {
            num_active_threads: CachePadded::new(AtomicUsize::new(0)),
            num_panicking_threads: CachePadded::new(AtomicUsize::new(0)),
            worker_status: Status::new(WorkerStatus::Round(color)),
            main_status: Status::new(MainStatus::Waiting),
            job: RwLock::new(AddJob::empty()),
        });

        let range_factory = ChunkRangeFactory::new(num_threads, chunk_size);

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        let threads = (0..num_threads)
            .map(|id| {
                let mut context = ThreadContext {
                    #[cfg(feature = "log")]
                    id,
                    round: color,
                    range: range_factory.range(id),
                    shared: shared.clone(),
                };
                thread_scope.spawn(move || {
                    #[cfg(all(
                        not(miri),
                        any(
                            target_os = "android",
                            target_os = "dragonfly",
                            target_os = "freebsd",
                            target_os = "linux"
                        )
                    ))]
                    match cpu_pinning {
                        CpuPinningPolicy::No => (),
                        CpuPinningPolicy::IfSupported => {
                            let mut cpu_set = CpuSet::new();
                            if let Err(_e) = cpu_set.set(id) {
                                log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
                            } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                                log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
                            } else {
                                log_debug!("Pinned thread #{id} to CPU #{id}");
                            }
                        }
                        CpuPinningPolicy::Always => {
                            let mut cpu_set = CpuSet::new();
                            if let Err(e) = cpu_set.set(id) {
                                panic!("Failed to set CPU affinity for thread #{id}: {e}");
                            } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                                panic!("Failed to set CPU affinity for thread #{id}: {e}");
                            } else {
                                log_debug!("Pinned thread #{id} to CPU #{id}");
                            }
                        }
                    }
                    context.run()
                })
            })
            .collect();
        log_debug!("[main thread] Spawned threads");

        Self {
            threads,
            round: Cell::new(color),
            shared,
            range_orchestrator: range_factory.orchestrator(),
        }
    }

    /// Returns the number of worker threads that have been spawned in this
    /// thread pool.
    pub fn num_threads(&self) -> NonZeroUsize {
        self.threads.len().try_into().unwrap()
    }

    /// Computes `output[i] = left[i] + right[i]` for every index, processing
    /// the chunks of the index range in parallel on the worker threads and
    /// returning once the whole output is written.
    ///
    /// The result doesn't depend on the number of worker threads nor on the
    /// chunk size: no accumulation happens across indices.
    ///
    /// # Panics
    ///
    /// Panics if the three slices don't all have the same length, or if a
    /// worker thread panicked during the round.
    pub fn add_slices(&self, left: &[T], right: &[T], output: &mut [T]) {
        if left.len() != right.len() {
            panic!(
                "cannot add slices of mismatched lengths: {} vs {}",
                left.len(),
                right.len()
            );
        }
        if output.len() != left.len() {
            panic!(
                "cannot write the sum into a slice of mismatched length: {} vs {}",
                output.len(),
                left.len()
            );
        }

        self.range_orchestrator.reset_ranges(left.len());

        let num_threads = self.threads.len();
        self.shared
            .num_active_threads
            .store(num_threads, Ordering::SeqCst);

        let mut round = self.round.get();
        round.toggle();
        self.round.set(round);

        // Safety note: The slices set here stay valid, and the inputs are not
        // mutated, until the call to `clear()` at the end of this function,
        // which is after all the worker threads are done with them (as
        // synchronized with `main_status`).
        self.shared.job.write().unwrap().set(left, right, output);
        log_debug!("[main thread, round {round:?}] Ready to compute a round.");

        self.shared
            .worker_status
            .notify_all(WorkerStatus::Round(round));

        log_debug!("[main thread, round {round:?}] Waiting for all threads to finish this round.");

        let mut guard = self
            .shared
            .main_status
            .wait_while(|status| *status == MainStatus::Waiting);
        assert_eq!(*guard, MainStatus::Ready);
        *guard = MainStatus::Waiting;
        drop(guard);

        log_debug!("[main thread, round {round:?}] All threads have now finished this round.");
        self.shared.job.write().unwrap().clear();

        let num_panicking_threads = self.shared.num_panicking_threads.load(Ordering::SeqCst);
        if num_panicking_threads != 0 {
            log_error!(
                "[main thread, round {round:?}] {num_panicking_threads} worker thread(s) panicked!"
            );
            panic!("{num_panicking_threads} worker thread(s) panicked!");
        }
    }
}

impl<T> Drop for ThreadPool<'_, T> {
    /// Joins all the threads in the pool.
    #[allow(clippy::single_match, clippy::unused_enumerate_index)]
    fn drop(&mut self) {
        log_debug!("[main thread] Notifying threads to finish...");
        self.shared.worker_status.notify_all(WorkerStatus::Finished);

        log_debug!("[main thread] Joining threads in the pool...");
        for (_i, t) in self.threads.drain(..).enumerate() {
            let result = t.join();
            match result {
                Ok(_) => log_debug!("[main thread] Thread {_i} joined with result: {result:?}"),
                Err(_) => log_error!("[main thread] Thread {_i} joined with result: {result:?}"),
            }
        }
        log_debug!("[main thread] Joined threads.");
    }
}

/// Context object owned by a worker thread.
struct ThreadContext<T> {
    /// Thread index.
    #[cfg(feature = "log")]
    id: usize,
    /// Color of the current round.
    round: RoundColor,
    /// Chunks of indices that this worker thread needs to process.
    range: ChunkRange,
    /// Context shared with the main thread.
    shared: Arc<SharedContext<T>>,
}

impl<T: Add<Output = T> + Copy> ThreadContext<T> {
    /// Main function run by this thread.
    fn run(&mut self) {
        loop {
            self.round.toggle();
            let round = self.round;
            log_debug!(
                "[thread {}, round {round:?}] Waiting for start signal",
                self.id
            );

            let worker_status: WorkerStatus =
                *self.shared.worker_status.wait_while(|status| match status {
                    WorkerStatus::Finished => false,
                    WorkerStatus::Round(r) => *r != round,
                });
            match worker_status {
                WorkerStatus::Finished => {
                    log_debug!(
                        "[thread {}, round {round:?}] Received finish signal",
                        self.id
                    );
                    break;
                }
                WorkerStatus::Round(r) => {
                    assert_eq!(round, r);
                    log_debug!(
                        "[thread {}, round {round:?}] Received start signal. Processing...",
                        self.id
                    );

                    // Regardless of the computation status (success or panic), the
                    // main thread must learn that this thread is done with the
                    // round. This happens when the notifier is dropped (whether at
                    // the end of this scope or when a panic is unwound).
                    let notifier = Notifier {
                        #[cfg(feature = "log")]
                        id: self.id,
                        #[cfg(feature = "log")]
                        round,
                        shared: &self.shared,
                    };

                    {
                        let guard = self.shared.job.read().unwrap();
                        // SAFETY: the underlying slices are valid, and the inputs
                        // not mutated, for the whole round: the main thread only
                        // clears them after the notifiers from all worker threads
                        // are dropped.
                        let (left, right) = unsafe { guard.inputs().unwrap() };
                        for i in self.range.iter() {
                            // SAFETY: the chunk partition hands each index to
                            // exactly one worker, so no other thread accesses this
                            // output slot during the round.
                            unsafe { guard.write_output(i, left[i] + right[i]) };
                        }
                    }

                    // Explicit drop for clarity.
                    drop(notifier);
                }
            }
        }
    }
}

/// Object whose destructor notifies the main thread that a worker thread has
/// finished its round (or has panicked).
struct Notifier<'a, T> {
    /// Thread index.
    #[cfg(feature = "log")]
    id: usize,
    /// Color of the current round.
    #[cfg(feature = "log")]
    round: RoundColor,
    /// Context shared with the main thread.
    shared: &'a SharedContext<T>,
}

impl<T> Drop for Notifier<'_, T> {
    fn drop(&mut self) {
        #[cfg(feature = "log")]
        let round = self.round;

        // Computing a round may panic, and the main thread must learn about it
        // to avoid reporting garbage output.
        if std::thread::panicking() {
            log_error!(
                "[thread {}] Detected panic in this thread, notifying the main thread",
                self.id
            );
            self.shared
                .num_panicking_threads
                .fetch_add(1, Ordering::SeqCst);
        }

        let thread_count = self.shared.num_active_threads.fetch_sub(1, Ordering::SeqCst);
        assert!(thread_count > 0);
        log_debug!(
            "[thread {}, round {round:?}] Decremented the number of active threads: {}.",
            self.id,
            thread_count - 1
        );

        if thread_count == 1 {
            // We're the last thread.
            log_debug!(
                "[thread {}, round {round:?}] We're the last thread. Waking up the main thread.",
                self.id
            );

            match self.shared.main_status.try_notify_one(MainStatus::Ready) {
                Ok(_) => log_debug!(
                    "[thread {}, round {round:?}] Notified the main thread.",
                    self.id
                ),
                Err(e) => {
                    log_error!(
                        "[thread {}] Failed to notify the main thread, the mutex was poisoned: {e:?}",
                        self.id
                    );
                    panic!("Failed to notify the main thread, the mutex was poisoned: {e:?}");
                }
            }
        } else {
            log_debug!(
                "[thread {}, round {round:?}] Waiting for other threads to finish.",
                self.id
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_thread_count_try_from_usize() {
        assert!(ThreadCount::try_from(0).is_err());
        assert_eq!(
            ThreadCount::try_from(1),
            Ok(ThreadCount::Count(NonZeroUsize::try_from(1).unwrap()))
        );
    }

    #[test]
    fn test_num_threads() {
        let pool_builder = ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            chunk_size: NonZeroUsize::try_from(2).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        };
        pool_builder.scope::<u64, _>(|thread_pool| {
            assert_eq!(
                thread_pool.num_threads(),
                std::thread::available_parallelism().unwrap()
            );
        });

        let pool_builder = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(4).unwrap(),
            chunk_size: NonZeroUsize::try_from(2).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        };
        pool_builder.scope::<u64, _>(|thread_pool| {
            assert_eq!(thread_pool.num_threads(), NonZeroUsize::try_from(4).unwrap());
        });
    }

    #[test]
    fn test_add_available_parallelism() {
        let left = (0..1000u64).collect::<Vec<_>>();
        let right = (0..1000u64).map(|x| 10 * x).collect::<Vec<_>>();
        let mut output = vec![0u64; 1000];

        ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            chunk_size: NonZeroUsize::try_from(64).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .scope(|thread_pool| {
            thread_pool.add_slices(&left, &right, &mut output);
        });

        for (i, &x) in output.iter().enumerate() {
            assert_eq!(x, 11 * i as u64);
        }
    }

    #[test]
    fn test_add_cpu_pinning_if_supported() {
        let left = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let right = [10, 20, 30, 40, 50, 60, 70, 80, 90, 100];
        let mut output = [0; 10];

        ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            chunk_size: NonZeroUsize::try_from(3).unwrap(),
            cpu_pinning: CpuPinningPolicy::IfSupported,
        }
        .scope(|thread_pool| {
            thread_pool.add_slices(&left, &right, &mut output);
        });

        assert_eq!(output, [11, 22, 33, 44, 55, 66, 77, 88, 99, 110]);
    }

    #[cfg(all(
        not(miri),
        any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        )
    ))]
    #[test]
    fn test_add_cpu_pinning_always() {
        let left = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let right = [10, 20, 30, 40, 50, 60, 70, 80, 90, 100];
        let mut output = [0; 10];

        ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            chunk_size: NonZeroUsize::try_from(3).unwrap(),
            cpu_pinning: CpuPinningPolicy::Always,
        }
        .scope(|thread_pool| {
            thread_pool.add_slices(&left, &right, &mut output);
        });

        assert_eq!(output, [11, 22, 33, 44, 55, 66, 77, 88, 99, 110]);
    }

    #[cfg(any(
        miri,
        not(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        ))
    ))]
    #[test]
    #[should_panic = "Pinning threads to CPUs is not implemented on this platform."]
    fn test_add_cpu_pinning_always_not_supported() {
        ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            chunk_size: NonZeroUsize::try_from(3).unwrap(),
            cpu_pinning: CpuPinningPolicy::Always,
        }
        .scope::<u64, _>(|_thread_pool| ());
    }

    #[test]
    #[should_panic(expected = "cannot write the sum into a slice of mismatched length: 9 vs 10")]
    fn test_add_mismatched_output_length() {
        let left = [0u64; 10];
        let right = [0u64; 10];
        let mut output = [0u64; 9];

        ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(2).unwrap(),
            chunk_size: NonZeroUsize::try_from(3).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .scope(|thread_pool| {
            thread_pool.add_slices(&left, &right, &mut output);
        });
    }
}
