// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

mod macros;
mod range;
mod thread_pool;
mod util;

pub use thread_pool::{CpuPinningPolicy, ThreadCount, ThreadPool, ThreadPoolBuilder};

use std::num::NonZeroUsize;
use std::ops::Add;

/// Adds the two slices element-wise, processing chunks of `chunk_size` indices
/// in parallel on a temporary thread pool sized to the available parallelism.
///
/// This is a convenience wrapper for one-shot sums; to add several pairs of
/// slices, build a [`ThreadPool`] once via [`ThreadPoolBuilder::scope()`] and
/// reuse it.
///
/// ```rust
/// use std::num::NonZeroUsize;
///
/// let left = [0.0, 1.0, 2.0];
/// let right = [10.0, 20.0, 30.0];
///
/// let sum = parsum::add_slices(&left, &right, NonZeroUsize::try_from(2).unwrap());
/// assert_eq!(sum, [10.0, 21.0, 32.0]);
/// ```
///
/// # Panics
///
/// Panics if the slices have mismatched lengths.
pub fn add_slices<T>(left: &[T], right: &[T], chunk_size: NonZeroUsize) -> Vec<T>
where
    T: Add<Output = T> + Copy + Default + Send + Sync,
{
    ThreadPoolBuilder {
        num_threads: ThreadCount::AvailableParallelism,
        chunk_size,
        cpu_pinning: CpuPinningPolicy::No,
    }
    .scope(|thread_pool| {
        let mut output = vec![T::default(); left.len()];
        thread_pool.add_slices(left, right, &mut output);
        output
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha12Rng;

    /// Example of element type whose addition always panics.
    #[derive(Clone, Copy, Default)]
    struct PanickingAdd;

    impl Add for PanickingAdd {
        type Output = PanickingAdd;

        fn add(self, _other: PanickingAdd) -> PanickingAdd {
            panic!("arithmetic panic");
        }
    }

    macro_rules! expand_tests {
        ( $chunk_size:expr, ) => {};
        ( $chunk_size:expr, $case:ident, $( $others:tt )* ) => {
            #[test]
            fn $case() {
                $crate::test::$case($chunk_size);
            }

            expand_tests!($chunk_size, $($others)*);
        };
        ( $chunk_size:expr, $case:ident => fail($msg:expr), $( $others:tt )* ) => {
            #[test]
            #[should_panic(expected = $msg)]
            fn $case() {
                $crate::test::$case($chunk_size);
            }

            expand_tests!($chunk_size, $($others)*);
        };
    }

    macro_rules! chunk_size_tests {
        ( $mod:ident, $chunk_size:expr ) => {
            mod $mod {
                use super::*;

                expand_tests!(
                    $chunk_size,
                    test_add_integers,
                    test_add_twice,
                    test_add_thread_count_invariance,
                    test_add_mismatched_inputs => fail("cannot add slices of mismatched lengths: 1000 vs 1001"),
                    test_add_panicking_element => fail("worker thread(s) panicked!"),
                );
            }
        };
    }

    chunk_size_tests!(chunk_1, 1);
    chunk_size_tests!(chunk_37, 37);
    chunk_size_tests!(chunk_100, 100);
    chunk_size_tests!(chunk_333, 333);
    chunk_size_tests!(chunk_1000, 1000);
    chunk_size_tests!(chunk_4096, 4096);

    fn pool_builder(num_threads: usize, chunk_size: usize) -> ThreadPoolBuilder {
        ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(num_threads).unwrap(),
            chunk_size: NonZeroUsize::try_from(chunk_size).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
    }

    fn test_add_integers(chunk_size: usize) {
        let left = (0..1000u64).collect::<Vec<_>>();
        let right = (0..1000u64).map(|x| x * 2).collect::<Vec<_>>();
        let mut output = vec![0u64; 1000];

        pool_builder(4, chunk_size).scope(|thread_pool| {
            thread_pool.add_slices(&left, &right, &mut output);
        });

        for (i, &x) in output.iter().enumerate() {
            assert_eq!(x, 3 * i as u64);
        }
    }

    fn test_add_twice(chunk_size: usize) {
        let left = (0..1000u64).collect::<Vec<_>>();
        let right = (0..1000u64).map(|x| x * 2).collect::<Vec<_>>();
        let mut first = vec![0u64; 1000];
        let mut second = vec![0u64; 1000];

        // The same pool can compute multiple rounds.
        pool_builder(4, chunk_size).scope(|thread_pool| {
            thread_pool.add_slices(&left, &right, &mut first);
            thread_pool.add_slices(&first, &right, &mut second);
        });

        for (i, &x) in second.iter().enumerate() {
            assert_eq!(x, 5 * i as u64);
        }
    }

    fn test_add_thread_count_invariance(chunk_size: usize) {
        let mut rng = ChaCha12Rng::seed_from_u64(42);
        let left = (0..1000)
            .map(|_| rng.random_range(0.0f32..10_000.0))
            .collect::<Vec<_>>();
        let right = (0..1000)
            .map(|_| rng.random_range(0.0f32..10_000.0))
            .collect::<Vec<_>>();

        let expected = left
            .iter()
            .zip(right.iter())
            .map(|(&a, &b)| a + b)
            .collect::<Vec<_>>();

        // No accumulation happens across indices, so the output must be
        // bit-identical however the work is distributed.
        for num_threads in [1, 2, 4, 8] {
            let mut output = vec![0.0f32; 1000];
            pool_builder(num_threads, chunk_size).scope(|thread_pool| {
                thread_pool.add_slices(&left, &right, &mut output);
            });
            assert_eq!(output, expected);
        }
    }

    fn test_add_mismatched_inputs(chunk_size: usize) {
        let left = vec![0u64; 1000];
        let right = vec![0u64; 1001];
        let mut output = vec![0u64; 1000];

        pool_builder(4, chunk_size).scope(|thread_pool| {
            thread_pool.add_slices(&left, &right, &mut output);
        });
    }

    fn test_add_panicking_element(chunk_size: usize) {
        let left = vec![PanickingAdd; 1000];
        let right = vec![PanickingAdd; 1000];
        let mut output = vec![PanickingAdd; 1000];

        pool_builder(4, chunk_size).scope(|thread_pool| {
            thread_pool.add_slices(&left, &right, &mut output);
        });
    }

    #[test]
    fn test_add_concrete_scenario() {
        let left = [0.0, 1.0, 2.0];
        let right = [10.0, 20.0, 30.0];
        let mut output = [0.0; 3];

        pool_builder(4, 2).scope(|thread_pool| {
            thread_pool.add_slices(&left, &right, &mut output);
        });

        assert_eq!(output, [10.0, 21.0, 32.0]);
    }

    #[test]
    fn test_add_single_element() {
        let left = [5.0];
        let right = [5.0];
        let mut output = [0.0];

        pool_builder(4, 1).scope(|thread_pool| {
            thread_pool.add_slices(&left, &right, &mut output);
        });

        assert_eq!(output, [10.0]);
    }

    #[test]
    fn test_add_empty() {
        let left: [u64; 0] = [];
        let right: [u64; 0] = [];
        let mut output: [u64; 0] = [];

        pool_builder(4, 7).scope(|thread_pool| {
            thread_pool.add_slices(&left, &right, &mut output);
        });
    }

    #[test]
    fn test_add_chunk_larger_than_input() {
        let left = [1u64, 2, 3, 4, 5];
        let right = [10u64, 20, 30, 40, 50];
        let mut output = [0u64; 5];

        pool_builder(4, 100).scope(|thread_pool| {
            thread_pool.add_slices(&left, &right, &mut output);
        });

        assert_eq!(output, [11, 22, 33, 44, 55]);
    }

    #[test]
    fn test_add_slices_convenience() {
        let left = (0..1000u64).collect::<Vec<_>>();
        let right = (0..1000u64).map(|x| x * 9).collect::<Vec<_>>();

        let output = add_slices(&left, &right, NonZeroUsize::try_from(37).unwrap());

        for (i, &x) in output.iter().enumerate() {
            assert_eq!(x, 10 * i as u64);
        }
    }
}
