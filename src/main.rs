// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Console program that fills two arrays with pseudo-random scaled values,
//! adds them element-wise on the chunked thread pool, and prints a prefix of
//! each array for visual verification.

use parsum::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};
use rand::Rng;
use std::num::NonZeroUsize;

/// Number of elements in each array.
const NUM_ELEMENTS: usize = 1000;
/// Number of contiguous indices that each worker processes per scheduling
/// unit.
const CHUNK_SIZE: usize = 100;
/// Number of leading values printed for verification.
const NUM_SHOWN: usize = 10;

fn main() {
    env_logger::init();

    println!("Checking the parallel runtime");
    let num_threads = match std::thread::available_parallelism() {
        Ok(num_threads) => {
            println!("Parallel runtime in place ({num_threads} threads available).");
            num_threads
        }
        Err(e) => {
            // Degraded run: nothing is computed, but this isn't an error.
            println!("Problem querying the parallel runtime: {e}");
            return;
        }
    };

    println!("Adding the arrays in parallel!");

    let mut rng = rand::rng();
    let mut left = vec![0.0f32; NUM_ELEMENTS];
    let mut right = vec![0.0f32; NUM_ELEMENTS];
    fill_scaled_inputs(&mut rng, &mut left, &mut right);

    let mut sum = vec![0.0f32; NUM_ELEMENTS];
    ThreadPoolBuilder {
        num_threads: ThreadCount::Count(num_threads),
        chunk_size: NonZeroUsize::try_from(CHUNK_SIZE).unwrap(),
        cpu_pinning: CpuPinningPolicy::IfSupported,
    }
    .scope(|thread_pool| {
        thread_pool.add_slices(&left, &right, &mut sum);
    });

    println!("Printing the first {NUM_SHOWN} values of the left array:");
    println!("{}", format_prefix(&left, NUM_SHOWN));
    println!("Printing the first {NUM_SHOWN} values of the right array:");
    println!("{}", format_prefix(&right, NUM_SHOWN));
    println!("Printing the first {NUM_SHOWN} values of the sum:");
    println!("{}", format_prefix(&sum, NUM_SHOWN));
}

/// Fills the two input arrays with values derived from each index, perturbed
/// by a random scale factor drawn from `rng` in the range `1..=10_000`.
///
/// Both arrays share the same scale factor at a given index.
fn fill_scaled_inputs<R: Rng>(rng: &mut R, left: &mut [f32], right: &mut [f32]) {
    debug_assert_eq!(left.len(), right.len());
    for i in 0..left.len() {
        let scale = rng.random_range(1..=10_000) as f32;
        left[i] = (i as f32 * 10.0) * scale;
        right[i] = ((i as f32 + 3.0) * 3.7) * scale;
    }
}

/// Formats the first `count` values of the given slice, dash-separated. Yields
/// the whole slice if it is shorter than `count`.
fn format_prefix(values: &[f32], count: usize) -> String {
    values
        .iter()
        .take(count)
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(" - ")
}
