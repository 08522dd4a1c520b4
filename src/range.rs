// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::macros::log_debug;
use crossbeam_utils::CachePadded;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A factory for handing out statically-scheduled chunks of indices to worker
/// threads.
///
/// The index range `0..num_elements` is partitioned into contiguous blocks of
/// `chunk_size` indices (the last block is shorter when `chunk_size` doesn't
/// divide the number of elements), and block `b` is owned by the worker thread
/// `b % num_threads`. The assignment is fully determined ahead of execution
/// and never rebalanced.
pub(crate) struct ChunkRangeFactory {
    /// Number of worker threads that iterate.
    num_threads: usize,
    /// Number of contiguous indices per block.
    chunk_size: usize,
    /// Total number of elements in the current round.
    num_elements: Arc<CachePadded<AtomicUsize>>,
}

// Here is a proof that the chunked ranges cover each index exactly once.
//
// Upon calling `ChunkRangeOrchestrator::reset_ranges(num_elements)`, a common
// `AtomicUsize` shared with all the `ChunkRange`s is updated to this number of
// elements. This update uses `Ordering::Relaxed`, which is fine because it's
// the caller's responsibility to ensure that the `reset_ranges()` call happens
// before calls to `range.iter()`.
//
// Each index `i` in `0..num_elements` belongs to exactly one block, number
// `i / chunk_size`, and each block to exactly one worker, number
// `(i / chunk_size) % num_threads`. The iterator of worker `id` visits the
// blocks `id, id + num_threads, id + 2 * num_threads, ...` in order, yielding
// each in-bounds index of each block once and truncating the last block at
// `num_elements`. The union over all workers is therefore exactly
// `0..num_elements`, with no index repeated.
impl ChunkRangeFactory {
    /// Creates a new factory for the given number of threads and block size.
    pub fn new(num_threads: usize, chunk_size: NonZeroUsize) -> Self {
        Self {
            num_threads,
            chunk_size: chunk_size.into(),
            num_elements: Arc::new(CachePadded::new(AtomicUsize::new(0))),
        }
    }

    /// Returns the orchestrator object for all the ranges created by this
    /// factory.
    pub fn orchestrator(self) -> ChunkRangeOrchestrator {
        ChunkRangeOrchestrator {
            num_elements: self.num_elements,
        }
    }

    /// Returns the range for the given thread.
    pub fn range(&self, thread_id: usize) -> ChunkRange {
        ChunkRange {
            id: thread_id,
            num_threads: self.num_threads,
            chunk_size: self.chunk_size,
            num_elements: self.num_elements.clone(),
        }
    }
}

/// An orchestrator for the ranges handed out by a [`ChunkRangeFactory`].
pub(crate) struct ChunkRangeOrchestrator {
    /// Total number of elements.
    num_elements: Arc<CachePadded<AtomicUsize>>,
}

impl ChunkRangeOrchestrator {
    /// Resets all the ranges to prepare a new computation round.
    pub fn reset_ranges(&self, num_elements: usize) {
        log_debug!("Resetting chunked ranges to {num_elements} elements");
        self.num_elements.store(num_elements, Ordering::Relaxed);
    }
}

/// The set of blocks owned by one worker thread.
pub(crate) struct ChunkRange {
    /// Index of the thread that owns this range.
    id: usize,
    /// Total number of threads.
    num_threads: usize,
    /// Number of contiguous indices per block.
    chunk_size: usize,
    /// Total number of elements.
    num_elements: Arc<CachePadded<AtomicUsize>>,
}

impl ChunkRange {
    /// Returns an iterator over the indices owned by this worker, in
    /// increasing order.
    pub fn iter(&self) -> ChunkIter {
        let num_elements = self.num_elements.load(Ordering::Relaxed);
        // Saturation only kicks in for block offsets already past any valid
        // `num_elements`, where the iterator is empty anyway.
        let block_start = self.id.saturating_mul(self.chunk_size);
        ChunkIter {
            next: block_start,
            block_start,
            stride: self.num_threads.saturating_mul(self.chunk_size),
            chunk_size: self.chunk_size,
            num_elements,
        }
    }
}

/// An iterator over the indices of the blocks owned by one worker thread.
pub(crate) struct ChunkIter {
    /// Next index to yield.
    next: usize,
    /// Start of the block containing `next`.
    block_start: usize,
    /// Distance between the starts of two successive blocks of this worker.
    stride: usize,
    /// Number of contiguous indices per block.
    chunk_size: usize,
    /// Total number of elements.
    num_elements: usize,
}

impl Iterator for ChunkIter {
    type Item = usize;

    #[inline(always)]
    fn next(&mut self) -> Option<usize> {
        loop {
            if self.block_start >= self.num_elements {
                return None;
            }
            // The last block is truncated at the number of elements.
            let block_end =
                usize::min(self.block_start.saturating_add(self.chunk_size), self.num_elements);
            if self.next < block_end {
                let index = self.next;
                self.next += 1;
                return Some(index);
            }
            self.block_start = self.block_start.saturating_add(self.stride);
            self.next = self.block_start;
        }
    }
}
