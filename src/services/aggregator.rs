//! Fixed-size block aggregation of incoming samples.

use crate::error::{PipelineError, Result};
use crate::types::Sample;

/// Buffers consecutive samples into non-overlapping blocks of `block_size`.
#[derive(Debug)]
pub struct BlockAggregator {
    block_size: usize,
    block: Vec<Sample>,
}

impl BlockAggregator {
    /// Create an aggregator. `block_size` must be at least 1.
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(PipelineError::invalid("block_size", "must be >= 1"));
        }
        Ok(Self {
            block_size,
            block: Vec::with_capacity(block_size),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Append a sample. A full block that was not drained is superseded.
    pub fn add(&mut self, sample: Sample) {
        if self.block.len() == self.block_size {
            self.block.clear();
        }
        self.block.push(sample);
    }

    /// True iff exactly `block_size` samples are buffered.
    pub fn is_ready(&self) -> bool {
        self.block.len() == self.block_size
    }

    /// The ready block, left in place.
    pub fn drain(&self) -> Option<&[Sample]> {
        if self.is_ready() {
            Some(&self.block)
        } else {
            None
        }
    }

    /// Take the ready block and clear the buffer.
    pub fn drain_and_reset(&mut self) -> Option<Vec<Sample>> {
        if !self.is_ready() {
            return None;
        }
        Some(std::mem::replace(
            &mut self.block,
            Vec::with_capacity(self.block_size),
        ))
    }

    /// Drop a partially filled block.
    pub fn discard(&mut self) -> usize {
        let dropped = self.block.len();
        self.block.clear();
        dropped
    }

    /// Number of buffered samples.
    pub fn len(&self) -> usize {
        self.block.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }
}
