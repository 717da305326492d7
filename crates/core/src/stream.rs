//! Fixed-capacity sample ring between the front-end and the PHY.
//!
//! The front-end is a real-time source and cannot be paused, so a full ring
//! overwrites its oldest samples instead of pushing back on the writer.

use std::collections::VecDeque;

use crate::types::Sample;

#[derive(Debug)]
pub struct SampleStream {
    buf: VecDeque<Sample>,
    capacity: usize,
    overruns: u64,
    written: u64,
}

impl SampleStream {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            overruns: 0,
            written: 0,
        }
    }

    /// Appends samples, returning how many old samples were overwritten.
    pub fn push_slice(&mut self, samples: &[Sample]) -> usize {
        self.written += samples.len() as u64;

        // Only the newest `capacity` samples of an oversized block can survive.
        let keep = if samples.len() > self.capacity {
            &samples[samples.len() - self.capacity..]
        } else {
            samples
        };
        let mut dropped = samples.len() - keep.len();

        let free = self.capacity - self.buf.len();
        if keep.len() > free {
            let evict = keep.len() - free;
            self.buf.drain(..evict);
            dropped += evict;
        }
        self.buf.extend(keep.iter().copied());

        self.overruns += dropped as u64;
        dropped
    }

    /// Moves up to `max` samples, oldest first, into `out`.
    pub fn pop_into(&mut self, out: &mut Vec<Sample>, max: usize) -> usize {
        let n = max.min(self.buf.len());
        out.extend(self.buf.drain(..n));
        n
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Total samples dropped because the reader fell behind.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    pub fn total_written(&self) -> u64 {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(range: std::ops::Range<u32>) -> Vec<Sample> {
        range.map(|i| Sample::new(i as f32, 0.0)).collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut stream = SampleStream::new(8);
        assert_eq!(stream.push_slice(&ramp(0..5)), 0);

        let mut out = Vec::new();
        assert_eq!(stream.pop_into(&mut out, 3), 3);
        assert_eq!(out, ramp(0..3));
        assert_eq!(stream.len(), 2);
    }

    #[test]
    fn test_overwrites_oldest_when_full() {
        let mut stream = SampleStream::new(4);
        stream.push_slice(&ramp(0..3));
        assert_eq!(stream.push_slice(&ramp(3..6)), 2);
        assert_eq!(stream.overruns(), 2);

        let mut out = Vec::new();
        stream.pop_into(&mut out, usize::MAX);
        assert_eq!(out, ramp(2..6));
    }

    #[test]
    fn test_oversized_block_keeps_newest() {
        let mut stream = SampleStream::new(4);
        stream.push_slice(&ramp(0..2));
        let dropped = stream.push_slice(&ramp(2..12));
        assert_eq!(dropped, 8);
        assert_eq!(stream.total_written(), 12);

        let mut out = Vec::new();
        stream.pop_into(&mut out, 10);
        assert_eq!(out, ramp(8..12));
        assert!(stream.is_empty());
    }
}
