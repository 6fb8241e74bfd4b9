// Fixed-capacity sliding window of the most recent samples
//
// Per-channel ring storage with an aligned timestamp track. Pushing `n`
// samples discards the oldest `n`; pushing at least `capacity` samples
// replaces the window with the newest `capacity`. Readers never see the ring:
// they get a chronological `WindowSnapshot` in which index `capacity - 1` is
// the newest sample.

use crate::config::StreamConfig;
use crate::streaming::source::SampleBatch;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SlidingWindowBuffer {
    num_channels: usize,
    capacity: usize,
    /// values[channel][slot]
    values: Vec<Vec<f64>>,
    timestamps: Vec<f64>,
    /// Next slot to overwrite. Once full, also the oldest slot.
    head: usize,
    filled: usize,
    total_pushed: u64,
}

impl SlidingWindowBuffer {
    /// Zero-initialised window. Panics on a zero capacity, which is a
    /// configuration bug rather than a runtime condition.
    pub fn new(num_channels: usize, capacity: usize) -> Self {
        assert!(capacity > 0, "window capacity must be non-zero");
        Self {
            num_channels,
            capacity,
            values: vec![vec![0.0; capacity]; num_channels],
            timestamps: vec![0.0; capacity],
            head: 0,
            filled: 0,
            total_pushed: 0,
        }
    }

    pub fn with_config(config: &StreamConfig) -> Self {
        Self::new(config.num_channels, config.window_capacity())
    }

    /// Append a batch, evicting the oldest samples
    pub fn push(&mut self, batch: &SampleBatch) {
        let n = batch.len();
        if n == 0 {
            return;
        }

        debug_assert_eq!(batch.num_channels, self.num_channels);
        self.total_pushed += n as u64;

        if n >= self.capacity {
            let newest = &batch.samples[n - self.capacity..];
            for (slot, sample) in newest.iter().enumerate() {
                self.write_slot(slot, &sample.values, sample.timestamp);
            }
            self.head = 0;
            self.filled = self.capacity;
            return;
        }

        for sample in &batch.samples {
            self.write_slot(self.head, &sample.values, sample.timestamp);
            self.head = (self.head + 1) % self.capacity;
        }
        self.filled = (self.filled + n).min(self.capacity);
    }

    fn write_slot(&mut self, slot: usize, values: &[f64], timestamp: f64) {
        for (channel, column) in self.values.iter_mut().enumerate() {
            column[slot] = values.get(channel).copied().unwrap_or(0.0);
        }
        self.timestamps[slot] = timestamp;
    }

    /// Ring slot holding the chronologically `i`-th real sample
    fn slot(&self, i: usize) -> usize {
        if self.filled < self.capacity {
            i
        } else {
            (self.head + i) % self.capacity
        }
    }

    /// Immutable chronological copy of the window
    pub fn snapshot(&self) -> WindowSnapshot {
        let pad = self.capacity - self.filled;
        let mut values = vec![vec![0.0; self.capacity]; self.num_channels];
        let mut timestamps = vec![0.0; self.capacity];

        for i in 0..self.filled {
            let slot = self.slot(i);
            timestamps[pad + i] = self.timestamps[slot];
            for (channel, column) in values.iter_mut().enumerate() {
                column[pad + i] = self.values[channel][slot];
            }
        }

        WindowSnapshot {
            num_channels: self.num_channels,
            capacity: self.capacity,
            filled: self.filled,
            total_pushed: self.total_pushed,
            values,
            timestamps,
        }
    }

    pub fn oldest_timestamp(&self) -> Option<f64> {
        (self.filled > 0).then(|| self.timestamps[self.slot(0)])
    }

    pub fn newest_timestamp(&self) -> Option<f64> {
        (self.filled > 0).then(|| self.timestamps[self.slot(self.filled - 1)])
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Hand the buffer to a single writer and any number of snapshot readers
    pub fn into_shared(self) -> (WindowWriter, WindowReader) {
        let inner = Arc::new(RwLock::new(self));
        (
            WindowWriter {
                inner: Arc::clone(&inner),
            },
            WindowReader { inner },
        )
    }
}

/// Chronological, read-only view of a window
///
/// Arrays are always `capacity` long. The real samples occupy the trailing
/// `filled` slots; leading slots of a window that has not filled up yet are
/// zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub num_channels: usize,
    pub capacity: usize,
    pub filled: usize,
    /// Samples ever pushed into the window
    pub total_pushed: u64,
    /// values[channel][index]
    pub values: Vec<Vec<f64>>,
    pub timestamps: Vec<f64>,
}

impl WindowSnapshot {
    /// Index of the oldest real sample
    pub fn first_index(&self) -> usize {
        self.capacity - self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn oldest_timestamp(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.timestamps[self.first_index()])
    }

    pub fn newest_timestamp(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.timestamps[self.capacity - 1])
    }

    /// Timestamps of the real samples only
    pub fn real_timestamps(&self) -> &[f64] {
        &self.timestamps[self.first_index()..]
    }

    pub fn channel(&self, channel: usize) -> Option<&[f64]> {
        self.values
            .get(channel)
            .map(|column| &column[self.first_index()..])
    }

    /// First window index whose timestamp is at or after `t`
    pub fn index_at_or_after(&self, t: f64) -> Option<usize> {
        let real = self.real_timestamps();
        let offset = real.partition_point(|&ts| ts < t);
        (offset < real.len()).then(|| self.first_index() + offset)
    }

    /// Window index range `[start, end)` covering timestamps in `[from, to]`
    pub fn index_range(&self, from: f64, to: f64) -> std::ops::Range<usize> {
        let real = self.real_timestamps();
        let start = real.partition_point(|&ts| ts < from);
        let end = real.partition_point(|&ts| ts <= to).max(start);
        let base = self.first_index();
        (base + start)..(base + end)
    }
}

/// Exclusive mutation handle, held by the acquisition loop
pub struct WindowWriter {
    inner: Arc<RwLock<SlidingWindowBuffer>>,
}

impl WindowWriter {
    pub fn push(&self, batch: &SampleBatch) {
        self.inner.write().push(batch);
    }

    pub fn reader(&self) -> WindowReader {
        WindowReader {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Shared read handle; only ever yields snapshots
#[derive(Clone)]
pub struct WindowReader {
    inner: Arc<RwLock<SlidingWindowBuffer>>,
}

impl WindowReader {
    pub fn snapshot(&self) -> WindowSnapshot {
        self.inner.read().snapshot()
    }

    pub fn oldest_timestamp(&self) -> Option<f64> {
        self.inner.read().oldest_timestamp()
    }

    pub fn newest_timestamp(&self) -> Option<f64> {
        self.inner.read().newest_timestamp()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::source::Sample;

    /// Batch of single-channel samples where value == timestamp
    fn batch(range: std::ops::Range<u32>) -> SampleBatch {
        SampleBatch::new(
            1,
            range
                .map(|i| Sample::new(vec![i as f64], i as f64))
                .collect(),
        )
    }

    #[test]
    fn test_empty_push_is_noop() {
        let mut window = SlidingWindowBuffer::new(1, 4);
        window.push(&batch(0..3));
        let before = window.snapshot();
        window.push(&SampleBatch::empty(1));
        assert_eq!(window.snapshot(), before);
    }

    #[test]
    fn test_partial_fill_pads_front() {
        let mut window = SlidingWindowBuffer::new(1, 5);
        window.push(&batch(10..13));

        let snap = window.snapshot();
        assert_eq!(snap.filled, 3);
        assert_eq!(snap.timestamps, vec![0.0, 0.0, 10.0, 11.0, 12.0]);
        assert_eq!(snap.oldest_timestamp(), Some(10.0));
        assert_eq!(snap.newest_timestamp(), Some(12.0));
        assert_eq!(snap.channel(0).unwrap(), &[10.0, 11.0, 12.0]);
    }

    #[test]
    fn test_push_into_full_evicts_oldest_n() {
        let mut window = SlidingWindowBuffer::new(1, 5);
        window.push(&batch(0..5));
        window.push(&batch(5..7));

        let snap = window.snapshot();
        assert_eq!(snap.timestamps, vec![2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(snap.timestamps[snap.capacity - 1], 6.0);
    }

    #[test]
    fn test_many_small_pushes_keep_order() {
        let mut window = SlidingWindowBuffer::new(1, 7);
        for start in (0..40).step_by(3) {
            window.push(&batch(start..start + 3));
        }
        // Last pushed timestamp is 41
        let snap = window.snapshot();
        assert_eq!(snap.timestamps, vec![35.0, 36.0, 37.0, 38.0, 39.0, 40.0, 41.0]);
        assert_eq!(snap.values[0], snap.timestamps);
    }

    #[test]
    fn test_oversized_push_replaces_window() {
        let mut window = SlidingWindowBuffer::new(1, 4);
        window.push(&batch(0..2));
        window.push(&batch(100..110));

        let snap = window.snapshot();
        assert_eq!(snap.filled, 4);
        assert_eq!(snap.timestamps, vec![106.0, 107.0, 108.0, 109.0]);

        // Subsequent pushes continue from the replaced state
        window.push(&batch(110..111));
        assert_eq!(
            window.snapshot().timestamps,
            vec![107.0, 108.0, 109.0, 110.0]
        );
    }

    #[test]
    fn test_exact_capacity_push() {
        let mut window = SlidingWindowBuffer::new(1, 3);
        window.push(&batch(0..1));
        window.push(&batch(5..8));
        assert_eq!(window.snapshot().timestamps, vec![5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_multi_channel_alignment() {
        let mut window = SlidingWindowBuffer::new(2, 3);
        let samples = (0..4)
            .map(|i| Sample::new(vec![i as f64, -(i as f64)], i as f64 * 0.5))
            .collect();
        window.push(&SampleBatch::new(2, samples));

        let snap = window.snapshot();
        assert_eq!(snap.values[0], vec![1.0, 2.0, 3.0]);
        assert_eq!(snap.values[1], vec![-1.0, -2.0, -3.0]);
        assert_eq!(snap.timestamps, vec![0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_index_lookup() {
        let mut window = SlidingWindowBuffer::new(1, 6);
        window.push(&batch(10..14));
        let snap = window.snapshot();

        // Real samples live at indices 2..6
        assert_eq!(snap.index_at_or_after(9.0), Some(2));
        assert_eq!(snap.index_at_or_after(11.5), Some(4));
        assert_eq!(snap.index_at_or_after(13.0), Some(5));
        assert_eq!(snap.index_at_or_after(13.5), None);
        assert_eq!(snap.index_range(11.0, 12.0), 3..5);
        assert_eq!(snap.index_range(20.0, 30.0), 6..6);
    }

    #[test]
    fn test_with_config_capacity() {
        let config = StreamConfig {
            sampling_rate: 100.0,
            window_seconds: 2.0,
            guard_margin: 25,
            num_channels: 3,
            ..Default::default()
        };
        let window = SlidingWindowBuffer::with_config(&config);
        assert_eq!(window.capacity(), 225);
        assert_eq!(window.num_channels(), 3);
    }

    #[test]
    fn test_shared_reader_sees_writer_pushes() {
        let (writer, reader) = SlidingWindowBuffer::new(1, 3).into_shared();
        assert!(reader.is_empty());

        writer.push(&batch(0..2));
        let snap = reader.snapshot();
        writer.push(&batch(2..5));

        // Earlier snapshot is unaffected by later pushes
        assert_eq!(snap.filled, 2);
        assert_eq!(reader.snapshot().timestamps, vec![2.0, 3.0, 4.0]);
        assert_eq!(reader.oldest_timestamp(), Some(2.0));
    }
}
