//! Micro-batch formation under dual triggers.

use std::time::{Duration, Instant};

/// Accumulates frame messages across cameras into one inference batch.
///
/// A batch is ready when it holds `batch_size` entries (throughput trigger)
/// or when `timeout` has elapsed since the last flush (latency trigger). The
/// timeout bounds per-frame latency when camera activity is low; readiness
/// on timeout holds even for an empty batch, so callers flush unconditionally
/// and skip the empty case.
pub struct MicroBatchAccumulator<T> {
    batch_size: usize,
    timeout: Duration,
    batch: Vec<T>,
    batch_start: Instant,
}

impl<T> MicroBatchAccumulator<T> {
    pub fn new(batch_size: usize, timeout: Duration) -> Self {
        assert!(batch_size > 0);
        MicroBatchAccumulator {
            batch_size,
            timeout,
            batch: Vec::with_capacity(batch_size),
            batch_start: Instant::now(),
        }
    }

    /// Add an entry. Returns true if the batch is now ready to flush.
    pub fn add(&mut self, item: T) -> bool {
        self.batch.push(item);
        self.is_ready()
    }

    pub fn is_ready(&self) -> bool {
        self.batch.len() >= self.batch_size || self.batch_start.elapsed() >= self.timeout
    }

    /// Take the accumulated entries and restart the latency clock.
    pub fn flush(&mut self) -> Vec<T> {
        self.batch_start = Instant::now();
        std::mem::take(&mut self.batch)
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

#[test]
fn test_size_trigger() {
    let mut acc = MicroBatchAccumulator::new(4, Duration::from_secs(3600));
    assert!(!acc.add(1));
    assert!(!acc.add(2));
    assert!(!acc.add(3));
    // Ready at exactly batch_size.
    assert!(acc.add(4));
    assert_eq!(acc.flush(), vec![1, 2, 3, 4]);
    assert!(!acc.is_ready());
}

#[test]
fn test_timeout_trigger_with_partial_batch() {
    let mut acc = MicroBatchAccumulator::new(4, Duration::from_millis(20));
    assert!(!acc.add(1));
    std::thread::sleep(Duration::from_millis(25));
    assert!(acc.is_ready());
    assert_eq!(acc.flush(), vec![1]);
}

#[test]
fn test_timeout_trigger_fires_even_when_empty() {
    let acc: MicroBatchAccumulator<u32> =
        MicroBatchAccumulator::new(4, Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(5));
    assert!(acc.is_ready());
}

#[test]
fn test_flush_resets_latency_clock() {
    let mut acc = MicroBatchAccumulator::new(4, Duration::from_millis(50));
    acc.add(1);
    std::thread::sleep(Duration::from_millis(60));
    assert!(acc.is_ready());
    acc.flush();
    acc.add(2);
    assert!(!acc.is_ready());
}
