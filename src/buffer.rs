//! Bounded, time-ordered sample buffers shared between one producer and the
//! fusion engine.
//!
//! Producers never block: a full buffer evicts its oldest entry. The consumer
//! drains everything up to a local time with [`SampleBuffer::pop_due`].

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::types::{SourceKind, Timestamped};

struct BufferInner<T> {
    samples: VecDeque<T>,
    /// Largest timestamp ever pushed (survives pops)
    newest_seen: Option<f64>,
    evicted: u64,
    closed: bool,
}

pub struct SampleBuffer<T> {
    kind: SourceKind,
    capacity: usize,
    inner: Mutex<BufferInner<T>>,
}

impl<T: Timestamped> SampleBuffer<T> {
    pub fn new(kind: SourceKind, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            kind,
            capacity,
            inner: Mutex::new(BufferInner {
                samples: VecDeque::with_capacity(capacity),
                newest_seen: None,
                evicted: 0,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert in timestamp order; returns the entry dropped to make room, if any.
    ///
    /// Samples with non-finite timestamps are handed straight back.
    pub fn push(&self, sample: T) -> Option<T> {
        let t = sample.timestamp();
        if !t.is_finite() {
            return Some(sample);
        }

        let mut inner = self.lock();
        let idx = inner.samples.partition_point(|s| s.timestamp() <= t);
        inner.samples.insert(idx, sample);
        inner.newest_seen = Some(inner.newest_seen.map_or(t, |n| n.max(t)));

        if inner.samples.len() > self.capacity {
            inner.evicted += 1;
            inner.samples.pop_front()
        } else {
            None
        }
    }

    /// Remove and return every sample with timestamp <= `upto`, oldest first.
    pub fn pop_due(&self, upto: f64) -> Vec<T> {
        let mut inner = self.lock();
        let n = inner.samples.partition_point(|s| s.timestamp() <= upto);
        inner.samples.drain(..n).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    /// Timestamp of the oldest entry still waiting
    pub fn oldest_pending(&self) -> Option<f64> {
        self.lock().samples.front().map(Timestamped::timestamp)
    }

    pub fn newest_seen(&self) -> Option<f64> {
        self.lock().newest_seen
    }

    /// Total entries dropped by the eviction policy
    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }

    /// Mark end-of-stream. Already buffered samples remain poppable.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Producer side of the wake-up channel.
///
/// Capacity one: a pending ring already means "look at the buffers", extra
/// rings are dropped instead of blocking the producer.
#[derive(Clone, Debug)]
pub struct Doorbell {
    tx: Sender<()>,
}

impl Doorbell {
    pub fn ring(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Consumer side of the wake-up channel.
#[derive(Debug)]
pub struct DoorbellListener {
    rx: Receiver<()>,
}

impl DoorbellListener {
    /// Block until rung or until `timeout` passes. Returns true if rung.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                false
            }
        }
    }
}

pub fn doorbell() -> (Doorbell, DoorbellListener) {
    let (tx, rx) = channel::bounded(1);
    (Doorbell { tx }, DoorbellListener { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InertialSample;
    use std::sync::Arc;

    fn sample(t: f64) -> InertialSample {
        InertialSample::planar(t, 0.0, 0.0, t)
    }

    fn times(samples: &[InertialSample]) -> Vec<f64> {
        samples.iter().map(|s| s.t_local).collect()
    }

    #[test]
    fn test_capacity_plus_one_evicts_oldest() {
        let buffer = SampleBuffer::new(SourceKind::Inertial, 4);
        for i in 0..4 {
            assert!(buffer.push(sample(i as f64)).is_none());
        }
        let evicted = buffer.push(sample(4.0)).expect("full buffer must evict");

        assert_eq!(evicted.t_local, 0.0);
        assert_eq!(evicted.acc_x, 0.0);
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.evicted(), 1);
        assert_eq!(times(&buffer.pop_due(f64::INFINITY)), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_pop_due_is_inclusive_and_ordered() {
        let buffer = SampleBuffer::new(SourceKind::Inertial, 16);
        for t in [0.3, 0.1, 0.2, 0.5, 0.4] {
            buffer.push(sample(t));
        }

        let due = buffer.pop_due(0.3);
        assert_eq!(times(&due), vec![0.1, 0.2, 0.3]);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.oldest_pending(), Some(0.4));
        assert_eq!(buffer.newest_seen(), Some(0.5));
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let buffer = SampleBuffer::new(SourceKind::Inertial, 8);
        buffer.push(InertialSample::planar(1.0, 0.0, 0.0, 0.5));
        buffer.push(InertialSample::planar(2.0, 0.0, 0.0, 0.5));
        let due = buffer.pop_due(0.5);
        assert_eq!(due[0].acc_x, 1.0);
        assert_eq!(due[1].acc_x, 2.0);
    }

    #[test]
    fn test_late_sample_older_than_everything_is_the_one_evicted() {
        let buffer = SampleBuffer::new(SourceKind::Inertial, 2);
        buffer.push(sample(1.0));
        buffer.push(sample(2.0));
        let evicted = buffer.push(sample(0.5)).unwrap();
        assert_eq!(evicted.t_local, 0.5);
        assert_eq!(times(&buffer.pop_due(10.0)), vec![1.0, 2.0]);
    }

    #[test]
    fn test_non_finite_timestamp_rejected() {
        let buffer = SampleBuffer::new(SourceKind::Inertial, 2);
        assert!(buffer.push(sample(f64::NAN)).is_some());
        assert!(buffer.is_empty());
        assert_eq!(buffer.newest_seen(), None);
    }

    #[test]
    fn test_newest_seen_survives_pop() {
        let buffer = SampleBuffer::new(SourceKind::Inertial, 2);
        buffer.push(sample(3.0));
        buffer.pop_due(5.0);
        assert!(buffer.is_empty());
        assert_eq!(buffer.newest_seen(), Some(3.0));
    }

    #[test]
    fn test_close_keeps_pending_samples() {
        let buffer = SampleBuffer::new(SourceKind::Position, 2);
        buffer.push(sample(1.0));
        buffer.close();
        assert!(buffer.is_closed());
        assert_eq!(buffer.pop_due(1.0).len(), 1);
    }

    #[test]
    fn test_concurrent_producer_and_consumer() {
        let buffer = Arc::new(SampleBuffer::new(SourceKind::Inertial, 10_000));
        let producer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for i in 0..1000 {
                    buffer.push(sample(i as f64 * 0.01));
                }
            })
        };

        let mut drained = Vec::new();
        while drained.len() < 1000 {
            drained.extend(buffer.pop_due(f64::INFINITY));
        }
        producer.join().unwrap();

        assert!(drained.windows(2).all(|w| w[0].t_local <= w[1].t_local));
    }

    #[test]
    fn test_doorbell_never_blocks_producer() {
        let (bell, listener) = doorbell();
        bell.ring();
        bell.ring();
        bell.ring();
        assert!(listener.wait(Duration::from_millis(10)));
        assert!(!listener.wait(Duration::from_millis(10)));
    }
}
