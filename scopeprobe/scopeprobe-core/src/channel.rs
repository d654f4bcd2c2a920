//! Bounded, non-blocking event channel.
//!
//! A multi-producer, single-consumer ring of fixed-size records with BPF ring
//! buffer semantics: producers reserve a slot, fill it, then submit or
//! discard it. Reservation fails immediately when the ring is full and the
//! record is lost; nothing blocks and nothing is retried.
//!
//! Records are delivered in reservation order. A slot that is reserved but
//! not yet committed holds back everything behind it, as in the kernel ring
//! buffer, so a [`Reservation`] that is dropped without an explicit decision
//! is discarded rather than left pending.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::Pod;
use log::{debug, trace};
use scopeprobe_common::RINGBUF_HEADER_BYTES;

use crate::error::ProbeError;
use crate::table::{read_words, write_words};

const DISCARD_BIT: u64 = 1;

/// Commit marker for a slot: the lap-unique position plus a discard flag, so
/// a marker left over from a previous lap never reads as committed.
#[inline]
fn marker(pos: u64, discarded: bool) -> u64 {
    ((pos + 1) << 1) | discarded as u64 * DISCARD_BIT
}

pub struct EventChannel<T> {
    name: &'static str,
    capacity: u64,
    record_words: usize,
    words: Box<[AtomicU64]>,
    commits: Box<[AtomicU64]>,
    head: AtomicU64,
    tail: AtomicU64,
    consumer_taken: AtomicBool,
    submitted: AtomicU64,
    discarded: AtomicU64,
    dropped: AtomicU64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Pod> EventChannel<T> {
    /// Size the ring the way a BPF ring buffer of `bytes` bytes would be:
    /// each record costs its size rounded up to 8 plus an 8-byte header.
    pub fn with_byte_size(name: &'static str, bytes: usize) -> Result<Self, ProbeError> {
        let record_bytes = Self::record_bytes();
        let records = bytes / record_bytes;
        if records == 0 {
            return Err(ProbeError::ChannelTooSmall {
                what: name,
                bytes,
                record_bytes,
            });
        }
        Self::with_record_capacity(name, records)
    }

    pub fn with_record_capacity(name: &'static str, records: usize) -> Result<Self, ProbeError> {
        if records == 0 {
            return Err(ProbeError::ZeroCapacity { what: name });
        }
        let record_words = std::mem::size_of::<T>().div_ceil(8).max(1);
        let total_words = records
            .checked_mul(record_words)
            .ok_or(ProbeError::CapacityOverflow {
                what: name,
                value: records,
            })?;

        debug!("channel {}: {} records of {} bytes", name, records, record_words * 8);

        Ok(Self {
            name,
            capacity: records as u64,
            record_words,
            words: (0..total_words).map(|_| AtomicU64::new(0)).collect(),
            commits: (0..records).map(|_| AtomicU64::new(0)).collect(),
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            consumer_taken: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            _marker: PhantomData,
        })
    }

    /// Bytes one record occupies in a BPF ring buffer.
    pub fn record_bytes() -> usize {
        RINGBUF_HEADER_BYTES + std::mem::size_of::<T>().div_ceil(8) * 8
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Claim the next slot, or `None` when the ring is full. A failed
    /// reservation is counted as a dropped event.
    pub fn reserve(&self) -> Option<Reservation<'_, T>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if head.wrapping_sub(tail) >= self.capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("channel {}: full, dropping record", self.name);
                return None;
            }
            match self.head.compare_exchange_weak(
                head,
                head + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }

        let reservation = Reservation {
            channel: self,
            pos: head,
            done: false,
        };
        reservation.write(&T::zeroed());
        Some(reservation)
    }

    /// Reserve, write and submit in one step. Returns `false` if the record
    /// was dropped.
    pub fn output(&self, record: &T) -> bool {
        match self.reserve() {
            Some(reservation) => {
                reservation.write(record);
                reservation.submit();
                true
            }
            None => false,
        }
    }

    /// Hand out the single consumer. Subsequent calls return `None`.
    pub fn consumer(self: &Arc<Self>) -> Option<ChannelConsumer<T>> {
        if self.consumer_taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(ChannelConsumer {
            channel: Arc::clone(self),
        })
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Reserved records the consumer has not taken yet.
    pub fn pending(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) as usize
    }

    fn slot_index(&self, pos: u64) -> usize {
        (pos % self.capacity) as usize
    }

    fn slot_words(&self, pos: u64) -> &[AtomicU64] {
        let start = self.slot_index(pos) * self.record_words;
        &self.words[start..start + self.record_words]
    }

    fn commit(&self, pos: u64, discarded: bool) {
        self.commits[self.slot_index(pos)].store(marker(pos, discarded), Ordering::Release);
        if discarded {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.submitted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl<T> fmt::Debug for EventChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("submitted", &self.submitted.load(Ordering::Relaxed))
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

/// An exclusively owned slot in the ring.
pub struct Reservation<'a, T: Pod> {
    channel: &'a EventChannel<T>,
    pos: u64,
    done: bool,
}

impl<T: Pod> Reservation<'_, T> {
    pub fn write(&self, record: &T) {
        write_words(self.channel.slot_words(self.pos), record);
    }

    pub fn submit(mut self) {
        self.done = true;
        self.channel.commit(self.pos, false);
    }

    pub fn discard(mut self) {
        self.done = true;
        self.channel.commit(self.pos, true);
    }
}

impl<T: Pod> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if !self.done {
            self.channel.commit(self.pos, true);
        }
    }
}

/// The draining end of an [`EventChannel`].
pub struct ChannelConsumer<T: Pod> {
    channel: Arc<EventChannel<T>>,
}

impl<T: Pod> ChannelConsumer<T> {
    /// Next committed record, or `None` if the ring is empty or the oldest
    /// reservation is still being filled.
    pub fn poll(&mut self) -> Option<T> {
        let channel = &self.channel;
        loop {
            let tail = channel.tail.load(Ordering::Relaxed);
            if tail == channel.head.load(Ordering::Acquire) {
                return None;
            }
            let commit = channel.commits[channel.slot_index(tail)].load(Ordering::Acquire);
            if commit == marker(tail, false) {
                let record = read_words(channel.slot_words(tail));
                channel.tail.store(tail + 1, Ordering::Release);
                return Some(record);
            }
            if commit == marker(tail, true) {
                channel.tail.store(tail + 1, Ordering::Release);
                continue;
            }
            return None;
        }
    }

    /// Everything currently deliverable, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        std::iter::from_fn(|| self.poll()).collect()
    }

    pub fn pending(&self) -> usize {
        self.channel.pending()
    }

    pub fn channel(&self) -> &EventChannel<T> {
        &self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopeprobe_common::{FunctionEvent, LifecycleEvent};
    use std::thread;

    fn event(pid: u32, duration_ns: u64) -> FunctionEvent {
        FunctionEvent {
            pid,
            _pad: 0,
            duration_ns,
        }
    }

    #[test]
    fn byte_size_accounts_for_headers() {
        assert_eq!(EventChannel::<FunctionEvent>::record_bytes(), 24);
        let channel = EventChannel::<FunctionEvent>::with_byte_size("fn", 24 * 10 + 5).unwrap();
        assert_eq!(channel.capacity(), 10);

        let lifecycle =
            EventChannel::<LifecycleEvent>::with_byte_size("lc", 256 * 1024).unwrap();
        assert_eq!(
            lifecycle.capacity(),
            256 * 1024 / EventChannel::<LifecycleEvent>::record_bytes()
        );
        assert!(EventChannel::<FunctionEvent>::with_byte_size("tiny", 16).is_err());
    }

    #[test]
    fn records_are_delivered_in_order() {
        let channel = Arc::new(EventChannel::with_record_capacity("fn", 4).unwrap());
        let mut consumer = channel.consumer().unwrap();
        assert!(channel.consumer().is_none(), "consumer is single");

        for i in 0..3 {
            assert!(channel.output(&event(i, u64::from(i) * 10)));
        }
        let drained = consumer.drain();
        assert_eq!(drained, vec![event(0, 0), event(1, 10), event(2, 20)]);
        assert!(consumer.poll().is_none());
        assert_eq!(channel.submitted(), 3);
    }

    #[test]
    fn full_ring_drops_without_disturbing_queued_records() {
        let channel = Arc::new(EventChannel::with_record_capacity("fn", 2).unwrap());
        assert!(channel.output(&event(1, 1)));
        assert!(channel.output(&event(2, 2)));
        assert!(!channel.output(&event(3, 3)));
        assert_eq!(channel.dropped(), 1);

        let mut consumer = channel.consumer().unwrap();
        assert_eq!(consumer.drain(), vec![event(1, 1), event(2, 2)]);

        // Space is reclaimed once drained.
        assert!(channel.output(&event(4, 4)));
        assert_eq!(consumer.poll(), Some(event(4, 4)));
    }

    #[test]
    fn uncommitted_slot_holds_back_later_records() {
        let channel = Arc::new(EventChannel::with_record_capacity("fn", 4).unwrap());
        let mut consumer = channel.consumer().unwrap();

        let first = channel.reserve().unwrap();
        assert!(channel.output(&event(2, 2)));
        assert_eq!(consumer.poll(), None);

        first.write(&event(1, 1));
        first.submit();
        assert_eq!(consumer.drain(), vec![event(1, 1), event(2, 2)]);
    }

    #[test]
    fn discarded_and_abandoned_reservations_are_skipped() {
        let channel = Arc::new(EventChannel::with_record_capacity("fn", 4).unwrap());
        let mut consumer = channel.consumer().unwrap();

        channel.reserve().unwrap().discard();
        {
            let abandoned = channel.reserve().unwrap();
            abandoned.write(&event(9, 9));
        }
        assert!(channel.output(&event(3, 3)));

        assert_eq!(consumer.drain(), vec![event(3, 3)]);
        assert_eq!(channel.discarded(), 2);
        assert_eq!(channel.pending(), 0);
    }

    #[test]
    fn wraps_many_laps() {
        let channel = Arc::new(EventChannel::with_record_capacity("fn", 3).unwrap());
        let mut consumer = channel.consumer().unwrap();
        for i in 0..100u32 {
            assert!(channel.output(&event(i, 0)));
            assert_eq!(consumer.poll().map(|e| e.pid), Some(i));
        }
    }

    #[test]
    fn concurrent_producers_never_exceed_capacity() {
        let channel = Arc::new(EventChannel::with_record_capacity("fn", 64).unwrap());
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let channel = Arc::clone(&channel);
                thread::spawn(move || {
                    for i in 0..100u32 {
                        channel.output(&event(t * 1000 + i, 0));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut consumer = channel.consumer().unwrap();
        let drained = consumer.drain();
        assert_eq!(drained.len(), 64);
        assert_eq!(channel.submitted(), 64);
        assert_eq!(channel.dropped(), 400 - 64);
    }
}
