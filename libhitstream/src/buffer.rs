use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use super::digi::Digi;

/// Heap entry. Ties in time are broken by insertion order so retrieval is deterministic.
#[derive(Debug, Clone, Copy)]
struct Entry {
    digi: Digi,
    seq: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.digi
            .time
            .total_cmp(&other.digi.time)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Buffer of digis ordered by time.
///
/// Inputs only need to be nearly ordered: a digi older than what was already retrieved is
/// accepted and counted as a late arrival. The buffer never drops anything by itself.
#[derive(Debug, Default)]
pub struct TimeOrderedBuffer {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    latest: Option<f64>,
    watermark: Option<f64>,
    late_arrivals: u64,
}

impl TimeOrderedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, digi: Digi) {
        self.latest = Some(match self.latest {
            Some(latest) => latest.max(digi.time),
            None => digi.time,
        });
        self.heap.push(Reverse(Entry {
            digi,
            seq: self.next_seq,
        }));
        self.next_seq += 1;
    }

    pub fn insert(&mut self, digi: Digi) {
        if self.watermark.is_some_and(|mark| digi.time < mark) {
            self.late_arrivals += 1;
        }
        self.push(digi);
    }

    pub fn extend<I: IntoIterator<Item = Digi>>(&mut self, digis: I) {
        for digi in digis {
            self.insert(digi);
        }
    }

    /// Put back digis which were taken out but not used. Not counted as late arrivals.
    pub fn requeue<I: IntoIterator<Item = Digi>>(&mut self, digis: I) {
        for digi in digis {
            self.push(digi);
        }
    }

    /// Remove and yield, in ascending time, every digi with time <= cutoff.
    ///
    /// Like `Vec::drain`, dropping the iterator early still removes the remaining matches.
    pub fn retrieve_up_to(&mut self, cutoff: f64) -> RetrieveUpTo<'_> {
        RetrieveUpTo {
            buffer: self,
            cutoff,
        }
    }

    pub fn peek_front(&self) -> Option<&Digi> {
        self.heap.peek().map(|Reverse(entry)| &entry.digi)
    }

    pub fn pop_front(&mut self) -> Option<Digi> {
        let Reverse(entry) = self.heap.pop()?;
        self.watermark = Some(match self.watermark {
            Some(mark) => mark.max(entry.digi.time),
            None => entry.digi.time,
        });
        if self.heap.is_empty() {
            self.latest = None;
        }
        Some(entry.digi)
    }

    pub fn size(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn earliest_time(&self) -> Option<f64> {
        self.peek_front().map(|digi| digi.time)
    }

    pub fn latest_time(&self) -> Option<f64> {
        self.latest
    }

    /// Time of the latest digi handed out so far
    pub fn watermark(&self) -> Option<f64> {
        self.watermark
    }

    pub fn late_arrivals(&self) -> u64 {
        self.late_arrivals
    }
}

/// Iterator returned by [`TimeOrderedBuffer::retrieve_up_to`]
#[derive(Debug)]
pub struct RetrieveUpTo<'a> {
    buffer: &'a mut TimeOrderedBuffer,
    cutoff: f64,
}

impl Iterator for RetrieveUpTo<'_> {
    type Item = Digi;

    fn next(&mut self) -> Option<Digi> {
        match self.buffer.earliest_time() {
            Some(time) if time <= self.cutoff => self.buffer.pop_front(),
            _ => None,
        }
    }
}

impl Drop for RetrieveUpTo<'_> {
    fn drop(&mut self) {
        for _ in self.by_ref() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware_id::Side;
    use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

    fn digi_at(time: f64) -> Digi {
        Digi::new(0, 0, Side::A, time, 1.0)
    }

    fn times(digis: &[Digi]) -> Vec<f64> {
        digis.iter().map(|d| d.time).collect()
    }

    #[test]
    fn test_retrieve_up_to_cutoff() {
        let mut buffer = TimeOrderedBuffer::new();
        buffer.extend([5.0, 3.0, 9.0, 1.0].map(digi_at));
        let out: Vec<Digi> = buffer.retrieve_up_to(6.0).collect();
        assert_eq!(times(&out), vec![1.0, 3.0, 5.0]);
        assert_eq!(buffer.size(), 1);
        assert_eq!(buffer.earliest_time(), Some(9.0));
        assert_eq!(buffer.latest_time(), Some(9.0));
    }

    #[test]
    fn test_retrieved_digis_are_not_returned_again() {
        let mut buffer = TimeOrderedBuffer::new();
        buffer.extend([2.0, 4.0].map(digi_at));
        assert_eq!(buffer.retrieve_up_to(10.0).count(), 2);
        assert_eq!(buffer.retrieve_up_to(10.0).count(), 0);
        assert!(buffer.is_empty());
        assert_eq!(buffer.latest_time(), None);
    }

    #[test]
    fn test_empty_buffer_yields_nothing() {
        let mut buffer = TimeOrderedBuffer::new();
        assert_eq!(buffer.retrieve_up_to(f64::MAX).next(), None);
        assert_eq!(buffer.earliest_time(), None);
        assert_eq!(buffer.pop_front(), None);
    }

    #[test]
    fn test_nearly_ordered_input_is_sorted_subset() {
        // Each block of 4 is shuffled, blocks arrive in order
        let mut buffer = TimeOrderedBuffer::new();
        let mut inserted = Vec::new();
        for block in 0..50 {
            let base = block as f64 * 4.0;
            for offset in [2.0, 0.0, 3.0, 1.0] {
                inserted.push(base + offset);
                buffer.insert(digi_at(base + offset));
            }
        }
        let cutoff = 101.5;
        let out = times(&buffer.retrieve_up_to(cutoff).collect::<Vec<_>>());
        let mut expected: Vec<f64> = inserted.iter().copied().filter(|t| *t <= cutoff).collect();
        expected.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(out, expected);
        assert!(buffer.earliest_time().is_some_and(|t| t > cutoff));
    }

    #[test]
    fn test_random_local_disorder_retrieves_each_digi_once() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..20 {
            let n = 400;
            let max_disorder = rng.gen_range(1..16);
            let mut arrival: Vec<f64> = (0..n).map(|i| i as f64 * 0.25).collect();
            let mut start = 0;
            while start < n {
                let len = rng.gen_range(1..=max_disorder).min(n - start);
                arrival[start..start + len].shuffle(&mut rng);
                start += len;
            }

            let mut buffer = TimeOrderedBuffer::new();
            let mut pending: Vec<f64> = Vec::new();
            let mut retrieved: Vec<f64> = Vec::new();
            let mut cutoff = 0.0;
            for batch in arrival.chunks(50) {
                buffer.extend(batch.iter().copied().map(digi_at));
                pending.extend_from_slice(batch);
                cutoff += rng.gen_range(0.0..15.0);

                let out = times(&buffer.retrieve_up_to(cutoff).collect::<Vec<_>>());
                let mut expected: Vec<f64> =
                    pending.iter().copied().filter(|t| *t <= cutoff).collect();
                expected.sort_by(|a, b| a.total_cmp(b));
                pending.retain(|t| *t > cutoff);
                assert_eq!(out, expected);
                assert_eq!(buffer.size(), pending.len());
                retrieved.extend(out);
            }
            retrieved.extend(buffer.retrieve_up_to(f64::MAX).map(|d| d.time));

            assert!(buffer.is_empty());
            retrieved.sort_by(|a, b| a.total_cmp(b));
            arrival.sort_by(|a, b| a.total_cmp(b));
            assert_eq!(retrieved, arrival);
        }
    }

    #[test]
    fn test_late_arrivals_are_kept_and_counted() {
        let mut buffer = TimeOrderedBuffer::new();
        buffer.extend([1.0, 2.0, 3.0].map(digi_at));
        let _ = buffer.retrieve_up_to(2.0).count();
        buffer.insert(digi_at(1.5));
        buffer.insert(digi_at(2.5));
        assert_eq!(buffer.late_arrivals(), 1);
        let out = times(&buffer.retrieve_up_to(5.0).collect::<Vec<_>>());
        assert_eq!(out, vec![1.5, 2.5, 3.0]);
    }

    #[test]
    fn test_dropping_iterator_still_removes() {
        let mut buffer = TimeOrderedBuffer::new();
        buffer.extend([1.0, 2.0, 3.0, 8.0].map(digi_at));
        {
            let mut it = buffer.retrieve_up_to(3.0);
            assert_eq!(it.next().map(|d| d.time), Some(1.0));
        }
        assert_eq!(buffer.size(), 1);
        assert_eq!(buffer.earliest_time(), Some(8.0));
    }

    #[test]
    fn test_equal_times_keep_insertion_order() {
        let mut buffer = TimeOrderedBuffer::new();
        for channel in 0..5 {
            buffer.insert(Digi::new(0, channel, Side::A, 7.0, 1.0));
        }
        let channels: Vec<u32> = buffer.retrieve_up_to(7.0).map(|d| d.channel).collect();
        assert_eq!(channels, vec![0, 1, 2, 3, 4]);
    }
}
