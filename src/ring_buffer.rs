// Ring-Buffer Manager (component G): one size-bounded replay log per
// session, letting a reconnecting Gateway client catch up on missed events.
//
// Byte-cap eviction by draining the front of a `VecDeque`, generalized from
// raw PTY bytes to whole events, each carrying its own `sizeBytes`, plus a
// monotonic `nextSeq` counter that never resets.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const DEFAULT_CAP_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct BufferedEvent<T> {
    pub seq: u64,
    pub event: T,
    pub size_bytes: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RingStats {
    pub oldest_seq: u64,
    pub newest_seq: u64,
    pub total_bytes: usize,
}

struct Ring<T> {
    events: VecDeque<BufferedEvent<T>>,
    total_bytes: usize,
    /// Never reset, even across `clear()` or eviction, so `seq` stays
    /// monotonic for the lifetime of the process.
    next_seq: u64,
    cap_bytes: usize,
}

impl<T> Ring<T> {
    fn new(cap_bytes: usize) -> Self {
        Self {
            events: VecDeque::new(),
            total_bytes: 0,
            next_seq: 0,
            cap_bytes,
        }
    }

    fn push(&mut self, event: T, size_bytes: usize) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.events.push_back(BufferedEvent {
            seq,
            event,
            size_bytes,
        });
        self.total_bytes += size_bytes;

        while self.total_bytes > self.cap_bytes {
            match self.events.pop_front() {
                Some(evicted) => self.total_bytes -= evicted.size_bytes,
                None => break,
            }
        }
        seq
    }

    fn get_from(&self, cursor: u64) -> Vec<BufferedEvent<T>>
    where
        T: Clone,
    {
        self.events
            .iter()
            .filter(|e| e.seq > cursor)
            .cloned()
            .collect()
    }

    fn clear(&mut self) {
        self.events.clear();
        self.total_bytes = 0;
    }

    fn stats(&self) -> RingStats {
        RingStats {
            oldest_seq: self.events.front().map(|e| e.seq).unwrap_or(self.next_seq),
            newest_seq: self.events.back().map(|e| e.seq).unwrap_or(self.next_seq),
            total_bytes: self.total_bytes,
        }
    }
}

impl<T> Clone for BufferedEvent<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Self {
            seq: self.seq,
            event: self.event.clone(),
            size_bytes: self.size_bytes,
        }
    }
}

/// Per-session collection of rings, each bounded independently at
/// `cap_bytes` (default 20 MiB).
pub struct RingBufferManager<T> {
    rings: Mutex<HashMap<String, Ring<T>>>,
    cap_bytes: usize,
}

impl<T: Clone> RingBufferManager<T> {
    pub fn new() -> Self {
        Self::with_cap(DEFAULT_CAP_BYTES)
    }

    pub fn with_cap(cap_bytes: usize) -> Self {
        Self {
            rings: Mutex::new(HashMap::new()),
            cap_bytes,
        }
    }

    pub fn push(&self, session_id: &str, event: T, size_bytes: usize) -> u64 {
        let mut rings = self.rings.lock().unwrap();
        let ring = rings
            .entry(session_id.to_string())
            .or_insert_with(|| Ring::new(self.cap_bytes));
        ring.push(event, size_bytes)
    }

    pub fn get_from(&self, session_id: &str, cursor: u64) -> Vec<BufferedEvent<T>> {
        self.rings
            .lock()
            .unwrap()
            .get(session_id)
            .map(|r| r.get_from(cursor))
            .unwrap_or_default()
    }

    pub fn clear(&self, session_id: &str) {
        if let Some(ring) = self.rings.lock().unwrap().get_mut(session_id) {
            ring.clear();
        }
    }

    pub fn stats(&self, session_id: &str) -> Option<RingStats> {
        self.rings.lock().unwrap().get(session_id).map(|r| r.stats())
    }

    pub fn remove(&self, session_id: &str) {
        self.rings.lock().unwrap().remove(session_id);
    }
}

impl<T: Clone> Default for RingBufferManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_is_strictly_monotonic_and_never_reused() {
        let mgr: RingBufferManager<u32> = RingBufferManager::with_cap(1_000_000);
        let s1 = mgr.push("s", 1, 10);
        let s2 = mgr.push("s", 2, 10);
        let s3 = mgr.push("s", 3, 10);
        assert_eq!((s1, s2, s3), (1, 2, 3));
    }

    #[test]
    fn get_from_returns_strictly_greater_seq_in_order() {
        let mgr: RingBufferManager<u32> = RingBufferManager::with_cap(1_000_000);
        mgr.push("s", 10, 10);
        mgr.push("s", 20, 10);
        mgr.push("s", 30, 10);

        let got = mgr.get_from("s", 1);
        let seqs: Vec<u64> = got.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    // Eviction preserves seq monotonicity; 1000 * 30 KiB events into a
    // 20 MiB cap keeps oldestSeq > 1 while newestSeq == 1000.
    #[test]
    fn eviction_preserves_seq_and_drops_oldest_first() {
        let mgr: RingBufferManager<Vec<u8>> = RingBufferManager::with_cap(DEFAULT_CAP_BYTES);
        let payload = vec![0u8; 30 * 1024];
        for _ in 0..1000 {
            mgr.push("s", payload.clone(), payload.len());
        }
        let stats = mgr.stats("s").unwrap();
        assert_eq!(stats.newest_seq, 1000);
        assert!(stats.oldest_seq > 1);
        assert!(stats.total_bytes <= DEFAULT_CAP_BYTES);
    }

    #[test]
    fn clear_does_not_reset_next_seq() {
        let mgr: RingBufferManager<u32> = RingBufferManager::with_cap(1_000_000);
        mgr.push("s", 1, 10);
        mgr.push("s", 2, 10);
        mgr.clear("s");
        let seq = mgr.push("s", 3, 10);
        assert_eq!(seq, 3);
    }

    // For any sequence of pushes (including evictions and an interleaved
    // clear), getFrom(cursor) returns strictly increasing seq > cursor, and
    // nextSeq never decreases.
    mod monotonicity_proptest {
        use super::*;
        use proptest::prelude::*;

        #[derive(Clone, Copy, Debug)]
        enum Op {
            Push(usize),
            Clear,
        }

        proptest! {
            #[test]
            fn seq_never_decreases_across_arbitrary_push_and_clear(
                ops in prop::collection::vec(
                    prop_oneof![
                        (1usize..500).prop_map(Op::Push),
                        Just(Op::Clear),
                    ],
                    0..100,
                ),
                cap in 100usize..5000,
            ) {
                let mgr: RingBufferManager<usize> = RingBufferManager::with_cap(cap);
                let mut last_seq = 0u64;

                for op in ops {
                    match op {
                        Op::Push(size) => {
                            let seq = mgr.push("s", size, size);
                            prop_assert!(seq > last_seq);
                            last_seq = seq;
                        }
                        Op::Clear => mgr.clear("s"),
                    }
                }

                let replay = mgr.get_from("s", 0);
                let seqs: Vec<u64> = replay.iter().map(|e| e.seq).collect();
                for pair in seqs.windows(2) {
                    prop_assert!(pair[1] > pair[0]);
                }
                if let Some(stats) = mgr.stats("s") {
                    prop_assert!(stats.newest_seq <= last_seq);
                }
            }
        }
    }
}
