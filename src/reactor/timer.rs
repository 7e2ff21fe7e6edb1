//! Deadline queue untuk timer event manager.
//!
//! Cancel bersifat lazy: entry di heap dibiarkan, item di `pending`
//! dihapus, dan heap dibersihkan saat entry tersebut mencapai puncak.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

/// Handle untuk membatalkan timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

pub(crate) struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    pending: HashMap<TimerId, T>,
    next_id: u64,
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn insert(&mut self, deadline: Instant, item: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.pending.insert(id, item);
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        self.pending.remove(&id)
    }

    /// Ambil item yang masih pending (dipakai saat firing)
    pub fn take(&mut self, id: TimerId) -> Option<T> {
        self.pending.remove(&id)
    }

    /// Deadline terdekat yang belum di-cancel
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.pending.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop semua timer dengan deadline <= `now`, urut berdasarkan deadline.
    ///
    /// Item tetap di `pending` sampai di-`take`, jadi timer yang di-cancel
    /// oleh callback lain dalam batch yang sama tidak akan fire.
    pub fn expired(&mut self, now: Instant) -> Vec<TimerId> {
        let mut out = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if self.pending.contains_key(&id) {
                out.push(id);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
