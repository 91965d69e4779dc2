/*
    PCTime

    Copyright 2024 The PCTime Authors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    scheduler.rs

    Implements the event queue: a fixed pool of deferred-callback records
    shared by every device that needs something to happen at a later point
    in emulated time.

    Records live either in the free pool or in the pending list, which is
    kept sorted by scheduled time. Both lists are singly linked through slot
    indices rather than pointers.

*/

use serde::{Deserialize, Serialize};

/// Default number of records in the event pool.
pub const DEFAULT_QUEUE_CAPACITY: usize = 8192;

/// Identifies an event handler registered with the timing core.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandlerId(pub(crate) u32);

impl HandlerId {
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// What to do when an event fires. Cancellation matches on this value, so a
/// device that reprograms itself can withdraw exactly the events it owns.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Terminal count of PIT channel 0 (drives IRQ 0).
    PitTimer0,
    /// A handler registered by an external device.
    Handler(HandlerId),
}

#[derive(Copy, Clone, Debug)]
pub struct EventEntry {
    pub time:  f64,
    pub kind:  EventKind,
    pub value: u32,
    next:      Option<usize>,
}

impl EventEntry {
    fn vacant(next: Option<usize>) -> Self {
        Self {
            time: 0.0,
            kind: EventKind::PitTimer0,
            value: 0,
            next,
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct QueueStats {
    pub pending: usize,
    pub peak_pending: usize,
    pub fired: u64,
    pub dropped: u64,
}

pub struct EventQueue {
    entries: Vec<EventEntry>,
    free_head: Option<usize>,
    pending_head: Option<usize>,
    stats: QueueStats,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let mut queue = Self {
            entries: Vec::with_capacity(capacity),
            free_head: None,
            pending_head: None,
            stats: Default::default(),
        };
        for i in 0..capacity {
            let next = if i + 1 < capacity { Some(i + 1) } else { None };
            queue.entries.push(EventEntry::vacant(next));
        }
        queue.free_head = if capacity > 0 { Some(0) } else { None };
        queue
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stats.pending
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending_head.is_none()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    /// Return every record to the free pool. Statistics other than the pending count
    /// are preserved.
    pub fn clear(&mut self) {
        let capacity = self.entries.len();
        for (i, entry) in self.entries.iter_mut().enumerate() {
            *entry = EventEntry::vacant(if i + 1 < capacity { Some(i + 1) } else { None });
        }
        self.free_head = if capacity > 0 { Some(0) } else { None };
        self.pending_head = None;
        self.stats.pending = 0;
    }

    /// Schedule an event at the absolute time `time` (in fractional milliseconds).
    /// If the pool is exhausted the request is dropped and logged; the return value
    /// reports whether the event was queued.
    pub fn schedule(&mut self, time: f64, kind: EventKind, value: u32) -> bool {
        let Some(slot) = self.free_head
        else {
            self.stats.dropped += 1;
            log::error!(
                "SCHED: Event queue full ({} entries), dropping {:?} event at {:.6}",
                self.entries.len(),
                kind,
                time
            );
            return false;
        };
        self.free_head = self.entries[slot].next;

        let entry = &mut self.entries[slot];
        entry.time = time;
        entry.kind = kind;
        entry.value = value;
        entry.next = None;

        self.insert(slot);

        self.stats.pending += 1;
        if self.stats.pending > self.stats.peak_pending {
            self.stats.peak_pending = self.stats.pending;
        }
        true
    }

    /// Link `slot` into the pending list in front of the first record scheduled strictly
    /// later, so records with equal times fire in the order they were scheduled.
    fn insert(&mut self, slot: usize) {
        let time = self.entries[slot].time;

        match self.pending_head {
            None => {
                self.pending_head = Some(slot);
            }
            Some(head) if self.entries[head].time > time => {
                self.entries[slot].next = Some(head);
                self.pending_head = Some(slot);
            }
            Some(head) => {
                let mut cursor = head;
                loop {
                    match self.entries[cursor].next {
                        Some(next) if self.entries[next].time > time => {
                            self.entries[slot].next = Some(next);
                            self.entries[cursor].next = Some(slot);
                            break;
                        }
                        Some(next) => cursor = next,
                        None => {
                            self.entries[cursor].next = Some(slot);
                            break;
                        }
                    }
                }
            }
        }
    }

    #[inline]
    fn release(&mut self, slot: usize) {
        self.entries[slot].next = self.free_head;
        self.free_head = Some(slot);
        self.stats.pending -= 1;
    }

    /// Remove every pending event of the given kind. Returns the number removed.
    pub fn cancel_all(&mut self, kind: EventKind) -> usize {
        self.cancel_where(|e| e.kind == kind)
    }

    /// Remove every pending event of the given kind carrying `value`.
    pub fn cancel_matching(&mut self, kind: EventKind, value: u32) -> usize {
        self.cancel_where(|e| e.kind == kind && e.value == value)
    }

    fn cancel_where<F>(&mut self, pred: F) -> usize
    where
        F: Fn(&EventEntry) -> bool,
    {
        let mut removed = 0;
        let mut prev: Option<usize> = None;
        let mut cursor = self.pending_head;

        while let Some(slot) = cursor {
            let next = self.entries[slot].next;
            if pred(&self.entries[slot]) {
                match prev {
                    Some(p) => self.entries[p].next = next,
                    None => self.pending_head = next,
                }
                self.release(slot);
                removed += 1;
            }
            else {
                prev = Some(slot);
            }
            cursor = next;
        }
        removed
    }

    /// Scheduled time of the earliest pending event.
    #[inline]
    pub fn next_time(&self) -> Option<f64> {
        self.pending_head.map(|slot| self.entries[slot].time)
    }

    /// Unlink and return the head of the pending list if it is due at or before `limit`.
    /// The record goes back to the free pool; the returned copy carries its payload.
    pub fn pop_due(&mut self, limit: f64) -> Option<EventEntry> {
        let slot = self.pending_head?;
        if self.entries[slot].time > limit {
            return None;
        }
        let entry = self.entries[slot];
        self.pending_head = entry.next;
        self.release(slot);
        self.stats.fired += 1;
        Some(entry)
    }

    /// Pop and hand every event due at or before `limit` to `fire`, in firing order.
    /// `fire` cannot reach back into the queue; the timing core drives the queue with
    /// [`EventQueue::pop_due`] when handlers need to schedule follow-up events.
    pub fn drain_due<F>(&mut self, limit: f64, mut fire: F) -> usize
    where
        F: FnMut(&EventEntry),
    {
        let mut count = 0;
        while let Some(entry) = self.pop_due(limit) {
            fire(&entry);
            count += 1;
        }
        count
    }

    /// Iterate pending events in firing order.
    pub fn iter(&self) -> PendingIter<'_> {
        PendingIter {
            queue:  self,
            cursor: self.pending_head,
        }
    }
}

pub struct PendingIter<'a> {
    queue:  &'a EventQueue,
    cursor: Option<usize>,
}

impl<'a> Iterator for PendingIter<'a> {
    type Item = &'a EventEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.cursor?;
        let entry = &self.queue.entries[slot];
        self.cursor = entry.next;
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(n: u32) -> EventKind {
        EventKind::Handler(HandlerId(n))
    }

    #[test]
    fn drain_fires_in_time_order() {
        let mut queue = EventQueue::new(16);
        queue.schedule(3.0, handler(0), 3);
        queue.schedule(1.0, handler(0), 1);
        queue.schedule(2.5, handler(0), 2);
        queue.schedule(0.5, handler(0), 0);

        let mut fired = Vec::new();
        let count = queue.drain_due(10.0, |e| fired.push(e.value));
        assert_eq!(count, 4);
        assert_eq!(fired, vec![0, 1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn equal_times_fire_fifo() {
        let mut queue = EventQueue::new(16);
        queue.schedule(2.0, handler(1), 10);
        queue.schedule(1.0, handler(1), 0);
        queue.schedule(2.0, handler(1), 11);
        queue.schedule(2.0, handler(2), 12);
        queue.schedule(1.0, handler(1), 1);

        let order: Vec<u32> = queue.iter().map(|e| e.value).collect();
        assert_eq!(order, vec![0, 1, 10, 11, 12]);
    }

    #[test]
    fn drain_stops_at_future_head() {
        let mut queue = EventQueue::new(8);
        queue.schedule(1.0, handler(0), 1);
        queue.schedule(2.0, handler(0), 2);

        let mut fired = Vec::new();
        queue.drain_due(1.5, |e| fired.push(e.value));
        assert_eq!(fired, vec![1]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_time(), Some(2.0));

        // Boundary is inclusive.
        queue.drain_due(2.0, |e| fired.push(e.value));
        assert_eq!(fired, vec![1, 2]);
    }

    #[test]
    fn overflow_is_dropped_and_counted() {
        let mut queue = EventQueue::new(4);
        for i in 0..7 {
            let queued = queue.schedule(i as f64, handler(0), i);
            assert_eq!(queued, i < 4);
        }
        assert_eq!(queue.len(), 4);
        // Each drop logs one error! alongside bumping the counter.
        assert_eq!(queue.stats().dropped, 3);

        // Draining returns records to the pool so scheduling succeeds again.
        queue.drain_due(1.0, |_| {});
        assert!(queue.schedule(9.0, handler(0), 9));
        assert!(queue.schedule(9.0, handler(0), 10));
        assert!(!queue.schedule(9.0, handler(0), 11));
        assert_eq!(queue.stats().dropped, 4);
        assert_eq!(queue.stats().peak_pending, 4);
    }

    #[test]
    fn cancel_all_and_matching() {
        let mut queue = EventQueue::new(16);
        queue.schedule(1.0, handler(1), 0);
        queue.schedule(2.0, EventKind::PitTimer0, 0);
        queue.schedule(3.0, handler(1), 7);
        queue.schedule(4.0, handler(2), 7);
        queue.schedule(5.0, handler(1), 7);

        assert_eq!(queue.cancel_matching(handler(1), 7), 2);
        let kinds: Vec<(EventKind, u32)> = queue.iter().map(|e| (e.kind, e.value)).collect();
        assert_eq!(
            kinds,
            vec![(handler(1), 0), (EventKind::PitTimer0, 0), (handler(2), 7)]
        );

        assert_eq!(queue.cancel_all(handler(1)), 1);
        assert_eq!(queue.cancel_all(handler(1)), 0);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.cancel_all(EventKind::PitTimer0), 1);
        assert_eq!(queue.cancel_all(handler(2)), 1);
        assert!(queue.is_empty());
        assert_eq!(queue.next_time(), None);
    }

    #[test]
    fn zero_capacity_drops_everything() {
        let mut queue = EventQueue::new(0);
        assert!(!queue.schedule(0.0, EventKind::PitTimer0, 0));
        assert_eq!(queue.stats().dropped, 1);
        assert!(queue.pop_due(100.0).is_none());
    }

    #[test]
    fn clear_resets_pool() {
        let mut queue = EventQueue::new(2);
        queue.schedule(1.0, handler(0), 0);
        queue.schedule(2.0, handler(0), 1);
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.schedule(1.0, handler(0), 0));
        assert!(queue.schedule(1.0, handler(0), 1));
        assert_eq!(queue.len(), 2);
    }
}
