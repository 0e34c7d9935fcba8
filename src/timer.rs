// src/timer.rs
use crate::task::{Cx, Progress, TaskBody, TaskId};
use std::{
    pin::Pin,
    time::{Duration, Instant},
};

/// Array-backed binary min-heap over absolute wake times.
///
/// Positions are reported 1-based so that `0` can mean "not in the heap";
/// the scheduler stores each task's position next to its other slot state,
/// which is what makes arbitrary removal O(log n): a task woken early by
/// I/O hands its stored position back and the heap heals around it.
pub(crate) struct TimerHeap {
    entries: Vec<(Instant, TaskId)>,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self { entries: Vec::new() }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest armed deadline, if any.
    #[inline]
    pub(crate) fn peek(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.0)
    }

    pub(crate) fn insert(&mut self, when: Instant, id: TaskId, pos: &mut [usize]) {
        self.entries.push((when, id));
        let idx = self.entries.len() - 1;
        pos[id] = idx + 1;
        self.sift_up(idx, pos);
    }

    /// Remove the element at 1-based `heap_pos`. Out-of-range positions
    /// (including 0 and anything on an empty heap) are a no-op returning
    /// `None`; removing the last remaining element must not sift.
    pub(crate) fn remove(&mut self, heap_pos: usize, pos: &mut [usize]) -> Option<TaskId> {
        if heap_pos == 0 || heap_pos > self.entries.len() {
            return None;
        }
        let idx = heap_pos - 1;
        let id = self.entries[idx].1;
        pos[id] = 0;

        let last = self.entries.len() - 1;
        if idx == last {
            self.entries.pop();
            return Some(id);
        }

        self.entries.swap(idx, last);
        self.entries.pop();
        pos[self.entries[idx].1] = idx + 1;
        // The hole was filled from the tail: the filler may need to move
        // either direction.
        self.sift_down(idx, pos);
        self.sift_up(idx, pos);
        Some(id)
    }

    pub(crate) fn pop_min(&mut self, pos: &mut [usize]) -> Option<(Instant, TaskId)> {
        let (when, id) = *self.entries.first()?;
        self.remove(1, pos);
        Some((when, id))
    }

    /// Pop the minimum element iff its deadline has passed.
    pub(crate) fn pop_expired(&mut self, now: Instant, pos: &mut [usize]) -> Option<TaskId> {
        if self.peek()? <= now {
            self.pop_min(pos).map(|(_, id)| id)
        } else {
            None
        }
    }

    fn sift_up(&mut self, mut i: usize, pos: &mut [usize]) {
        while i > 0 {
            let p = (i - 1) / 2;
            if self.entries[p].0 <= self.entries[i].0 {
                break;
            }
            self.entries.swap(i, p);
            pos[self.entries[i].1] = i + 1;
            pos[self.entries[p].1] = p + 1;
            i = p;
        }
    }

    fn sift_down(&mut self, mut i: usize, pos: &mut [usize]) {
        let len = self.entries.len();
        loop {
            let l = 2 * i + 1;
            let r = l + 1;
            let mut m = i;
            if l < len && self.entries[l].0 < self.entries[m].0 {
                m = l;
            }
            if r < len && self.entries[r].0 < self.entries[m].0 {
                m = r;
            }
            if m == i {
                break;
            }
            self.entries.swap(i, m);
            pos[self.entries[i].1] = i + 1;
            pos[self.entries[m].1] = m + 1;
            i = m;
        }
    }
}

/// Parks the running task until an absolute deadline, then completes.
pub struct DelayUntil {
    when: Instant,
}

impl DelayUntil {
    pub fn new(when: Instant) -> Self {
        Self { when }
    }

    pub fn after(dur: Duration) -> Self {
        Self { when: Instant::now() + dur }
    }
}

impl<'env, R> TaskBody<'env, R> for DelayUntil {
    fn resume(self: Pin<&mut Self>, cx: &mut Cx<'_, 'env, R>) -> Progress {
        if cx.killed() || Instant::now() >= self.when {
            return Progress::Done;
        }
        cx.sleep_until(self.when);
        Progress::Yield
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct XorShift64(u64);
    impl XorShift64 {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    fn check_heap(h: &TimerHeap, pos: &[usize]) {
        for i in 1..h.entries.len() {
            let p = (i - 1) / 2;
            assert!(
                h.entries[p].0 <= h.entries[i].0,
                "heap order broken at index {i}"
            );
        }
        for (i, &(_, id)) in h.entries.iter().enumerate() {
            assert_eq!(pos[id], i + 1, "stale back-pointer for task {id}");
        }
    }

    #[test]
    fn insert_keeps_order_and_back_pointers() {
        let base = Instant::now();
        let mut rng = XorShift64(0x5DEECE66D);
        let mut h = TimerHeap::new();
        let mut pos = vec![0usize; 64];

        for id in 0..64 {
            let when = base + Duration::from_millis(rng.next() % 1000);
            h.insert(when, id, &mut pos);
            check_heap(&h, &pos);
        }
        assert_eq!(h.len(), 64);
    }

    #[test]
    fn arbitrary_removal_preserves_invariants() {
        let base = Instant::now();
        let mut rng = XorShift64(0xDEADBEEF);
        let mut h = TimerHeap::new();
        let mut pos = vec![0usize; 48];

        for id in 0..48 {
            h.insert(base + Duration::from_millis(rng.next() % 500), id, &mut pos);
        }

        // Pull out tasks in a scrambled order via their back-pointers.
        let mut ids: Vec<TaskId> = (0..48).collect();
        for i in (1..ids.len()).rev() {
            ids.swap(i, (rng.next() % (i as u64 + 1)) as usize);
        }
        for id in ids {
            let p = pos[id];
            assert_ne!(p, 0);
            assert_eq!(h.remove(p, &mut pos), Some(id));
            assert_eq!(pos[id], 0);
            check_heap(&h, &pos);
        }
        assert!(h.is_empty());
    }

    #[test]
    fn pop_min_yields_sorted_deadlines() {
        let base = Instant::now();
        let mut rng = XorShift64(7);
        let mut h = TimerHeap::new();
        let mut pos = vec![0usize; 32];

        for id in 0..32 {
            h.insert(base + Duration::from_millis(rng.next() % 300), id, &mut pos);
        }

        let mut last = None;
        while let Some((when, _)) = h.pop_min(&mut pos) {
            if let Some(prev) = last {
                assert!(when >= prev);
            }
            last = Some(when);
        }
        assert!(pos.iter().all(|&p| p == 0));
    }

    #[test]
    fn removing_the_last_element_is_safe() {
        let mut h = TimerHeap::new();
        let mut pos = vec![0usize; 2];

        h.insert(Instant::now(), 1, &mut pos);
        assert_eq!(h.remove(pos[1], &mut pos), Some(1));
        assert!(h.is_empty());
        assert_eq!(pos[1], 0);

        // No-op removal paths: position 0, and any position on an empty heap.
        assert_eq!(h.remove(0, &mut pos), None);
        assert_eq!(h.remove(1, &mut pos), None);
    }

    #[test]
    fn pop_expired_respects_now() {
        let base = Instant::now();
        let mut h = TimerHeap::new();
        let mut pos = vec![0usize; 3];

        h.insert(base + Duration::from_millis(100), 0, &mut pos);
        h.insert(base + Duration::from_millis(500), 1, &mut pos);

        assert_eq!(h.pop_expired(base, &mut pos), None);
        assert_eq!(h.pop_expired(base + Duration::from_millis(200), &mut pos), Some(0));
        assert_eq!(h.pop_expired(base + Duration::from_millis(200), &mut pos), None);
        assert_eq!(h.len(), 1);
    }
}
