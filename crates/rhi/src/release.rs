//! Deferred destruction of GPU objects.
//!
//! Objects the GPU may still be reading are stamped with the frame that last
//! used them and parked in a [`ReleaseQueue`]. Once the GPU reports that frame
//! complete, [`ReleaseQueue::finish_frame`] drops them oldest first.
//!
//! Stamps are kept monotonic: an item pushed with a stamp older than the
//! newest queued stamp takes the newest stamp instead. It may then live a
//! little longer than needed but is never destroyed early, and each drain
//! stays a simple pop from the front.

use std::collections::VecDeque;

use crate::backend::RenderBackend;
use crate::descriptor::Descriptor;

/// An object handed to the release queue by the render device.
pub enum Retired<B: RenderBackend> {
    /// GPU memory; dropping it destroys the resource
    Resource(B::Resource),
    /// Descriptor slot to return to its heap
    Descriptor(Descriptor),
}

/// FIFO of objects waiting for a frame to complete.
pub struct ReleaseQueue<T> {
    entries: VecDeque<(u64, T)>,
}

impl<T> ReleaseQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Parks `item` until `frame` completes.
    pub fn push(&mut self, frame: u64, item: T) {
        let frame = match self.entries.back() {
            Some((newest, _)) => frame.max(*newest),
            None => frame,
        };
        self.entries.push_back((frame, item));
    }

    /// Drops every item stamped at or before `completed_frame`.
    ///
    /// Returns the number of items released.
    pub fn finish_frame(&mut self, completed_frame: u64) -> usize {
        self.finish_frame_with(completed_frame, drop)
    }

    /// Hands every item stamped at or before `completed_frame` to `release`,
    /// oldest first.
    ///
    /// Returns the number of items released.
    pub fn finish_frame_with<F>(&mut self, completed_frame: u64, mut release: F) -> usize
    where
        F: FnMut(T),
    {
        let mut released = 0;
        while self
            .entries
            .front()
            .is_some_and(|(frame, _)| *frame <= completed_frame)
        {
            if let Some((_, item)) = self.entries.pop_front() {
                release(item);
                released += 1;
            }
        }
        released
    }

    /// Releases everything regardless of stamp.
    ///
    /// Only safe once the GPU is idle.
    pub fn drain_all_with<F>(&mut self, release: F) -> usize
    where
        F: FnMut(T),
    {
        self.finish_frame_with(u64::MAX, release)
    }

    /// Number of parked items.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is parked.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stamp of the oldest parked item.
    pub fn oldest_frame(&self) -> Option<u64> {
        self.entries.front().map(|(frame, _)| *frame)
    }
}

impl<T> Default for ReleaseQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    struct Tracked(u32, Rc<RefCell<Vec<u32>>>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.1.borrow_mut().push(self.0);
        }
    }

    #[test]
    fn test_releases_in_stamp_order() {
        let dropped = Rc::new(RefCell::new(Vec::new()));
        let mut queue = ReleaseQueue::new();
        queue.push(1, Tracked(1, dropped.clone()));
        queue.push(2, Tracked(2, dropped.clone()));
        queue.push(3, Tracked(3, dropped.clone()));

        assert_eq!(queue.finish_frame(0), 0);
        assert!(dropped.borrow().is_empty());

        assert_eq!(queue.finish_frame(2), 2);
        assert_eq!(*dropped.borrow(), vec![1, 2]);
        assert_eq!(queue.oldest_frame(), Some(3));
    }

    #[test]
    fn test_never_released_early() {
        let mut queue = ReleaseQueue::new();
        for frame in 1..=10u64 {
            queue.push(frame, frame);
        }
        for completed in 0..=10u64 {
            queue.finish_frame_with(completed, |stamp| assert!(stamp <= completed));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_out_of_order_stamp_is_clamped() {
        let mut queue = ReleaseQueue::new();
        queue.push(5, "late");
        queue.push(3, "early");

        // The frame 3 item waits for frame 5 instead of blocking the drain.
        assert_eq!(queue.finish_frame(4), 0);
        let mut seen = Vec::new();
        assert_eq!(queue.finish_frame_with(5, |item| seen.push(item)), 2);
        assert_eq!(seen, vec!["late", "early"]);
    }

    #[test]
    fn test_finish_frame_is_idempotent() {
        let mut queue = ReleaseQueue::new();
        queue.push(1, ());
        queue.push(4, ());
        assert_eq!(queue.finish_frame(2), 1);
        assert_eq!(queue.finish_frame(2), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_drain_all() {
        let mut queue = ReleaseQueue::default();
        queue.push(100, 1);
        queue.push(200, 2);
        let mut sum = 0;
        assert_eq!(queue.drain_all_with(|v| sum += v), 2);
        assert_eq!(sum, 3);
        assert!(queue.is_empty());
    }
}
