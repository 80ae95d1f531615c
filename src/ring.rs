//! Bounded blocking frame queues between the tap device and the stack.
//!
//! Plain `Mutex<VecDeque<_>>` plus two `Condvar`s — the same shape the
//! teacher's thread-based ARP cache uses for its shared map, generalized to
//! a FIFO with a capacity bound and a head-of-line path for control frames.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

/// A fully-formed Ethernet frame moving between the tap device and the
/// stack, tagged with a monotonic serial for log correlation.
#[derive(Debug, Clone)]
pub struct Frame {
    pub tracker: u64,
    pub bytes: Vec<u8>,
}

static TRACKER: AtomicU64 = AtomicU64::new(1);

impl Frame {
    pub fn new(bytes: Vec<u8>) -> Frame {
        Frame {
            tracker: TRACKER.fetch_add(1, Ordering::Relaxed),
            bytes,
        }
    }
}

struct State {
    queue: VecDeque<Frame>,
    closed: bool,
}

/// A bounded FIFO of [`Frame`]s shared between a producer and a consumer
/// thread. `enqueue` with `urgent = true` jumps the queue (used for ARP
/// control traffic ahead of bulk TCP data).
pub struct Ring {
    capacity: usize,
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl Ring {
    pub fn new(capacity: usize) -> Ring {
        Ring {
            capacity,
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Push a frame, blocking while the ring is full. Urgent frames jump to
    /// the front once room exists.
    pub fn enqueue(&self, frame: Frame, urgent: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while state.queue.len() >= self.capacity && !state.closed {
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        if state.closed {
            return;
        }
        if urgent {
            state.queue.push_front(frame);
        } else {
            state.queue.push_back(frame);
        }
        self.not_empty.notify_one();
    }

    /// Block until a frame is available, or the ring is closed and drained.
    pub fn dequeue(&self) -> Option<Frame> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(frame) = state.queue.pop_front() {
                self.not_full.notify_one();
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Wake every blocked producer/consumer so they can observe shutdown.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type RxRing = Ring;
pub type TxRing = Ring;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order_preserved() {
        let ring = Ring::new(4);
        ring.enqueue(Frame::new(vec![1]), false);
        ring.enqueue(Frame::new(vec![2]), false);
        assert_eq!(ring.dequeue().unwrap().bytes, vec![1]);
        assert_eq!(ring.dequeue().unwrap().bytes, vec![2]);
    }

    #[test]
    fn urgent_frame_jumps_queue() {
        let ring = Ring::new(4);
        ring.enqueue(Frame::new(vec![1]), false);
        ring.enqueue(Frame::new(vec![2]), true);
        assert_eq!(ring.dequeue().unwrap().bytes, vec![2]);
        assert_eq!(ring.dequeue().unwrap().bytes, vec![1]);
    }

    #[test]
    fn dequeue_blocks_until_enqueue() {
        let ring = Arc::new(Ring::new(2));
        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.dequeue())
        };
        thread::sleep(Duration::from_millis(20));
        ring.enqueue(Frame::new(vec![9]), false);
        assert_eq!(consumer.join().unwrap().unwrap().bytes, vec![9]);
    }

    #[test]
    fn close_unblocks_dequeue_with_none() {
        let ring = Arc::new(Ring::new(2));
        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.dequeue())
        };
        thread::sleep(Duration::from_millis(20));
        ring.close();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn trackers_are_monotonic() {
        let a = Frame::new(vec![]);
        let b = Frame::new(vec![]);
        assert!(b.tracker > a.tracker);
    }
}
