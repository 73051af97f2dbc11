//! Bounded priority event list
//!
//! The one inter-thread primitive in the emulator: a mutex-guarded bounded
//! queue with priority insert (higher numeric priority is closer to the
//! head, FIFO among equals) and a timed blocking pop. The multiplexer uses
//! it for its event queue, its interrupt queue and the per-line command
//! queues.
//!
//! Capacity is fixed at creation. On overflow the operation fails and hands
//! the item back; producers drop it and log, they never block.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Returned when the list is full; carries the rejected item.
#[derive(Debug, PartialEq, Eq)]
pub struct Full<T>(pub T);

struct Entry<T> {
    prio: i32,
    item: T,
}

/// Bounded, thread-safe priority list.
pub struct EventList<T> {
    inner: Mutex<VecDeque<Entry<T>>>,
    cond: Condvar,
    capacity: usize,
}

impl<T> EventList<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            inner: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            capacity,
        }
    }

    /// Append at the tail (priority 0). Fails when full.
    pub fn append(&self, item: T) -> Result<usize, Full<T>> {
        let mut q = self.inner.lock().unwrap();
        if q.len() >= self.capacity {
            return Err(Full(item));
        }
        q.push_back(Entry { prio: 0, item });
        let count = q.len();
        drop(q);
        self.cond.notify_one();
        Ok(count)
    }

    /// Insert at the head, ahead of everything already queued.
    pub fn prepend(&self, item: T) -> Result<usize, Full<T>> {
        let mut q = self.inner.lock().unwrap();
        if q.len() >= self.capacity {
            return Err(Full(item));
        }
        q.push_front(Entry { prio: 0, item });
        let count = q.len();
        drop(q);
        self.cond.notify_one();
        Ok(count)
    }

    /// Insert by priority: before the first entry with a lower priority,
    /// after all entries with an equal or higher one.
    pub fn insert(&self, item: T, prio: i32) -> Result<usize, Full<T>> {
        let mut q = self.inner.lock().unwrap();
        if q.len() >= self.capacity {
            return Err(Full(item));
        }
        let pos = q.iter().position(|e| e.prio < prio).unwrap_or(q.len());
        q.insert(pos, Entry { prio, item });
        let count = q.len();
        drop(q);
        self.cond.notify_one();
        Ok(count)
    }

    /// Non-blocking pop from the head.
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().unwrap().pop_front().map(|e| e.item)
    }

    /// Blocking pop. `timeout == None` waits indefinitely; with a timeout,
    /// returns `None` once the deadline passes with the list still empty.
    pub fn wait_pop(&self, timeout: Option<Duration>) -> Option<T> {
        let mut q = self.inner.lock().unwrap();
        match timeout {
            None => {
                while q.is_empty() {
                    q = self.cond.wait(q).unwrap();
                }
            }
            Some(t) => {
                let deadline = Instant::now() + t;
                while q.is_empty() {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, res) = self.cond.wait_timeout(q, deadline - now).unwrap();
                    q = guard;
                    if res.timed_out() && q.is_empty() {
                        return None;
                    }
                }
            }
        }
        q.pop_front().map(|e| e.item)
    }

    /// Drop all queued items. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let mut q = self.inner.lock().unwrap();
        let count = q.len();
        q.clear();
        count
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let l = EventList::new(8);
        l.append(1).unwrap();
        l.append(2).unwrap();
        l.append(3).unwrap();
        assert_eq!(l.count(), 3);
        assert_eq!(l.pop(), Some(1));
        assert_eq!(l.pop(), Some(2));
        assert_eq!(l.pop(), Some(3));
        assert_eq!(l.pop(), None);
    }

    #[test]
    fn test_priority_order_fifo_among_equals() {
        let l = EventList::new(8);
        l.insert("a0", 0).unwrap();
        l.insert("b2", 2).unwrap();
        l.insert("c1", 1).unwrap();
        l.insert("d2", 2).unwrap();
        l.insert("e0", 0).unwrap();
        let order: Vec<_> = std::iter::from_fn(|| l.pop()).collect();
        assert_eq!(order, vec!["b2", "d2", "c1", "a0", "e0"]);
    }

    #[test]
    fn test_prepend_beats_priorities() {
        let l = EventList::new(8);
        l.insert(10, 5).unwrap();
        l.prepend(99).unwrap();
        assert_eq!(l.pop(), Some(99));
        assert_eq!(l.pop(), Some(10));
    }

    #[test]
    fn test_overflow_fails() {
        let l = EventList::new(2);
        l.append(1).unwrap();
        l.append(2).unwrap();
        assert_eq!(l.append(3), Err(Full(3)));
        assert_eq!(l.insert(4, 9), Err(Full(4)));
        assert_eq!(l.count(), 2);
    }

    #[test]
    fn test_clear() {
        let l = EventList::new(4);
        l.append(1).unwrap();
        l.append(2).unwrap();
        assert_eq!(l.clear(), 2);
        assert_eq!(l.count(), 0);
        assert_eq!(l.pop(), None);
    }

    #[test]
    fn test_wait_pop_timeout() {
        let l: EventList<i32> = EventList::new(4);
        let start = Instant::now();
        assert_eq!(l.wait_pop(Some(Duration::from_millis(30))), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_pop_wakes_on_append() {
        let l = Arc::new(EventList::new(4));
        let producer = Arc::clone(&l);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.append(42).unwrap();
        });
        assert_eq!(l.wait_pop(Some(Duration::from_secs(5))), Some(42));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_pop_untimed() {
        let l = Arc::new(EventList::new(4));
        let producer = Arc::clone(&l);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.insert(7, 3).unwrap();
        });
        assert_eq!(l.wait_pop(None), Some(7));
        handle.join().unwrap();
    }
}
