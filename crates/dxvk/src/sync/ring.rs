use parking_lot::{Condvar, Mutex};

struct RingState<T> {
    slots: Vec<Option<T>>,
    ///Total number of elements ever appended.
    append: u64,
    ///Total number of elements ever consumed.
    consume: u64,
    closed: bool,
}

impl<T> RingState<T> {
    fn len(&self) -> usize {
        (self.append - self.consume) as usize
    }
}

///Fixed size circular buffer for handing work from one thread to another.
///
/// Producers block while the ring is full, consumers block while it is empty. Both sides are tracked by a monotonically
/// increasing counter, which lets a producer wait until everything it appended so far was consumed.
pub struct Ring<T> {
    state: Mutex<RingState<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    ///Notified whenever the consume counter advances.
    consumed: Condvar,
    capacity: usize,
}

impl<T> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Ring {
            state: Mutex::new(RingState {
                slots: (0..capacity).map(|_| None).collect(),
                append: 0,
                consume: 0,
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            consumed: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    ///Appends `value`, blocking while the ring is full. Returns the value if the ring was closed. On success returns the
    /// append counter after the push.
    pub fn push(&self, value: T) -> Result<u64, T> {
        let mut state = self.state.lock();
        while state.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(value);
        }

        let slot = (state.append % self.capacity as u64) as usize;
        state.slots[slot] = Some(value);
        state.append += 1;
        let counter = state.append;
        drop(state);
        self.not_empty.notify_one();
        Ok(counter)
    }

    ///Like push, but returns the value instead of blocking if the ring is full.
    pub fn try_push(&self, value: T) -> Result<u64, T> {
        let mut state = self.state.lock();
        if state.len() >= self.capacity || state.closed {
            return Err(value);
        }
        let slot = (state.append % self.capacity as u64) as usize;
        state.slots[slot] = Some(value);
        state.append += 1;
        let counter = state.append;
        drop(state);
        self.not_empty.notify_one();
        Ok(counter)
    }

    ///Removes the oldest element, blocking while the ring is empty. Returns `None` once the ring is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        while state.len() == 0 {
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
        self.take(state)
    }

    ///Removes the oldest element if there is any.
    pub fn try_pop(&self) -> Option<T> {
        let state = self.state.lock();
        if state.len() == 0 {
            return None;
        }
        self.take(state)
    }

    fn take(&self, mut state: parking_lot::MutexGuard<'_, RingState<T>>) -> Option<T> {
        let slot = (state.consume % self.capacity as u64) as usize;
        let value = state.slots[slot].take();
        state.consume += 1;
        drop(state);
        self.not_full.notify_one();
        self.consumed.notify_all();
        value
    }

    ///Blocks until at least `counter` elements were consumed.
    pub fn wait_consumed(&self, counter: u64) {
        let mut state = self.state.lock();
        while state.consume < counter && !state.closed {
            self.consumed.wait(&mut state);
        }
    }

    ///Blocks until every element appended so far was consumed.
    pub fn wait_empty(&self) {
        let counter = self.state.lock().append;
        self.wait_consumed(counter);
    }

    pub fn appended(&self) -> u64 {
        self.state.lock().append
    }

    pub fn consumed(&self) -> u64 {
        self.state.lock().consume
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    ///Closes the ring. Blocked producers return their value, consumers drain the remaining elements.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
        self.consumed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn fifo_order_across_wrap() {
        let ring = Ring::new(3);
        for round in 0..4 {
            for i in 0..3 {
                ring.push(round * 10 + i).unwrap();
            }
            for i in 0..3 {
                assert_eq!(ring.pop(), Some(round * 10 + i));
            }
        }
        assert_eq!(ring.appended(), 12);
        assert_eq!(ring.consumed(), 12);
    }

    #[test]
    fn full_ring_blocks_producer() {
        let ring = Arc::new(Ring::new(2));
        ring.push(0).unwrap();
        ring.push(1).unwrap();
        assert!(ring.try_push(2).is_err());

        let producer = {
            let ring = ring.clone();
            thread::spawn(move || ring.push(2).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        assert_eq!(ring.pop(), Some(0));
        assert_eq!(producer.join().unwrap(), 3);
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
    }

    #[test]
    fn close_drains_then_stops() {
        let ring = Ring::new(4);
        ring.push(1).unwrap();
        ring.close();
        assert_eq!(ring.push(2), Err(2));
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), None);
    }
}
