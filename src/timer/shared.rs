//! Multi-writer timing wheel
//!
//! Same slot arithmetic as [`TimingWheel`](super::TimingWheel), but every slot
//! carries its own lock so timers can be scheduled and cancelled from any
//! thread while one ticker advances the hand. Ticks are serialised by a
//! separate lock; schedulers never take it.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::wheel::{placement, Entry, TimerHandle};
use crate::config::wheel_capacity;
use crate::list::{IndexList, ListHead};

#[derive(Debug)]
struct Slot<T> {
    head: ListHead,
    nodes: IndexList<Entry<T>>,
}

/// Timing wheel shared between threads
#[derive(Debug)]
pub struct SharedTimingWheel<T> {
    slots: Box<[Mutex<Slot<T>>]>,
    hand: AtomicUsize,
    mask: usize,
    live: AtomicUsize,
    ticking: Mutex<()>,
}

impl<T> SharedTimingWheel<T> {
    pub fn new(size: usize) -> Self {
        let capacity = wheel_capacity(size);
        let slots = (0..capacity)
            .map(|_| {
                Mutex::new(Slot {
                    head: ListHead::new(),
                    nodes: IndexList::new(),
                })
            })
            .collect();
        Self {
            slots,
            hand: AtomicUsize::new(0),
            mask: capacity - 1,
            live: AtomicUsize::new(0),
            ticking: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    pub fn hand(&self) -> usize {
        self.hand.load(Ordering::Acquire)
    }

    /// Live timers (approximate while other threads are mutating).
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Schedules `value` to fire after `ticks` ticks (at least one).
    pub fn schedule(&self, value: T, ticks: u64) -> TimerHandle {
        let (slot, rounds, mut guard) = loop {
            let hand = self.hand.load(Ordering::Acquire);
            let (slot, rounds) = placement(hand, self.mask, ticks);
            let guard = self.slots[slot].lock();
            // The ticker publishes the new hand before locking the slot it
            // fires; a moved hand means our slot may already have fired.
            if self.hand.load(Ordering::Acquire) == hand {
                break (slot, rounds, guard);
            }
        };
        let Slot { head, nodes } = &mut *guard;
        let key = nodes.push_back(head, Entry { value, rounds });
        self.live.fetch_add(1, Ordering::Relaxed);
        TimerHandle { slot, key }
    }

    /// Unlinks a timer; `None` if it already fired or was cancelled.
    pub fn cancel(&self, handle: TimerHandle) -> Option<T> {
        let mut guard = self.slots.get(handle.slot)?.lock();
        let Slot { head, nodes } = &mut *guard;
        let entry = nodes.unlink(head, handle.key)?;
        self.live.fetch_sub(1, Ordering::Relaxed);
        Some(entry.value)
    }

    /// Moves a timer so it fires `ticks` ticks from the current hand.
    pub fn reschedule(&self, handle: TimerHandle, ticks: u64) -> Option<TimerHandle> {
        let value = self.cancel(handle)?;
        Some(self.schedule(value, ticks))
    }

    pub fn is_scheduled(&self, handle: TimerHandle) -> bool {
        self.slots
            .get(handle.slot)
            .is_some_and(|slot| slot.lock().nodes.contains(handle.key))
    }

    /// Advances the hand one slot and returns the timers that expired.
    ///
    /// Concurrent callers are serialised; each call is exactly one tick.
    pub fn tick(&self) -> Vec<(TimerHandle, T)> {
        let _ticking = self.ticking.lock();
        let slot = (self.hand.load(Ordering::Acquire) + 1) & self.mask;
        self.hand.store(slot, Ordering::Release);

        let mut guard = self.slots[slot].lock();
        let Slot { head, nodes } = &mut *guard;
        let mut fired = Vec::new();
        for key in nodes.keys(head) {
            if let Some(entry) = nodes.get_mut(key) {
                if entry.rounds > 0 {
                    entry.rounds -= 1;
                    continue;
                }
            }
            if let Some(entry) = nodes.unlink(head, key) {
                fired.push((TimerHandle { slot, key }, entry.value));
            }
        }
        self.live.fetch_sub(fired.len(), Ordering::Relaxed);
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fires_on_nth_tick() {
        let wheel = SharedTimingWheel::new(8);
        wheel.schedule("a", 3);
        wheel.schedule("b", 11);
        assert!(wheel.tick().is_empty());
        assert!(wheel.tick().is_empty());
        assert_eq!(wheel.tick()[0].1, "a");
        for _ in 4..11 {
            assert!(wheel.tick().is_empty());
        }
        assert_eq!(wheel.tick()[0].1, "b");
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_cancel_and_reschedule() {
        let wheel = SharedTimingWheel::new(16);
        let a = wheel.schedule(1, 2);
        let b = wheel.schedule(2, 2);
        assert_eq!(wheel.cancel(a), Some(1));
        wheel.tick();
        let b = wheel.reschedule(b, 2).unwrap();
        assert!(wheel.tick().is_empty());
        let fired = wheel.tick();
        assert_eq!(fired, vec![(b, 2)]);
        assert!(!wheel.is_scheduled(b));
        assert_eq!(wheel.cancel(b), None);
    }

    #[test]
    fn test_concurrent_schedule_and_cancel() {
        let wheel = Arc::new(SharedTimingWheel::new(64));
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let wheel = wheel.clone();
                thread::spawn(move || {
                    for i in 0..500u64 {
                        let h = wheel.schedule(t * 1000 + i, 1 + i % 50);
                        if i % 2 == 0 {
                            assert!(wheel.cancel(h).is_some() || !wheel.is_scheduled(h));
                        }
                    }
                })
            })
            .collect();

        let ticker = {
            let wheel = wheel.clone();
            thread::spawn(move || {
                let mut fired = 0;
                for _ in 0..200 {
                    fired += wheel.tick().len();
                }
                fired
            })
        };

        for p in producers {
            p.join().unwrap();
        }
        let mut fired = ticker.join().unwrap();
        // Drain what is left: every surviving timer fires within one revolution
        for _ in 0..wheel.capacity() {
            fired += wheel.tick().len();
        }
        assert!(wheel.is_empty());
        assert!(fired <= 2000);
    }
}
