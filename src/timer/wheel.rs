//! Single-writer timing wheel
//!
//! The wheel is a ring of `capacity` slots, each the head of a list of timer
//! nodes. The hand moves one slot per [`TimingWheel::tick`]; a timer due in
//! `n` ticks lives in slot `(hand + n) & mask` and fires on exactly the `n`-th
//! following tick. Timers further out than one revolution carry a round
//! counter that is decremented each time the hand passes their slot.
//!
//! This variant takes `&mut self` for every mutation and is meant to be owned
//! by the one thread that ticks it, such as a selector thread.

use crate::config::wheel_capacity;
use crate::list::{IndexList, ListHead, NodeKey};

/// Identity of one scheduled timer
///
/// Handles are stamped at insertion: after a cancel, a reschedule or a fire,
/// the old handle no longer matches anything in the wheel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    pub(crate) slot: usize,
    pub(crate) key: NodeKey,
}

impl TimerHandle {
    /// Slot the timer was placed in.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

#[derive(Debug)]
pub(crate) struct Entry<T> {
    pub(crate) value: T,
    pub(crate) rounds: u64,
}

/// Slot and remaining full revolutions for a timer due in `ticks` ticks
/// when the hand is at `hand`.
pub(crate) fn placement(hand: usize, mask: usize, ticks: u64) -> (usize, u64) {
    let ticks = ticks.max(1);
    let capacity = mask as u64 + 1;
    let slot = ((hand as u64).wrapping_add(ticks) & mask as u64) as usize;
    let distance = match slot.wrapping_sub(hand) & mask {
        0 => capacity,
        d => d as u64,
    };
    (slot, (ticks - distance) / capacity)
}

/// Timing wheel mutated by a single owner
#[derive(Debug)]
pub struct TimingWheel<T> {
    slots: Box<[ListHead]>,
    nodes: IndexList<Entry<T>>,
    hand: usize,
    mask: usize,
}

impl<T> TimingWheel<T> {
    /// Creates a wheel with at least `size` slots (rounded up to a power of
    /// two, capped at [`MAX_WHEEL_SIZE`](crate::config::MAX_WHEEL_SIZE)).
    pub fn new(size: usize) -> Self {
        let capacity = wheel_capacity(size);
        Self {
            slots: vec![ListHead::new(); capacity].into_boxed_slice(),
            nodes: IndexList::with_capacity(capacity),
            hand: 0,
            mask: capacity - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Slot fired by the most recent tick.
    pub fn hand(&self) -> usize {
        self.hand
    }

    /// Live timers.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Schedules `value` to fire after `ticks` ticks (at least one).
    pub fn schedule(&mut self, value: T, ticks: u64) -> TimerHandle {
        let (slot, rounds) = placement(self.hand, self.mask, ticks);
        let key = self
            .nodes
            .push_back(&mut self.slots[slot], Entry { value, rounds });
        TimerHandle { slot, key }
    }

    /// Unlinks a timer; `None` if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<T> {
        self.nodes
            .unlink(&mut self.slots[handle.slot], handle.key)
            .map(|e| e.value)
    }

    /// Moves a timer so it fires `ticks` ticks from now.
    ///
    /// Returns the new handle, or `None` if the timer is no longer scheduled.
    pub fn reschedule(&mut self, handle: TimerHandle, ticks: u64) -> Option<TimerHandle> {
        let value = self.cancel(handle)?;
        Some(self.schedule(value, ticks))
    }

    pub fn is_scheduled(&self, handle: TimerHandle) -> bool {
        self.nodes.contains(handle.key)
    }

    pub fn get(&self, handle: TimerHandle) -> Option<&T> {
        self.nodes.get(handle.key).map(|e| &e.value)
    }

    /// Advances the hand one slot and returns the timers that expired.
    pub fn tick(&mut self) -> Vec<(TimerHandle, T)> {
        self.hand = (self.hand + 1) & self.mask;
        let slot = self.hand;
        let mut fired = Vec::new();

        for key in self.nodes.keys(&self.slots[slot]) {
            if let Some(entry) = self.nodes.get_mut(key) {
                if entry.rounds > 0 {
                    entry.rounds -= 1;
                    continue;
                }
            }
            if let Some(entry) = self.nodes.unlink(&mut self.slots[slot], key) {
                fired.push((TimerHandle { slot, key }, entry.value));
            }
        }
        fired
    }

    /// Removes every timer without firing it.
    pub fn clear(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.nodes.len());
        for slot in self.slots.iter_mut() {
            while let Some((_, entry)) = self.nodes.pop_front(slot) {
                drained.push(entry.value);
            }
        }
        drained
    }
}
