//! Fixed-capacity slot tables addressed by `id mod capacity`.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Number of slots in session and transaction tables.
pub const CAPACITY: usize = 65_536;

/// Monotonic id source shared by the slot tables.
///
/// Ids start at 1 and wrap on `u32` overflow; 0 is never handed out.
#[derive(Debug)]
pub struct IdProbe {
    next: AtomicU32,
    capacity: usize,
}

impl IdProbe {
    pub fn new(capacity: usize) -> Self {
        Self {
            next: AtomicU32::new(0),
            capacity,
        }
    }

    /// Offer successive ids to `claim` until it accepts one, giving up after
    /// `capacity` attempts.
    pub fn probe(&self, mut claim: impl FnMut(u32, usize) -> bool) -> Option<u32> {
        for _ in 0..self.capacity {
            let id = self.next.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id == 0 {
                continue;
            }
            if claim(id, id as usize % self.capacity) {
                return Some(id);
            }
        }
        None
    }

    /// Make `last + 1` the next id offered.
    #[cfg(test)]
    pub(crate) fn restart_after(&self, last: u32) {
        self.next.store(last, Ordering::Relaxed);
    }
}

/// Boxed array of individually locked slots.
pub struct SlotTable<T> {
    slots: Box<[Mutex<Option<Arc<T>>>]>,
    probe: IdProbe,
    live: AtomicUsize,
}

impl<T> SlotTable<T> {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Mutex::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            probe: IdProbe::new(capacity),
            live: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self, index: usize) -> MutexGuard<'_, Option<Arc<T>>> {
        self.slots[index % self.slots.len()]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Find a free slot and install the value built by `make` for the chosen id.
    ///
    /// The slot stays locked while `make` runs, so no other caller can observe
    /// or claim it in between. When every candidate slot is taken, `make` is
    /// handed back unused.
    pub fn insert_with<F>(&self, make: F) -> Result<Arc<T>, F>
    where
        F: FnOnce(u32) -> Arc<T>,
    {
        let mut claimed = None;
        self.probe.probe(|id, index| {
            let slot = self.lock(index);
            if slot.is_some() {
                return false;
            }
            claimed = Some((id, slot));
            true
        });
        let Some((id, mut slot)) = claimed else {
            return Err(make);
        };

        let value = make(id);
        *slot = Some(Arc::clone(&value));
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    #[cfg(test)]
    pub(crate) fn restart_ids_after(&self, last: u32) {
        self.probe.restart_after(last);
    }

    /// Run `f` against the slot `index` maps to, under that slot's lock.
    pub fn with_slot<R>(&self, index: usize, f: impl FnOnce(Option<&Arc<T>>) -> R) -> R {
        let slot = self.lock(index);
        f(slot.as_ref())
    }

    /// Clear slot `index`, but only if it still holds `expected`.
    pub fn clear_if(&self, index: usize, expected: &Arc<T>) -> bool {
        let mut slot = self.lock(index);
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, expected) => {
                *slot = None;
                self.live.fetch_sub(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Empty every slot and return what was in them.
    pub fn drain(&self) -> Vec<Arc<T>> {
        let mut drained = Vec::new();
        for index in 0..self.slots.len() {
            if let Some(value) = self.lock(index).take() {
                self.live.fetch_sub(1, Ordering::Relaxed);
                drained.push(value);
            }
        }
        drained
    }

    /// Clone out every occupied slot.
    pub fn values(&self) -> Vec<Arc<T>> {
        (0..self.slots.len())
            .filter_map(|index| self.lock(index).clone())
            .collect()
    }
}
