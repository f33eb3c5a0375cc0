use clippy_utilities::Cast;
use std::fmt;

/// Handle into an `Arena`: slot index plus the generation the slot had when the value was
/// inserted. A handle whose generation no longer matches resolves to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Handle {
    /// Slot index
    index: u32,
    /// Slot generation
    generation: u32,
}

impl Handle {
    /// Pack into 64 bits, generation in the high half
    pub(crate) const fn to_u64(self) -> u64 {
        ((self.generation as u64) << 32_u32) | (self.index as u64)
    }

    /// Unpack from 64 bits
    #[allow(clippy::as_conversions, clippy::cast_possible_truncation)] // halves of a u64
    pub(crate) const fn from_u64(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32_u32) as u32,
        }
    }
}

impl fmt::Display for Handle {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// One arena slot
#[derive(Debug)]
struct Slot<T> {
    /// Bumped every time the slot is vacated
    generation: u32,
    /// Current occupant
    value: Option<T>,
}

/// Slot arena with generational handles.
///
/// Vacated slots are reused, so the arena stays as large as the peak number of live values.
#[derive(Debug)]
pub(crate) struct Arena<T> {
    /// All slots, live or vacant
    slots: Vec<Slot<T>>,
    /// Indices of vacant slots
    free: Vec<u32>,
    /// Number of live values
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> Arena<T> {
    /// Insert a value and return its handle
    pub(crate) fn insert(&mut self, value: T) -> Handle {
        self.len = self.len.saturating_add(1);
        if let Some(index) = self.free.pop() {
            let at: usize = index.cast();
            let slot = &mut self.slots[at];
            slot.value = Some(value);
            return Handle {
                index,
                generation: slot.generation,
            };
        }
        let index: u32 = self.slots.len().cast();
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle {
            index,
            generation: 0,
        }
    }

    /// Insert the value `make` builds from its own handle
    pub(crate) fn insert_with<F: FnOnce(Handle) -> T>(&mut self, make: F) -> Handle {
        let handle = match self.free.last() {
            Some(&index) => {
                let at: usize = index.cast();
                Handle {
                    index,
                    generation: self.slots[at].generation,
                }
            }
            None => Handle {
                index: self.slots.len().cast(),
                generation: 0,
            },
        };
        let inserted = self.insert(make(handle));
        debug_assert_eq!(inserted, handle);
        inserted
    }

    /// Get a live value
    pub(crate) fn get(&self, handle: Handle) -> Option<&T> {
        let at: usize = handle.index.cast();
        self.slots
            .get(at)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Get a live value mutably
    pub(crate) fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let at: usize = handle.index.cast();
        self.slots
            .get_mut(at)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Remove a live value, invalidating its handle
    pub(crate) fn remove(&mut self, handle: Handle) -> Option<T> {
        let at: usize = handle.index.cast();
        let slot = self
            .slots
            .get_mut(at)
            .filter(|slot| slot.generation == handle.generation)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len = self.len.saturating_sub(1);
        Some(value)
    }

    /// Remove every live value `keep` rejects, returning how many were removed
    pub(crate) fn retain<F: FnMut(&T) -> bool>(&mut self, mut keep: F) -> usize {
        let doomed: Vec<Handle> = self
            .iter()
            .filter(|&(_, value)| !keep(value))
            .map(|(handle, _)| handle)
            .collect();
        doomed
            .into_iter()
            .filter_map(|handle| self.remove(handle))
            .count()
    }

    /// Iterate over live values
    pub(crate) fn iter(&self) -> impl Iterator<Item = (Handle, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    Handle {
                        index: index.cast(),
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    /// Number of live values
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    /// Whether no value is live
    pub(crate) const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handles_resolve_to_nothing() {
        let mut arena = Arena::default();
        let first = arena.insert("recv-0");
        assert_eq!(arena.remove(first), Some("recv-0"));
        let second = arena.insert("recv-1");
        // the slot is reused with a new generation
        assert_ne!(first, second);
        assert_eq!(arena.get(first), None);
        assert_eq!(arena.remove(first), None);
        assert_eq!(arena.get(second), Some(&"recv-1"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn handle_packs_into_u64() {
        let mut arena = Arena::default();
        let handles: Vec<Handle> = (0..5_u32).map(|i| arena.insert(i)).collect();
        for handle in handles {
            assert_eq!(Handle::from_u64(handle.to_u64()), handle);
        }
    }

    #[test]
    fn retain_drops_rejected_values() {
        let mut arena = Arena::default();
        for i in 0..10_u32 {
            let _ = arena.insert(i);
        }
        assert_eq!(arena.retain(|v| v % 2 == 0), 5);
        assert_eq!(arena.len(), 5);
        assert!(arena.iter().all(|(_, v)| v % 2 == 0));
        assert!(!arena.is_empty());
    }

    #[test]
    fn insert_with_sees_its_own_handle() {
        let mut arena = Arena::default();
        let first = arena.insert_with(|handle| handle);
        assert_eq!(arena.get(first), Some(&first));
        let _ = arena.remove(first);
        let reused = arena.insert_with(|handle| handle);
        assert_ne!(reused, first);
        assert_eq!(arena.get(reused), Some(&reused));
    }
}
