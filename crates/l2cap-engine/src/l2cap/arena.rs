//! Fixed-capacity slot arena for link and channel control blocks
//!
//! Slots are handed out from a FIFO free list: a released slot goes to the
//! tail, so a freshly released index is the last one to be reused. Every
//! release bumps the slot generation, which makes handles to the old
//! occupant stop resolving.

use std::collections::VecDeque;
use std::fmt;

/// Generation-checked index into an [`Arena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaHandle {
    pub index: usize,
    pub generation: u32,
}

impl fmt::Display for ArenaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: VecDeque<usize>,
}

impl<T> Arena<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                value: None,
            })
            .collect();

        Self {
            slots,
            free: (0..capacity).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn alloc(&mut self, value: T) -> Option<ArenaHandle> {
        self.alloc_with(|_| value)
    }

    /// Allocates a slot, building the value once its handle is known.
    pub fn alloc_with(&mut self, build: impl FnOnce(ArenaHandle) -> T) -> Option<ArenaHandle> {
        let index = self.free.pop_front()?;
        let slot = &mut self.slots[index];
        let handle = ArenaHandle {
            index,
            generation: slot.generation,
        };
        slot.value = Some(build(handle));
        Some(handle)
    }

    /// Frees the slot and returns its value. Stale handles return `None`.
    pub fn release(&mut self, handle: ArenaHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push_back(handle.index);
        Some(value)
    }

    pub fn get(&self, handle: ArenaHandle) -> Option<&T> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: ArenaHandle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn contains(&self, handle: ArenaHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Handle of the value currently occupying `index`, if any.
    pub fn handle_at(&self, index: usize) -> Option<ArenaHandle> {
        let slot = self.slots.get(index)?;
        slot.value.as_ref().map(|_| ArenaHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Occupied slots in pool order
    pub fn iter(&self) -> impl Iterator<Item = (ArenaHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    ArenaHandle {
                        index,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ArenaHandle, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.value
                .as_mut()
                .map(|value| (ArenaHandle { index, generation }, value))
        })
    }

    pub fn handles(&self) -> Vec<ArenaHandle> {
        self.iter().map(|(handle, _)| handle).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_invalidates_handle() {
        let mut arena = Arena::with_capacity(2);
        let a = arena.alloc("a").unwrap();
        assert_eq!(arena.get(a), Some(&"a"));

        assert_eq!(arena.release(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.release(a), None);
    }

    #[test]
    fn test_free_list_is_fifo() {
        let mut arena = Arena::with_capacity(3);
        let a = arena.alloc(1).unwrap();
        let b = arena.alloc(2).unwrap();
        arena.release(a);

        // Slot 2 was never used, so it comes before the freshly released 0
        let c = arena.alloc(3).unwrap();
        assert_eq!(c.index, 2);
        let d = arena.alloc(4).unwrap();
        assert_eq!(d.index, 0);
        assert_ne!(d, a);

        assert!(arena.alloc(5).is_none());
        assert_eq!(arena.len(), 3);
        assert_eq!(arena.get(b), Some(&2));
    }

    #[test]
    fn test_iter_in_pool_order() {
        let mut arena = Arena::with_capacity(4);
        let handles: Vec<_> = (0..4).map(|v| arena.alloc(v).unwrap()).collect();
        arena.release(handles[1]);

        let values: Vec<_> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![0, 2, 3]);
        assert_eq!(arena.handle_at(2), Some(handles[2]));
        assert_eq!(arena.handle_at(1), None);
    }

    #[test]
    fn test_alloc_with_sees_own_handle() {
        let mut arena = Arena::with_capacity(1);
        let handle = arena.alloc_with(|h| h.index + 10).unwrap();
        assert_eq!(arena.get(handle), Some(&10));
    }
}
