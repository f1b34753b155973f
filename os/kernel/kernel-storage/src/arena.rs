//! Handle-keyed arena for long-lived kernel objects (devices, interrupt
//! routes).
//!
//! Slots are recycled, so every handle carries the generation of the insert
//! that produced it; a handle kept past its [`Arena::remove`] never aliases a
//! later occupant of the same slot.

use slab::Slab;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }
}

struct Entry<T> {
    generation: u32,
    value: T,
}

pub struct Arena<T> {
    slots: Slab<Entry<T>>,
    next_generation: u32,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Slab::new(),
            next_generation: 0,
        }
    }

    /// # Panics
    /// If more than `u32::MAX` objects are live at once.
    pub fn insert(&mut self, value: T) -> Handle {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let index = self.slots.insert(Entry { generation, value });
        Handle {
            index: u32::try_from(index).expect("arena index overflow"),
            generation,
        }
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        self.get(handle)?;
        Some(self.slots.remove(handle.index as usize).value)
    }

    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .map(|entry| &entry.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().map(|(index, entry)| {
            (
                Handle {
                    #[allow(clippy::cast_possible_truncation)]
                    index: index as u32,
                    generation: entry.generation,
                },
                &entry.value,
            )
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handles_do_not_alias_reused_slots() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        assert_eq!(arena.remove(a), Some("a"));

        let b = arena.insert("b");
        assert_eq!(a.index(), b.index(), "slab reuses the vacated slot");
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn iter_yields_live_handles() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        let b = arena.insert(2);
        let c = arena.insert(3);
        arena.remove(b);

        let seen: Vec<_> = arena.iter().map(|(h, v)| (h, *v)).collect();
        assert_eq!(seen, vec![(a, 1), (c, 3)]);
    }
}
