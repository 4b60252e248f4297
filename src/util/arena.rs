//! Generational arena backing the task table.
//!
//! Task records live in a slot vector; a freed slot is recycled through a
//! free list, and a per-slot generation counter makes stale `TaskId`s
//! unresolvable instead of aliasing the new occupant. No unsafe code;
//! bounds checks and generation validation do the work.

use core::fmt;

/// An index into an [`Arena`], tagged with the slot's generation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArenaIndex {
    index: u32,
    generation: u32,
}

impl ArenaIndex {
    /// Returns the raw slot index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Returns the generation counter.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ArenaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaIndex({}:{})", self.index, self.generation)
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { value: T, generation: u32 },
    Vacant { next_free: Option<u32>, generation: u32 },
}

/// Slot vector with generational indices and free-list reuse.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

// Manual impl: an empty arena needs no `T: Default`.
impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Creates an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Number of occupied slots.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True when no slot is occupied.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a value and returns its index.
    pub fn insert(&mut self, value: T) -> ArenaIndex {
        self.len += 1;
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            match slot {
                Slot::Vacant {
                    next_free,
                    generation,
                } => {
                    let generation = *generation;
                    self.free_head = *next_free;
                    *slot = Slot::Occupied { value, generation };
                    ArenaIndex { index, generation }
                }
                Slot::Occupied { .. } => unreachable!("free list pointed to occupied slot"),
            }
        } else {
            let index = u32::try_from(self.slots.len()).expect("arena overflow");
            self.slots.push(Slot::Occupied {
                value,
                generation: 0,
            });
            ArenaIndex {
                index,
                generation: 0,
            }
        }
    }

    /// Inserts the value produced by `f`, which receives the assigned
    /// index. Lets records embed their final id without a placeholder
    /// update.
    pub fn insert_with<F>(&mut self, f: F) -> ArenaIndex
    where
        F: FnOnce(ArenaIndex) -> T,
    {
        if let Some(index) = self.free_head {
            let (next_free, generation) = match self.slots[index as usize] {
                Slot::Vacant {
                    next_free,
                    generation,
                } => (next_free, generation),
                Slot::Occupied { .. } => unreachable!("free list pointed to occupied slot"),
            };
            let idx = ArenaIndex { index, generation };
            let value = f(idx);
            self.free_head = next_free;
            self.slots[index as usize] = Slot::Occupied { value, generation };
            self.len += 1;
            idx
        } else {
            let index = u32::try_from(self.slots.len()).expect("arena overflow");
            let idx = ArenaIndex {
                index,
                generation: 0,
            };
            let value = f(idx);
            self.slots.push(Slot::Occupied {
                value,
                generation: 0,
            });
            self.len += 1;
            idx
        }
    }

    /// Removes and returns the value at `index`.
    ///
    /// Returns `None` if the index is stale or the slot is vacant.
    pub fn remove(&mut self, index: ArenaIndex) -> Option<T> {
        let slot = self.slots.get_mut(index.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == index.generation => {
                let next_generation = generation.wrapping_add(1);
                let old = core::mem::replace(
                    slot,
                    Slot::Vacant {
                        next_free: self.free_head,
                        generation: next_generation,
                    },
                );
                self.free_head = Some(index.index);
                self.len -= 1;
                match old {
                    Slot::Occupied { value, .. } => Some(value),
                    Slot::Vacant { .. } => unreachable!(),
                }
            }
            _ => None,
        }
    }

    /// Returns a reference to the value at `index`, if current.
    #[inline]
    #[must_use]
    pub fn get(&self, index: ArenaIndex) -> Option<&T> {
        match self.slots.get(index.index as usize)? {
            Slot::Occupied { value, generation } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// Returns a mutable reference to the value at `index`, if current.
    #[inline]
    pub fn get_mut(&mut self, index: ArenaIndex) -> Option<&mut T> {
        match self.slots.get_mut(index.index as usize)? {
            Slot::Occupied { value, generation } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// True if `index` resolves to an occupied slot.
    #[must_use]
    pub fn contains(&self, index: ArenaIndex) -> bool {
        self.get(index).is_some()
    }

    /// Iterates over occupied slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (ArenaIndex, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Occupied { value, generation } => Some((
                    ArenaIndex {
                        index: i as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_needs_no_default_element() {
        struct Opaque(#[allow(dead_code)] u8);
        let arena: Arena<Opaque> = Arena::default();
        assert!(arena.is_empty());
    }

    #[test]
    fn insert_and_get() {
        let mut arena = Arena::new();
        let idx = arena.insert(42);
        assert_eq!(arena.get(idx), Some(&42));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn remove_invalidates_and_reuses() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        let b = arena.insert(2);

        assert_eq!(arena.remove(a), Some(1));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);

        let c = arena.insert(3);
        assert_eq!(c.index(), a.index());
        assert_ne!(c.generation(), a.generation());
        assert_eq!(arena.get(b), Some(&2));
        assert_eq!(arena.get(c), Some(&3));
    }

    #[test]
    fn stale_index_never_aliases() {
        let mut arena = Arena::new();
        let old = arena.insert("first");
        arena.remove(old);
        let new = arena.insert("second");
        assert_eq!(old.index(), new.index());
        assert_eq!(arena.get(old), None);
        assert_eq!(arena.get(new), Some(&"second"));
    }

    #[test]
    fn iter_visits_occupied_only() {
        let mut arena = Arena::new();
        let a = arena.insert(10);
        let b = arena.insert(20);
        let c = arena.insert(30);
        arena.remove(b);
        let seen: Vec<_> = arena.iter().map(|(idx, v)| (idx, *v)).collect();
        assert_eq!(seen, vec![(a, 10), (c, 30)]);
    }

    #[test]
    fn insert_with_sees_final_index() {
        let mut arena = Arena::new();
        let idx = arena.insert_with(|idx| idx.index());
        assert_eq!(arena.get(idx), Some(&idx.index()));

        arena.remove(idx);
        let reused = arena.insert_with(|idx| idx.index());
        assert_eq!(reused.index(), idx.index());
        assert_ne!(reused.generation(), idx.generation());
    }

    #[test]
    fn get_mut_updates_in_place() {
        let mut arena = Arena::new();
        let idx = arena.insert(5);
        if let Some(v) = arena.get_mut(idx) {
            *v = 6;
        }
        assert_eq!(arena.get(idx), Some(&6));
    }
}
