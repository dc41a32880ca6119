//! Generational slot tables.
//!
//! A [`SlotTable`] stores values in a dense arena and hands out [`Handle`]s
//! made of an index and a generation. Freed indices go on a free-list stack
//! and are reused before the arena grows; every reuse bumps the slot's
//! generation, so a handle to a freed value never resolves to its successor.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Typed index + generation pair.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// A handle that never resolves.
    pub const INVALID: Self = Self::new(u32::MAX, u32::MAX);

    pub const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_invalid(&self) -> bool {
        self.index == u32::MAX
    }

    /// Same index and generation, different tag.
    pub(crate) fn cast<U>(self) -> Handle<U> {
        Handle::new(self.index, self.generation)
    }
}

// Manual impls: derives would put bounds on `T`.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    capacity: usize,
    len: usize,
}

impl<T> SlotTable<T> {
    /// Table holding at most `capacity` live values.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores `value`, or gives it back when the table is full.
    pub fn insert(&mut self, value: T) -> Result<Handle<T>, T> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.value = Some(value);
            self.len += 1;
            return Ok(Handle::new(index, slot.generation));
        }

        if self.slots.len() >= self.capacity {
            return Err(value);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        self.len += 1;
        Ok(Handle::new(index, 0))
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Removes the value; its index becomes reusable under a new generation.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?;
        let value = slot.value.take()?;
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    /// Advances the generation of a live slot in place, invalidating
    /// outstanding handles to it. Returns the new handle.
    pub fn bump(&mut self, handle: Handle<T>) -> Option<Handle<T>> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.value.is_some())?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(Handle::new(handle.index, slot.generation))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(index as u32, slot.generation), value))
        })
    }

    /// Removes every value, keeping generations so old handles stay stale.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                self.free.push(index as u32);
                out.push(value);
            }
        }
        self.len = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuse_bumps_generation() {
        let mut table = SlotTable::with_capacity(4);
        let a = table.insert("a").unwrap();
        assert_eq!(table.remove(a), Some("a"));

        let b = table.insert("b").unwrap();
        assert_eq!(b.index(), a.index());
        assert!(b.generation() > a.generation());
        assert!(table.get(a).is_none());
        assert_eq!(table.get(b), Some(&"b"));
    }

    #[test]
    fn free_list_is_a_stack() {
        let mut table = SlotTable::with_capacity(8);
        let handles: Vec<_> = (0..4).map(|i| table.insert(i).unwrap()).collect();
        table.remove(handles[1]);
        table.remove(handles[3]);

        assert_eq!(table.insert(10).unwrap().index(), 3);
        assert_eq!(table.insert(11).unwrap().index(), 1);
        assert_eq!(table.insert(12).unwrap().index(), 4);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut table = SlotTable::with_capacity(2);
        table.insert(1).unwrap();
        let second = table.insert(2).unwrap();
        assert_eq!(table.insert(3), Err(3));

        table.remove(second);
        assert!(table.insert(3).is_ok());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn stale_handles_are_rejected() {
        let mut table = SlotTable::with_capacity(2);
        let a = table.insert(1).unwrap();
        let a2 = table.bump(a).unwrap();

        assert!(table.get(a).is_none());
        assert!(table.remove(a).is_none());
        assert_eq!(table.get_mut(a2).copied(), Some(1));
        assert!(table.get(Handle::INVALID).is_none());
    }

    #[test]
    fn drain_keeps_generations() {
        let mut table = SlotTable::with_capacity(3);
        let a = table.insert('a').unwrap();
        table.insert('b').unwrap();

        assert_eq!(table.drain().len(), 2);
        assert!(table.is_empty());
        let c = table.insert('c').unwrap();
        assert!(!table.contains(a));
        assert_ne!(c, a);
    }
}
