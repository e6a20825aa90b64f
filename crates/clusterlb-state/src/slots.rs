//! Fixed-capacity slot table.
//!
//! The storage primitive under every entity table: a vector of slots,
//! each free or holding one record. A record's identity is its slot id,
//! stable for the record's lifetime. Each slot also carries a generation
//! that is bumped whenever the slot is grabbed, so a stale `(id,
//! generation)` pair can be told apart from the record now occupying
//! the slot.
//!
//! Callbacks passed to [`SlotTable::doall`] and friends run under the
//! table's lock and must not call back into the same table.

use std::ops::ControlFlow;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{StateError, StateResult};

/// Slot index inside a table.
pub type SlotId = u32;

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    value: Option<T>,
}

/// A capacity-bounded keyed store with scan-based lookups.
#[derive(Debug)]
pub struct SlotTable<T> {
    name: &'static str,
    slots: RwLock<Vec<Slot<T>>>,
}

impl<T> SlotTable<T> {
    /// Create a table with `capacity` free slots.
    pub fn create(name: &'static str, capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                value: None,
            })
            .collect();
        Self {
            name,
            slots: RwLock::new(slots),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Configured capacity.
    pub fn num_slots(&self) -> usize {
        self.read().len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.read().iter().filter(|s| s.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Slot<T>>> {
        self.slots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Slot<T>>> {
        self.slots.write().unwrap_or_else(|e| e.into_inner())
    }

    fn out_of_range(&self, id: SlotId) -> StateError {
        StateError::OutOfRange {
            table: self.name,
            id,
        }
    }

    fn not_found(&self, id: SlotId) -> StateError {
        StateError::NotFound(format!("{} slot {id}", self.name))
    }

    /// Allocate the first free slot and fill it with `init(id,
    /// generation)`.
    pub fn grab_with(&self, init: impl FnOnce(SlotId, u64) -> T) -> StateResult<SlotId> {
        let mut slots = self.write();
        Self::grab_locked(self.name, &mut slots, init)
    }

    fn grab_locked(
        name: &'static str,
        slots: &mut [Slot<T>],
        init: impl FnOnce(SlotId, u64) -> T,
    ) -> StateResult<SlotId> {
        let capacity = slots.len();
        let (index, slot) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.value.is_none())
            .ok_or(StateError::Full {
                table: name,
                capacity,
            })?;
        let id = index as SlotId;
        slot.generation += 1;
        slot.value = Some(init(id, slot.generation));
        Ok(id)
    }

    /// Free a slot, returning the record it held.
    pub fn release(&self, id: SlotId) -> StateResult<T> {
        let mut slots = self.write();
        let slot = slots
            .get_mut(id as usize)
            .ok_or_else(|| self.out_of_range(id))?;
        slot.value.take().ok_or_else(|| self.not_found(id))
    }

    /// Generation of the record currently held in `id`.
    pub fn generation(&self, id: SlotId) -> StateResult<u64> {
        let slots = self.read();
        let slot = slots.get(id as usize).ok_or_else(|| self.out_of_range(id))?;
        match slot.value {
            Some(_) => Ok(slot.generation),
            None => Err(self.not_found(id)),
        }
    }

    /// Run `f` against the record held in `id`.
    pub fn with<R>(&self, id: SlotId, f: impl FnOnce(&T) -> R) -> StateResult<R> {
        let slots = self.read();
        let slot = slots.get(id as usize).ok_or_else(|| self.out_of_range(id))?;
        slot.value.as_ref().map(f).ok_or_else(|| self.not_found(id))
    }

    /// Mutate the record held in `id` in place.
    pub fn update<R>(&self, id: SlotId, f: impl FnOnce(&mut T) -> R) -> StateResult<R> {
        let mut slots = self.write();
        let name = self.name;
        let slot = slots
            .get_mut(id as usize)
            .ok_or(StateError::OutOfRange { table: name, id })?;
        slot.value
            .as_mut()
            .map(f)
            .ok_or_else(|| StateError::NotFound(format!("{name} slot {id}")))
    }

    /// [`SlotTable::update`], only while `id` still holds the record of
    /// `generation`. A reused slot answers `NotFound`.
    pub fn update_if<R>(
        &self,
        id: SlotId,
        generation: u64,
        f: impl FnOnce(&mut T) -> R,
    ) -> StateResult<R> {
        let mut slots = self.write();
        let name = self.name;
        let slot = slots
            .get_mut(id as usize)
            .ok_or(StateError::OutOfRange { table: name, id })?;
        if slot.generation != generation {
            return Err(StateError::NotFound(format!(
                "{name} slot {id} generation {generation}"
            )));
        }
        slot.value
            .as_mut()
            .map(f)
            .ok_or_else(|| StateError::NotFound(format!("{name} slot {id}")))
    }

    /// Apply `f` to every occupied slot in id order, stopping at the
    /// first `Break` and returning its value.
    pub fn doall<R>(&self, mut f: impl FnMut(SlotId, &T) -> ControlFlow<R>) -> Option<R> {
        let slots = self.read();
        for (index, slot) in slots.iter().enumerate() {
            if let Some(value) = &slot.value {
                if let ControlFlow::Break(found) = f(index as SlotId, value) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Mutable variant of [`SlotTable::doall`].
    pub fn doall_mut<R>(&self, mut f: impl FnMut(SlotId, &mut T) -> ControlFlow<R>) -> Option<R> {
        let mut slots = self.write();
        for (index, slot) in slots.iter_mut().enumerate() {
            if let Some(value) = &mut slot.value {
                if let ControlFlow::Break(found) = f(index as SlotId, value) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// First occupied slot whose record satisfies `pred`.
    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<SlotId> {
        self.doall(|id, value| {
            if pred(value) {
                ControlFlow::Break(id)
            } else {
                ControlFlow::Continue(())
            }
        })
    }

    /// Scan for a record matching `matches`; update it in place if found,
    /// otherwise grab a new slot with `insert`. Scan and allocation happen
    /// under one write lock. Returns the slot id and whether it was
    /// created.
    pub fn upsert(
        &self,
        mut matches: impl FnMut(&T) -> bool,
        update: impl FnOnce(SlotId, &mut T),
        insert: impl FnOnce(SlotId, u64) -> T,
    ) -> StateResult<(SlotId, bool)> {
        let mut slots = self.write();
        let existing = slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.value.as_ref().is_some_and(&mut matches));
        if let Some((index, slot)) = existing {
            let id = index as SlotId;
            if let Some(value) = slot.value.as_mut() {
                update(id, value);
            }
            return Ok((id, false));
        }
        let id = Self::grab_locked(self.name, &mut slots, insert)?;
        Ok((id, true))
    }

    /// Fill `out` with the ids of occupied slots, returning the count.
    pub fn used_ids(&self, out: &mut Vec<SlotId>) -> usize {
        out.clear();
        let slots = self.read();
        out.extend(
            slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.value.is_some())
                .map(|(i, _)| i as SlotId),
        );
        out.len()
    }

    /// Put a record back into a specific slot with a known generation.
    /// Used when restoring a persisted image.
    pub fn restore(&self, id: SlotId, generation: u64, value: T) -> StateResult<()> {
        let mut slots = self.write();
        let name = self.name;
        let slot = slots
            .get_mut(id as usize)
            .ok_or(StateError::OutOfRange { table: name, id })?;
        slot.generation = generation;
        slot.value = Some(value);
        Ok(())
    }

    /// Release every slot.
    pub fn clear(&self) {
        for slot in self.write().iter_mut() {
            slot.value = None;
        }
    }
}

impl<T: Clone> SlotTable<T> {
    /// Copy of the record held in `id`.
    pub fn get(&self, id: SlotId) -> StateResult<T> {
        self.with(id, T::clone)
    }

    /// Copy of every occupied slot as `(id, generation, record)`.
    pub fn entries(&self) -> Vec<(SlotId, u64, T)> {
        let slots = self.read();
        slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.value.clone().map(|v| (i as SlotId, s.generation, v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grab_returns_first_free_slot() {
        let table = SlotTable::create("test", 3);
        assert_eq!(table.grab_with(|_, _| "a").unwrap(), 0);
        assert_eq!(table.grab_with(|_, _| "b").unwrap(), 1);
        table.release(0).unwrap();
        assert_eq!(table.grab_with(|_, _| "c").unwrap(), 0);
        assert_eq!(table.get(0).unwrap(), "c");
    }

    #[test]
    fn grab_fails_when_full() {
        let table = SlotTable::create("test", 1);
        table.grab_with(|_, _| 1).unwrap();
        let err = table.grab_with(|_, _| 2).unwrap_err();
        assert!(matches!(err, StateError::Full { capacity: 1, .. }));
    }

    #[test]
    fn update_if_skips_a_reused_slot() {
        let table = SlotTable::create("test", 1);
        let id = table.grab_with(|_, _| 10).unwrap();
        let stale = table.generation(id).unwrap();
        table.update_if(id, stale, |v| *v += 1).unwrap();
        assert_eq!(table.get(id).unwrap(), 11);

        table.release(id).unwrap();
        table.grab_with(|_, _| 20).unwrap();
        let err = table.update_if(id, stale, |v| *v += 1).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(table.get(id).unwrap(), 20);
    }

    #[test]
    fn generation_bumps_on_reuse() {
        let table = SlotTable::create("test", 1);
        let id = table.grab_with(|_, _| 1).unwrap();
        let first = table.generation(id).unwrap();
        table.release(id).unwrap();
        table.grab_with(|_, _| 2).unwrap();
        assert_eq!(table.generation(id).unwrap(), first + 1);
    }

    #[test]
    fn released_and_out_of_range_slots_are_errors() {
        let table: SlotTable<u8> = SlotTable::create("test", 2);
        assert!(table.get(0).unwrap_err().is_not_found());
        assert!(matches!(
            table.get(9).unwrap_err(),
            StateError::OutOfRange { id: 9, .. }
        ));
        assert!(table.release(1).is_err());
    }

    #[test]
    fn doall_stops_at_first_break() {
        let table = SlotTable::create("test", 4);
        for v in [10, 20, 30] {
            table.grab_with(|_, _| v).unwrap();
        }
        let mut visited = 0;
        let found = table.doall(|id, v| {
            visited += 1;
            if *v == 20 {
                ControlFlow::Break(id)
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(found, Some(1));
        assert_eq!(visited, 2);
    }

    #[test]
    fn upsert_updates_or_inserts() {
        let table = SlotTable::create("test", 4);
        let (id, created) = table
            .upsert(|v: &(u8, u8)| v.0 == 1, |_, v| v.1 = 9, |_, _| (1, 0))
            .unwrap();
        assert!(created);
        let (again, created) = table
            .upsert(|v| v.0 == 1, |_, v| v.1 = 9, |_, _| (1, 0))
            .unwrap();
        assert!(!created);
        assert_eq!(id, again);
        assert_eq!(table.get(id).unwrap(), (1, 9));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn used_ids_lists_occupied_slots() {
        let table = SlotTable::create("test", 5);
        for v in 0..4 {
            table.grab_with(|_, _| v).unwrap();
        }
        table.release(2).unwrap();
        let mut ids = Vec::new();
        assert_eq!(table.used_ids(&mut ids), 3);
        assert_eq!(ids, vec![0, 1, 3]);
    }

    #[test]
    fn restore_places_record_at_id() {
        let table = SlotTable::create("test", 3);
        table.restore(2, 7, "x").unwrap();
        assert_eq!(table.generation(2).unwrap(), 7);
        assert_eq!(table.entries(), vec![(2, 7, "x")]);
    }
}
