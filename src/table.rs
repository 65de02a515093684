//! Bitmap-indexed object tables.
//!
//! Objects live in sublists of 64 slots. Each sublist keeps a free mask with
//! a set bit for every unoccupied slot. IDs are `((sublist << 6) | slot) + 1`
//! so that 0 never names an object.

use crate::error::{AlError, Result};

const SLOTS: usize = 64;
const MAX_SUBLISTS: usize = 1 << 25;

struct SubList<T> {
    free_mask: u64,
    items: Box<[Option<T>; SLOTS]>,
}

impl<T> SubList<T> {
    fn new() -> Self {
        Self {
            free_mask: !0,
            items: Box::new(std::array::from_fn(|_| None)),
        }
    }
}

/// A table of objects keyed by small non-zero integer IDs.
pub(crate) struct IdTable<T> {
    sublists: Vec<SubList<T>>,
    len: usize,
    limit: Option<usize>,
    kind: &'static str,
}

impl<T> IdTable<T> {
    pub(crate) fn new(kind: &'static str) -> Self {
        Self {
            sublists: Vec::new(),
            len: 0,
            limit: None,
            kind,
        }
    }

    /// Caps the number of live objects.
    pub(crate) fn with_limit(kind: &'static str, limit: Option<usize>) -> Self {
        Self {
            limit,
            ..Self::new(kind)
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn split(id: u32) -> Option<(usize, usize)> {
        let index = id.checked_sub(1)? as usize;
        Some((index >> 6, index & 0x3f))
    }

    /// Reserves room for `count` more objects without allocating any.
    fn ensure_free(&mut self, count: usize) -> Result<()> {
        if let Some(limit) = self.limit {
            if count > limit.saturating_sub(self.len) {
                return Err(AlError::OutOfMemory(format!(
                    "exceeding {} {} limit ({} + {})",
                    limit, self.kind, self.len, count
                )));
            }
        }

        let mut available: usize = self
            .sublists
            .iter()
            .map(|s| s.free_mask.count_ones() as usize)
            .sum();
        if available >= count {
            return Ok(());
        }

        let needed = (count - available).div_ceil(SLOTS);
        if self.sublists.len() + needed > MAX_SUBLISTS {
            return Err(AlError::OutOfMemory(format!(
                "too many {} allocated",
                self.kind
            )));
        }
        self.sublists.try_reserve(needed).map_err(|_| {
            AlError::OutOfMemory(format!("failed to grow {} table", self.kind))
        })?;
        while available < count {
            self.sublists.push(SubList::new());
            available += SLOTS;
        }
        Ok(())
    }

    /// Inserts one object and returns its ID.
    #[cfg(test)]
    pub(crate) fn insert(&mut self, value: T) -> Result<u32> {
        self.ensure_free(1)?;
        Ok(self.insert_unchecked(|_| value))
    }

    fn insert_unchecked(&mut self, make: impl FnOnce(u32) -> T) -> u32 {
        for (index, sublist) in self.sublists.iter_mut().enumerate() {
            if sublist.free_mask == 0 {
                continue;
            }
            let slot = sublist.free_mask.trailing_zeros() as usize;
            let id = ((index << 6) | slot) as u32 + 1;
            sublist.items[slot] = Some(make(id));
            sublist.free_mask &= !(1u64 << slot);
            self.len += 1;
            return id;
        }
        unreachable!("ensure_free guarantees a free slot")
    }

    /// Allocates `count` objects from `make`, all or none. `make` receives
    /// the ID of the object it builds.
    pub(crate) fn insert_n(&mut self, count: usize, mut make: impl FnMut(u32) -> T) -> Result<Vec<u32>> {
        self.ensure_free(count)?;
        let mut ids = Vec::new();
        ids.try_reserve_exact(count)
            .map_err(|_| AlError::OutOfMemory(format!("{} id list", self.kind)))?;
        for _ in 0..count {
            ids.push(self.insert_unchecked(&mut make));
        }
        Ok(ids)
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn get(&self, id: u32) -> Option<&T> {
        let (list, slot) = Self::split(id)?;
        let sublist = self.sublists.get(list)?;
        if sublist.free_mask & (1u64 << slot) != 0 {
            return None;
        }
        sublist.items[slot].as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        let (list, slot) = Self::split(id)?;
        let sublist = self.sublists.get_mut(list)?;
        if sublist.free_mask & (1u64 << slot) != 0 {
            return None;
        }
        sublist.items[slot].as_mut()
    }

    /// Looks up an ID, failing with `InvalidName`.
    pub(crate) fn lookup(&self, id: u32) -> Result<&T> {
        self.get(id)
            .ok_or_else(|| AlError::InvalidName(format!("invalid {} ID {}", self.kind, id)))
    }

    pub(crate) fn lookup_mut(&mut self, id: u32) -> Result<&mut T> {
        let kind = self.kind;
        self.get_mut(id)
            .ok_or_else(|| AlError::InvalidName(format!("invalid {} ID {}", kind, id)))
    }

    /// Destroys the object and frees its slot.
    pub(crate) fn remove(&mut self, id: u32) -> Option<T> {
        let (list, slot) = Self::split(id)?;
        let sublist = self.sublists.get_mut(list)?;
        if sublist.free_mask & (1u64 << slot) != 0 {
            return None;
        }
        let value = sublist.items[slot].take();
        sublist.free_mask |= 1u64 << slot;
        self.len -= 1;
        value
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.sublists.iter().enumerate().flat_map(|(index, sublist)| {
            sublist
                .items
                .iter()
                .enumerate()
                .filter_map(move |(slot, item)| {
                    item.as_ref().map(|v| (((index << 6) | slot) as u32 + 1, v))
                })
        })
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.sublists
            .iter_mut()
            .enumerate()
            .flat_map(|(index, sublist)| {
                sublist
                    .items
                    .iter_mut()
                    .enumerate()
                    .filter_map(move |(slot, item)| {
                        item.as_mut().map(|v| (((index << 6) | slot) as u32 + 1, v))
                    })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_start_at_one() {
        let mut table = IdTable::new("source");
        assert_eq!(table.insert('a').unwrap(), 1);
        assert_eq!(table.insert('b').unwrap(), 2);
        assert_eq!(table.get(0), None);
        assert_eq!(table.get(1), Some(&'a'));
        assert_eq!(table.get(3), None);
    }

    #[test]
    fn test_freed_slot_is_reused_lowest_first() {
        let mut table = IdTable::new("buffer");
        let ids = table.insert_n(70, |_| 0u8).unwrap();
        assert_eq!(ids.len(), 70);
        assert_eq!(ids[64], 65);
        let more = table.insert_n(2, |id| id as u8).unwrap();
        assert_eq!(table.get(more[1]), Some(&(more[1] as u8)));
        assert_eq!(table.remove(5), Some(0));
        assert!(!table.contains(5));
        assert_eq!(table.remove(5), None);
        assert_eq!(table.insert(1).unwrap(), 5);
    }

    #[test]
    fn test_unique_ids_under_churn() {
        let mut table = IdTable::new("effect slot");
        let mut live = HashSet::new();
        for round in 0..20u32 {
            for id in table.insert_n(37, |_| round).unwrap() {
                assert!(live.insert(id), "id {} handed out twice", id);
            }
            let doomed: Vec<u32> = live.iter().copied().filter(|id| id % 3 == round % 3).collect();
            for id in doomed {
                assert!(table.remove(id).is_some());
                assert!(!table.contains(id));
                live.remove(&id);
            }
        }
        assert_eq!(table.len(), live.len());
        assert_eq!(table.iter().count(), live.len());
    }

    #[test]
    fn test_limit_is_all_or_nothing() {
        let mut table = IdTable::with_limit("source", Some(4));
        table.insert_n(3, |_| ()).unwrap();
        let err = table.insert_n(2, |_| ()).unwrap_err();
        assert!(matches!(err, AlError::OutOfMemory(_)));
        assert_eq!(table.len(), 3);
        assert!(table.insert(()).is_ok());
    }

    #[test]
    fn test_lookup_reports_invalid_name() {
        let table: IdTable<u8> = IdTable::new("filter");
        assert!(matches!(table.lookup(9), Err(AlError::InvalidName(_))));
    }
}
