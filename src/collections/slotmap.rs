const NONE: u32 = u32::MAX;

/// Fixed-capacity slot map. Free slots form an intrusive list threaded
/// through the vacant entries, so acquiring and releasing a slot is O(1)
/// and the most recently released index is handed out first.
#[derive(Debug)]
pub struct SlotMap<T> {
    head: u32,
    len: usize,
    entries: Vec<Result<T, u32>>,
}
impl<T> SlotMap<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(NONE as usize);
        let entries = (0..capacity)
            .map(|i| Err(if i + 1 < capacity { i as u32 + 1 } else { NONE }))
            .collect();
        Self {
            head: if capacity == 0 { NONE } else { 0 },
            len: 0,
            entries,
        }
    }
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn get(&self, i: usize) -> Option<&T> {
        self.entries.get(i).and_then(|r| r.as_ref().ok())
    }
    pub fn get_mut(&mut self, i: usize) -> Option<&mut T> {
        self.entries.get_mut(i).and_then(|r| r.as_mut().ok())
    }
    /// Index the next `insert` will use, if there is room.
    pub fn next_idx(&self) -> Option<usize> {
        (self.head != NONE).then(|| self.head as usize)
    }
    /// Stores `value` in a vacant slot. Hands the value back when full.
    pub fn insert(&mut self, value: T) -> Result<usize, T> {
        if self.head == NONE {
            return Err(value);
        }
        let id = self.head as usize;
        match core::mem::replace(&mut self.entries[id], Ok(value)) {
            Err(next) => self.head = next,
            Ok(_) => unreachable!("free list pointed at an occupied slot"),
        }
        self.len += 1;
        Ok(id)
    }
    pub fn release(&mut self, i: usize) -> Option<T> {
        let head = self.head;
        let entry = self.entries.get_mut(i)?;
        if entry.is_err() {
            return None;
        }
        self.head = i as u32;
        self.len -= 1;
        core::mem::replace(entry, Err(head)).ok()
    }
}
pub struct Iter<'a, T> {
    entries: core::iter::Enumerate<core::slice::Iter<'a, Result<T, u32>>>,
}
impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (usize, &'a T);
    fn next(&mut self) -> Option<Self::Item> {
        for (i, v) in self.entries.by_ref() {
            if let Ok(v) = v {
                return Some((i, v));
            }
        }
        None
    }
}
pub struct IterMut<'a, T> {
    entries: core::iter::Enumerate<core::slice::IterMut<'a, Result<T, u32>>>,
}
impl<'a, T> Iterator for IterMut<'a, T> {
    type Item = (usize, &'a mut T);
    fn next(&mut self) -> Option<Self::Item> {
        for (i, v) in self.entries.by_ref() {
            if let Ok(v) = v {
                return Some((i, v));
            }
        }
        None
    }
}
impl<T> SlotMap<T> {
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { entries: self.entries.iter().enumerate() }
    }
    pub fn iter_mut(&mut self) -> IterMut<'_, T> {
        IterMut { entries: self.entries.iter_mut().enumerate() }
    }
    pub fn retain(&mut self, mut f: impl FnMut(usize, &mut T) -> bool) {
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if let Ok(item) = entry {
                if !f(i, item) {
                    *entry = Err(core::mem::replace(&mut self.head, i as u32));
                    self.len -= 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_densely_then_refuses() {
        let mut map = SlotMap::with_capacity(3);
        assert_eq!(map.insert('a'), Ok(0));
        assert_eq!(map.insert('b'), Ok(1));
        assert_eq!(map.insert('c'), Ok(2));
        assert_eq!(map.next_idx(), None);
        assert_eq!(map.insert('d'), Err('d'));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn released_ids_are_reused_first() {
        let mut map = SlotMap::with_capacity(4);
        for v in 0..4 {
            map.insert(v).unwrap();
        }
        assert_eq!(map.release(1), Some(1));
        assert_eq!(map.release(1), None);
        assert_eq!(map.get(1), None);
        assert_eq!(map.next_idx(), Some(1));
        assert_eq!(map.insert(10), Ok(1));
        assert_eq!(map.get(1), Some(&10));
    }

    #[test]
    fn retain_returns_slots_to_free_list() {
        let mut map = SlotMap::with_capacity(4);
        for v in 0..4 {
            map.insert(v).unwrap();
        }
        map.retain(|_, v| *v % 2 == 0);
        assert_eq!(map.len(), 2);
        let kept: Vec<_> = map.iter().map(|(i, v)| (i, *v)).collect();
        assert_eq!(kept, vec![(0, 0), (2, 2)]);
        assert!(map.insert(7).is_ok());
        assert!(map.insert(8).is_ok());
        assert!(map.insert(9).is_err());
    }

    #[test]
    fn zero_capacity_is_always_full() {
        let mut map = SlotMap::<u8>::with_capacity(0);
        assert_eq!(map.next_idx(), None);
        assert_eq!(map.insert(1), Err(1));
    }
}
