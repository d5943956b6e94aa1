//! Generational storage for descriptor bindings.
//!
//! Each key is composed of:
//! - **Slot**: position in the underlying `Vec` (low 32 bits)
//! - **Generation**: bumped every time the slot is freed (high 32 bits)
//!
//! The key travels through the kernel as epoll user data. Once a socket is
//! closed its slot's generation moves on, so a readiness event that was
//! already queued for the old registration (or for a new socket that got
//! the same descriptor number) can never be routed to the wrong binding.

use std::collections::VecDeque;

struct Slot<T> {
  generation: u32,
  entry: Option<T>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Index {
  generation: u32,
  slot: u32,
}

impl Index {
  fn as_u64(self) -> u64 {
    ((self.generation as u64) << 32) | (self.slot as u64)
  }

  fn from_u64(packed: u64) -> Self {
    Index { slot: (packed & 0xFFFF_FFFF) as u32, generation: (packed >> 32) as u32 }
  }
}

/// Growable store addressed by generational keys.
pub(crate) struct Store<T> {
  slots: Vec<Slot<T>>,
  free_list: VecDeque<u32>,
  len: usize,
}

impl<T> Default for Store<T> {
  fn default() -> Self {
    Self { slots: Vec::new(), free_list: VecDeque::new(), len: 0 }
  }
}

impl<T> Store<T> {
  pub fn with_capacity(cap: usize) -> Self {
    Self {
      slots: Vec::with_capacity(cap),
      free_list: VecDeque::with_capacity(cap),
      len: 0,
    }
  }

  /// Inserts `value` and returns its key.
  pub fn insert(&mut self, value: T) -> u64 {
    let index = match self.free_list.pop_front() {
      Some(slot) => Index { slot, generation: self.slots[slot as usize].generation },
      None => {
        let slot = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, entry: None });
        Index { slot, generation: 0 }
      }
    };

    let key = index.as_u64();
    let slot = &mut self.slots[index.slot as usize];
    debug_assert!(slot.entry.is_none(), "store: slot {} is occupied", index.slot);
    slot.entry = Some(value);
    self.len += 1;
    key
  }

  /// Removes the entry. Stale and unknown keys return `None`.
  pub fn remove(&mut self, key: u64) -> Option<T> {
    let index = Index::from_u64(key);
    let slot = self.slots.get_mut(index.slot as usize)?;
    if slot.generation != index.generation {
      return None;
    }

    let entry = slot.entry.take()?;
    slot.generation = slot.generation.wrapping_add(1);
    self.free_list.push_back(index.slot);
    self.len -= 1;
    Some(entry)
  }

  pub fn get(&self, key: u64) -> Option<&T> {
    let index = Index::from_u64(key);
    let slot = self.slots.get(index.slot as usize)?;
    if slot.generation == index.generation { slot.entry.as_ref() } else { None }
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.len
  }
}
