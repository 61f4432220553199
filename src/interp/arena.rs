//! Generational arena for interpreter objects
//!
//! Every handle carries the id of the heap that minted it, so a handle
//! smuggled in from another VM is told apart from a stale one.

use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_HEAP_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate a process-unique heap id
pub fn next_heap_id() -> u32 {
    NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed)
}

/// Address of one arena slot at one generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub heap: u32,
    pub index: u32,
    /// Bumped each time the slot is reused
    pub generation: u32,
}

/// Why a handle did not resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Slot is empty or was reused
    Stale,

    /// Handle was minted by another heap
    Foreign,
}

#[derive(Debug)]
struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub struct Arena<T> {
    heap: u32,
    entries: Vec<Entry<T>>,
    vacant: Vec<u32>,
    live: usize,
}

impl<T> Arena<T> {
    pub fn new(heap: u32) -> Self {
        Arena {
            heap,
            entries: Vec::new(),
            vacant: Vec::new(),
            live: 0,
        }
    }

    fn handle(&self, index: usize, generation: u32) -> Handle {
        Handle {
            heap: self.heap,
            index: index as u32,
            generation,
        }
    }

    /// Store `value`, preferring a vacated slot
    pub fn insert(&mut self, value: T) -> Handle {
        self.live += 1;
        match self.vacant.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                entry.generation = entry.generation.wrapping_add(1);
                entry.value = Some(value);
                let generation = entry.generation;
                self.handle(index as usize, generation)
            }
            None => {
                self.entries.push(Entry { generation: 0, value: Some(value) });
                self.handle(self.entries.len() - 1, 0)
            }
        }
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let index = self.locate(handle).ok()?;
        let value = self.entries[index].value.take()?;
        self.vacant.push(handle.index);
        self.live -= 1;
        Some(value)
    }

    pub fn get(&self, handle: Handle) -> Result<&T, Lookup> {
        let index = self.locate(handle)?;
        self.entries[index].value.as_ref().ok_or(Lookup::Stale)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T, Lookup> {
        let index = self.locate(handle)?;
        self.entries[index].value.as_mut().ok_or(Lookup::Stale)
    }

    /// Index of the entry `handle` points at, if it is ours and current
    fn locate(&self, handle: Handle) -> Result<usize, Lookup> {
        if handle.heap != self.heap {
            return Err(Lookup::Foreign);
        }
        match self.entries.get(handle.index as usize) {
            Some(entry) if entry.generation == handle.generation => Ok(handle.index as usize),
            _ => Err(Lookup::Stale),
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> + '_ {
        self.entries.iter().enumerate().filter_map(move |(i, entry)| {
            let value = entry.value.as_ref()?;
            Some((self.handle(i, entry.generation), value))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> + '_ {
        let heap = self.heap;
        self.entries.iter_mut().enumerate().filter_map(move |(i, entry)| {
            let generation = entry.generation;
            let value = entry.value.as_mut()?;
            Some((Handle { heap, index: i as u32, generation }, value))
        })
    }

    /// Drop every value `keep` rejects; returns how many were dropped
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let mut dropped = 0;
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if entry.value.as_ref().is_some_and(|v| !keep(v)) {
                entry.value = None;
                self.vacant.push(i as u32);
                dropped += 1;
            }
        }
        self.live -= dropped;
        dropped
    }
}
