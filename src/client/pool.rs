//! Size-classed free-list storage for completion records.
//!
//! Slots are recycled rather than freed. Each slot carries a generation that
//! is bumped when it is released, and a [`SlotHandle`] only resolves while its
//! generation matches, so a handle kept past release can never reach the
//! record that later reuses the slot.

use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    /// One-shot read and write completions
    Notify,
    /// Long-lived subscriptions
    Subscription,
}

impl SizeClass {
    fn index(&self) -> usize {
        match self {
            SizeClass::Notify => 0,
            SizeClass::Subscription => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    class: SizeClass,
    index: u32,
    generation: u32,
}

impl SlotHandle {
    pub fn class(&self) -> SizeClass {
        self.class
    }
    pub fn index(&self) -> u32 {
        self.index
    }
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    allocated: bool,
    value: Option<T>,
}

#[derive(Debug)]
struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> Arena<T> {
    fn live_slot(&mut self, handle: SlotHandle) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.allocated && s.generation == handle.generation)
    }
}

#[derive(Debug)]
pub struct CompletionPool<T> {
    arenas: [Mutex<Arena<T>>; 2],
}

impl<T> Default for CompletionPool<T> {
    fn default() -> Self {
        CompletionPool {
            arenas: [Mutex::default(), Mutex::default()],
        }
    }
}

impl<T> CompletionPool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn arena(&self, class: SizeClass) -> MutexGuard<'_, Arena<T>> {
        self.arenas[class.index()]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Store a record, reusing a released slot of the class if there is one
    pub fn allocate(&self, class: SizeClass, value: T) -> SlotHandle {
        let mut arena = self.arena(class);
        let index = match arena.free.pop() {
            Some(index) => index,
            None => {
                arena.slots.push(Slot {
                    generation: 0,
                    allocated: false,
                    value: None,
                });
                (arena.slots.len() - 1) as u32
            }
        };
        let slot = &mut arena.slots[index as usize];
        slot.allocated = true;
        slot.value = Some(value);
        SlotHandle {
            class,
            index,
            generation: slot.generation,
        }
    }

    /// Return a slot to its free list, handing back the record if it was
    /// not currently taken. Releasing a stale handle does nothing.
    pub fn release(&self, handle: SlotHandle) -> Option<T> {
        let mut arena = self.arena(handle.class);
        let slot = arena.live_slot(handle)?;
        let value = slot.value.take();
        slot.allocated = false;
        slot.generation = slot.generation.wrapping_add(1);
        arena.free.push(handle.index);
        value
    }

    /// Move the record out while leaving the slot allocated, so that it can be
    /// used without holding the pool lock.
    pub fn take(&self, handle: SlotHandle) -> Option<T> {
        self.arena(handle.class).live_slot(handle)?.value.take()
    }

    /// Put back a record removed with [`CompletionPool::take`]. If the slot was
    /// released in the meantime the record is returned to the caller.
    pub fn restore(&self, handle: SlotHandle, value: T) -> Result<(), T> {
        let mut arena = self.arena(handle.class);
        match arena.live_slot(handle) {
            Some(slot) if slot.value.is_none() => {
                slot.value = Some(value);
                Ok(())
            }
            _ => Err(value),
        }
    }

    /// Run a closure against a live record
    pub fn with<R>(&self, handle: SlotHandle, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.arena(handle.class)
            .live_slot(handle)?
            .value
            .as_mut()
            .map(f)
    }

    pub fn contains(&self, handle: SlotHandle) -> bool {
        self.arena(handle.class).live_slot(handle).is_some()
    }

    /// Number of slots currently handed out in a class
    pub fn allocated(&self, class: SizeClass) -> usize {
        let arena = self.arena(class);
        arena.slots.len() - arena.free.len()
    }

    /// Number of slots ever created in a class
    pub fn capacity(&self, class: SizeClass) -> usize {
        self.arena(class).slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_reused_with_new_generation() {
        let pool = CompletionPool::new();
        let first = pool.allocate(SizeClass::Notify, "read");
        assert_eq!(pool.release(first), Some("read"));
        let second = pool.allocate(SizeClass::Notify, "write");
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert_eq!(pool.capacity(SizeClass::Notify), 1);
        // The old handle no longer reaches anything
        assert!(!pool.contains(first));
        assert_eq!(pool.take(first), None);
        assert_eq!(pool.release(first), None);
        assert_eq!(pool.with(second, |v| *v), Some("write"));
    }

    #[test]
    fn classes_are_separate() {
        let pool = CompletionPool::new();
        let notify = pool.allocate(SizeClass::Notify, 1);
        let sub = pool.allocate(SizeClass::Subscription, 2);
        assert_eq!(notify.index(), 0);
        assert_eq!(sub.index(), 0);
        assert_eq!(pool.allocated(SizeClass::Notify), 1);
        assert_eq!(pool.allocated(SizeClass::Subscription), 1);
        pool.release(notify);
        assert_eq!(pool.allocated(SizeClass::Notify), 0);
        assert_eq!(pool.with(sub, |v| *v), Some(2));
    }

    #[test]
    fn take_and_restore() {
        let pool = CompletionPool::new();
        let handle = pool.allocate(SizeClass::Subscription, String::from("cb"));
        let value = pool.take(handle).unwrap();
        assert!(pool.contains(handle));
        assert_eq!(pool.take(handle), None);
        assert!(pool.restore(handle, value).is_ok());
        assert_eq!(pool.with(handle, |v| v.clone()).as_deref(), Some("cb"));

        // Released while taken: restore gives the value back
        let value = pool.take(handle).unwrap();
        assert_eq!(pool.release(handle), None);
        assert_eq!(pool.restore(handle, value), Err(String::from("cb")));
    }
}
