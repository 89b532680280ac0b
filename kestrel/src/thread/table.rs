//! The thread table.
//!
//! Threads live in a fixed-capacity arena and are named by a
//! [`ThreadHandle`]: a slot index plus the generation of the slot at the time
//! the thread was inserted. A handle to a released thread never resolves to
//! the thread that reuses its slot.
use super::Thread;
use crate::KernelError;
use alloc::boxed::Box;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use crossbeam_queue::ArrayQueue;

/// A generational reference to a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadHandle {
    index: u32,
    generation: u32,
}

impl ThreadHandle {
    /// Slot of the thread in the table.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub(crate) const fn into_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

struct Slot {
    generation: AtomicU32,
    thread: AtomicPtr<Thread>,
}

pub(crate) struct ThreadTable {
    slots: Box<[Slot]>,
    free: ArrayQueue<u32>,
}

impl ThreadTable {
    pub(crate) fn new(capacity: usize) -> Self {
        let free = ArrayQueue::new(capacity);
        for index in 0..capacity as u32 {
            let _ = free.push(index);
        }
        Self {
            slots: (0..capacity)
                .map(|_| Slot {
                    generation: AtomicU32::new(0),
                    thread: AtomicPtr::new(core::ptr::null_mut()),
                })
                .collect(),
            free,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live threads.
    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Reserves a slot and fills it with the thread `build` returns.
    ///
    /// Nothing is left behind if either the table is full or `build` fails.
    pub(crate) fn insert(
        &self,
        build: impl FnOnce(ThreadHandle) -> Result<Box<Thread>, KernelError>,
    ) -> Result<ThreadHandle, KernelError> {
        let index = self.free.pop().ok_or(KernelError::NoMemory)?;
        let slot = &self.slots[index as usize];
        let handle = ThreadHandle {
            index,
            generation: slot.generation.load(Ordering::Acquire),
        };
        match build(handle) {
            Ok(thread) => {
                slot.thread.store(Box::into_raw(thread), Ordering::Release);
                Ok(handle)
            }
            Err(e) => {
                let _ = self.free.push(index);
                Err(e)
            }
        }
    }

    /// Resolves `handle`, or returns None if the thread was released.
    pub(crate) fn try_get(&self, handle: ThreadHandle) -> Option<&Thread> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation.load(Ordering::Acquire) != handle.generation {
            return None;
        }
        // Safety: a published thread stays alive until `remove` bumps the
        // generation, which callers holding a live handle rule out.
        unsafe { slot.thread.load(Ordering::Acquire).as_ref() }
    }

    /// Resolves a handle the caller knows to be live.
    #[track_caller]
    pub(crate) fn get(&self, handle: ThreadHandle) -> &Thread {
        match self.try_get(handle) {
            Some(thread) => thread,
            None => panic!("Stale thread handle: {handle:?}"),
        }
    }

    /// Unpublishes the thread of `handle` and frees its slot.
    ///
    /// # Safety
    /// No reference to the thread may outlive this call.
    pub(crate) unsafe fn remove(&self, handle: ThreadHandle) -> Box<Thread> {
        let slot = &self.slots[handle.index as usize];
        let ptr = slot.thread.swap(core::ptr::null_mut(), Ordering::AcqRel);
        assert!(!ptr.is_null(), "Double release of {handle:?}");
        let prev = slot.generation.fetch_add(1, Ordering::AcqRel);
        assert_eq!(prev, handle.generation, "Stale release of {handle:?}");
        let _ = self.free.push(handle.index);
        // Safety: published by `insert` from a `Box`.
        unsafe { Box::from_raw(ptr) }
    }
}

impl Drop for ThreadTable {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let ptr = slot.thread.swap(core::ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ThreadHandle;

    #[test]
    fn handle_packs_into_one_word() {
        let handle = ThreadHandle {
            index: 7,
            generation: 0xdead,
        };
        assert_eq!(ThreadHandle::from_raw(handle.into_raw()), handle);
        assert_ne!(
            handle.into_raw(),
            ThreadHandle {
                index: 7,
                generation: 0xdeae
            }
            .into_raw()
        );
    }
}
