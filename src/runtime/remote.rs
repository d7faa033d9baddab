//! Thread-safe references to values living in a host's engine heap.
//!
//! Every remote handle owns a slot in its host's [`RemoteHandleList`]; the
//! slot holds the engine global. The handle itself is `Send + Sync` and may be
//! dropped anywhere: dropping posts an expiry task back onto the host, which
//! releases the slot under the host's [`Lock`]. If the host is already gone
//! the expiry is skipped, since teardown resets every remaining slot before
//! the isolate is destroyed.

use crate::runtime::host::{HostShared, HostTask};
use crate::runtime::lock::Lock;
use crate::runtime::task_queue::TaskPriority;
use deno_core::v8;
use parking_lot::Mutex;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::trace;

/// Stable address of a slot. The generation rejects keys whose slot was
/// released and reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotKey {
    index: usize,
    generation: u32,
}

struct Slot {
    generation: u32,
    value: Option<Box<dyn Any + Send>>,
}

#[derive(Default)]
struct Slots {
    entries: Vec<Slot>,
    free: Vec<usize>,
    live: usize,
}

/// Slot-index registry of live engine globals for one host.
///
/// Insert and release are O(1). Values are always dropped outside the mutex.
#[derive(Default)]
pub struct RemoteHandleList {
    slots: Mutex<Slots>,
    resets: AtomicUsize,
    #[cfg(test)]
    reset_threads: Mutex<Vec<thread::ThreadId>>,
}

impl RemoteHandleList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total entries released so far, individually or in bulk.
    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    fn insert(&self, value: Box<dyn Any + Send>) -> SlotKey {
        let mut slots = self.slots.lock();
        slots.live += 1;
        if let Some(index) = slots.free.pop() {
            let slot = &mut slots.entries[index];
            slot.value = Some(value);
            return SlotKey {
                index,
                generation: slot.generation,
            };
        }
        slots.entries.push(Slot {
            generation: 0,
            value: Some(value),
        });
        SlotKey {
            index: slots.entries.len() - 1,
            generation: 0,
        }
    }

    fn with_value<R>(&self, key: SlotKey, f: impl FnOnce(&(dyn Any + Send)) -> R) -> Option<R> {
        let slots = self.slots.lock();
        let slot = slots.entries.get(key.index)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_deref().map(f)
    }

    fn take(&self, key: SlotKey) -> Option<Box<dyn Any + Send>> {
        let mut slots = self.slots.lock();
        let slot = slots.entries.get_mut(key.index)?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slots.free.push(key.index);
        slots.live -= 1;
        Some(value)
    }

    fn take_all(&self) -> Vec<Box<dyn Any + Send>> {
        let mut slots = self.slots.lock();
        let mut taken = Vec::with_capacity(slots.live);
        let Slots {
            entries, free, live, ..
        } = &mut *slots;
        for (index, slot) in entries.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                free.push(index);
                taken.push(value);
            }
        }
        *live = 0;
        taken
    }

    /// Release one entry. Stale keys are ignored, so a slot is reset at most
    /// once.
    pub(crate) fn release(&self, _lock: &Lock<'_>, key: SlotKey) -> bool {
        match self.take(key) {
            Some(value) => {
                drop(value);
                self.resets.fetch_add(1, Ordering::SeqCst);
                self.record_reset_thread();
                true
            }
            None => false,
        }
    }

    /// Release every remaining entry. Runs once during host teardown.
    pub(crate) fn reset_all(&self, _lock: &Lock<'_>) -> usize {
        let taken = self.take_all();
        let count = taken.len();
        drop(taken);
        self.resets.fetch_add(count, Ordering::SeqCst);
        if count > 0 {
            self.record_reset_thread();
        }
        count
    }

    #[cfg(test)]
    fn record_reset_thread(&self) {
        self.reset_threads.lock().push(thread::current().id());
    }

    #[cfg(not(test))]
    fn record_reset_thread(&self) {}

    /// Threads on which releases ran, in order.
    #[cfg(test)]
    pub(crate) fn reset_threads(&self) -> Vec<thread::ThreadId> {
        self.reset_threads.lock().clone()
    }
}

/// An engine global stored in a slot.
struct EngineGlobal<T>(v8::Global<T>);

// SAFETY: an `EngineGlobal` is created, dereferenced and dropped only on its
// host's thread while that host's `Lock` is held. Other threads only move the
// boxed value between slot states without touching it.
unsafe impl<T> Send for EngineGlobal<T> {}

/// Base remote handle: a slot key plus a weak reference to the owning host.
pub struct RemoteHandle<T: 'static> {
    key: SlotKey,
    host_id: u64,
    host: Weak<HostShared>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> RemoteHandle<T> {
    /// Wrap `local` in a global owned by the scope's host.
    ///
    /// # Panics
    ///
    /// If the isolate is not owned by a host of this crate.
    pub fn new<'s>(scope: &mut v8::HandleScope<'s, ()>, local: v8::Local<'s, T>) -> Self {
        let host = scope
            .get_slot::<Arc<HostShared>>()
            .cloned()
            .expect("remote handles require an isolate owned by a host");
        debug_assert_eq!(thread::current().id(), host.thread_id());

        let global = v8::Global::new(scope, local);
        let key = host.remotes().insert(Box::new(EngineGlobal(global)));
        Self {
            key,
            host_id: host.id(),
            host: Arc::downgrade(&host),
            _marker: PhantomData,
        }
    }

    /// Id of the host owning the referenced value.
    pub fn host_id(&self) -> u64 {
        self.host_id
    }

    /// Materialize the referenced value in `scope`.
    ///
    /// # Panics
    ///
    /// If `scope` belongs to a different host, or the handle was already reset
    /// by host teardown.
    pub fn deref<'s>(&self, scope: &mut v8::HandleScope<'s, ()>) -> v8::Local<'s, T> {
        let host = scope
            .get_slot::<Arc<HostShared>>()
            .cloned()
            .expect("remote handles require an isolate owned by a host");
        assert_eq!(
            host.id(),
            self.host_id,
            "remote handle dereferenced under a foreign host"
        );
        debug_assert_eq!(thread::current().id(), host.thread_id());

        host.remotes()
            .with_value(self.key, |value| {
                let global = value
                    .downcast_ref::<EngineGlobal<T>>()
                    .expect("remote handle slot holds a different type");
                v8::Local::new(scope, &global.0)
            })
            .expect("remote handle dereferenced after reset")
    }
}

impl<T: 'static> Drop for RemoteHandle<T> {
    fn drop(&mut self) {
        let Some(host) = self.host.upgrade() else {
            return;
        };
        let key = self.key;
        let expiry: HostTask = Box::new(move |lock: &mut Lock<'_>| {
            lock.remote_handles().release(lock, key);
        });
        if host
            .runner()
            .post_non_nestable(TaskPriority::BestEffort, expiry)
            .is_err()
        {
            trace!(host = self.host_id, "host draining, expiry left to teardown");
        }
    }
}

/// Sole owner of a remote value.
pub struct UniqueRemote<T: 'static>(RemoteHandle<T>);

impl<T: 'static> UniqueRemote<T> {
    pub fn new<'s>(scope: &mut v8::HandleScope<'s, ()>, local: v8::Local<'s, T>) -> Self {
        Self(RemoteHandle::new(scope, local))
    }

    pub fn deref<'s>(&self, scope: &mut v8::HandleScope<'s, ()>) -> v8::Local<'s, T> {
        self.0.deref(scope)
    }

    pub fn host_id(&self) -> u64 {
        self.0.host_id()
    }

    pub fn into_shared(self) -> SharedRemote<T> {
        SharedRemote(Arc::new(self.0))
    }
}

/// Reference-counted remote value; the last clone to drop expires it.
pub struct SharedRemote<T: 'static>(Arc<RemoteHandle<T>>);

impl<T: 'static> SharedRemote<T> {
    pub fn new<'s>(scope: &mut v8::HandleScope<'s, ()>, local: v8::Local<'s, T>) -> Self {
        Self(Arc::new(RemoteHandle::new(scope, local)))
    }

    pub fn deref<'s>(&self, scope: &mut v8::HandleScope<'s, ()>) -> v8::Local<'s, T> {
        self.0.deref(scope)
    }

    pub fn host_id(&self) -> u64 {
        self.0.host_id()
    }

    /// Number of live clones.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl<T: 'static> Clone for SharedRemote<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_take() {
        let list = RemoteHandleList::new();
        let key = list.insert(Box::new("value".to_string()));
        assert_eq!(list.len(), 1);

        let seen = list.with_value(key, |value| value.downcast_ref::<String>().cloned());
        assert_eq!(seen.flatten().as_deref(), Some("value"));

        assert!(list.take(key).is_some());
        assert!(list.take(key).is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn test_stale_key_after_reuse() {
        let list = RemoteHandleList::new();
        let first = list.insert(Box::new(1u32));
        assert!(list.take(first).is_some());

        let second = list.insert(Box::new(2u32));
        assert_eq!(first.index, second.index);
        assert_ne!(first.generation, second.generation);

        assert!(list.take(first).is_none());
        assert!(list.with_value(first, |_| ()).is_none());
        assert_eq!(list.len(), 1);
        assert!(list.take(second).is_some());
    }

    #[test]
    fn test_take_all_empties_registry() {
        let list = RemoteHandleList::new();
        let keys: Vec<_> = (0..8u32).map(|i| list.insert(Box::new(i))).collect();
        assert!(list.take(keys[3]).is_some());

        let taken = list.take_all();
        assert_eq!(taken.len(), 7);
        assert!(list.is_empty());
        for key in keys {
            assert!(list.take(key).is_none());
        }
    }

    #[test]
    fn test_values_drop_outside_lock() {
        struct Reentrant(Arc<RemoteHandleList>);
        impl Drop for Reentrant {
            fn drop(&mut self) {
                // Would deadlock if the registry mutex were still held.
                let _ = self.0.len();
            }
        }

        let list = Arc::new(RemoteHandleList::new());
        let key = list.insert(Box::new(Reentrant(list.clone())));
        drop(list.take(key));
        list.insert(Box::new(Reentrant(list.clone())));
        drop(list.take_all());
        assert!(list.is_empty());
    }
}
