//! Thread ownership for hosts.
//!
//! A [`Scheduler`] hands out [`SchedulerHandle`]s, each naming one execution
//! context. [`Scheduler::run`] starts a detached thread for a handle and
//! stores that thread's stop source in the registry. Dropping the scheduler
//! requests stop on every handle and blocks until all of them deregistered.

use crate::runtime::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Default)]
struct Entry {
    stop_source: Option<CancellationToken>,
    thread: Option<ThreadId>,
}

struct RegistryState {
    open: bool,
    next_id: u64,
    handles: HashMap<u64, Entry>,
}

struct Registry {
    state: Mutex<RegistryState>,
    drained: Condvar,
}

struct HandleInner {
    id: u64,
    registry: Arc<Registry>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let mut state = self.registry.state.lock();
        state.handles.remove(&self.id);
        drop(state);
        self.registry.drained.notify_all();
    }
}

/// One registered execution context. Clones share the registration; the
/// context deregisters when the last clone drops.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<HandleInner>,
}

impl SchedulerHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether a thread was started for this handle.
    pub fn is_running(&self) -> bool {
        self.stop_token().is_some()
    }

    pub fn stop_token(&self) -> Option<CancellationToken> {
        let state = self.inner.registry.state.lock();
        state
            .handles
            .get(&self.inner.id)
            .and_then(|entry| entry.stop_source.clone())
    }
}

pub struct Scheduler {
    registry: Arc<Registry>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                state: Mutex::new(RegistryState {
                    open: true,
                    next_id: 1,
                    handles: HashMap::new(),
                }),
                drained: Condvar::new(),
            }),
        }
    }

    /// Register a new execution context.
    pub fn handle(&self) -> Result<SchedulerHandle> {
        let mut state = self.registry.state.lock();
        if !state.open {
            return Err(Error::SchedulerClosed);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.handles.insert(id, Entry::default());
        drop(state);

        Ok(SchedulerHandle {
            inner: Arc::new(HandleInner {
                id,
                registry: self.registry.clone(),
            }),
        })
    }

    /// Number of handles still registered.
    pub fn registered(&self) -> usize {
        self.registry.state.lock().handles.len()
    }

    /// Start a detached thread named `name` running `entry`. The thread keeps
    /// `handle` registered until `entry` returns.
    pub fn run<F>(&self, handle: &SchedulerHandle, name: String, entry: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let stop_source = CancellationToken::new();
        {
            let mut state = self.registry.state.lock();
            if !state.open {
                return Err(Error::SchedulerClosed);
            }
            let entry = state
                .handles
                .get_mut(&handle.id())
                .ok_or(Error::SchedulerClosed)?;
            if entry.stop_source.is_some() {
                return Err(Error::AlreadyRunning);
            }
            entry.stop_source = Some(stop_source.clone());
        }

        let thread_handle = handle.clone();
        let token = stop_source.clone();
        let spawned = thread::Builder::new().name(name).spawn(move || {
            {
                let mut state = thread_handle.inner.registry.state.lock();
                if let Some(entry) = state.handles.get_mut(&thread_handle.inner.id) {
                    entry.thread = Some(thread::current().id());
                }
            }
            entry(token);
            drop(thread_handle);
        });

        if let Err(err) = spawned {
            let mut state = self.registry.state.lock();
            if let Some(entry) = state.handles.get_mut(&handle.id()) {
                entry.stop_source = None;
            }
            return Err(Error::ThreadSpawn(err));
        }

        trace!(handle = handle.id(), "scheduler thread started");
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let current = thread::current().id();
        let mut state = self.registry.state.lock();
        state.open = false;
        for entry in state.handles.values() {
            if let Some(stop_source) = &entry.stop_source {
                stop_source.cancel();
            }
        }
        debug!(handles = state.handles.len(), "scheduler closing");

        // A handle owned by this very thread can never drain while we wait.
        while state
            .handles
            .values()
            .any(|entry| entry.thread != Some(current))
        {
            self.registry.drained.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_run_passes_stop_token() {
        let scheduler = Scheduler::new();
        let handle = scheduler.handle().unwrap();
        let (tx, rx) = mpsc::channel();

        scheduler
            .run(&handle, "test-run".into(), move |stop| {
                tx.send((thread::current().name().map(String::from), stop.is_cancelled()))
                    .unwrap();
            })
            .unwrap();

        let (name, cancelled) = rx.recv().unwrap();
        assert_eq!(name.as_deref(), Some("test-run"));
        assert!(!cancelled);
        assert!(handle.is_running());
    }

    #[test]
    fn test_run_twice_is_rejected() {
        let scheduler = Scheduler::new();
        let handle = scheduler.handle().unwrap();
        scheduler.run(&handle, "first".into(), |_| {}).unwrap();

        let err = scheduler.run(&handle, "second".into(), |_| {}).unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning));
    }

    #[test]
    fn test_drop_cancels_and_waits_for_threads() {
        let finished = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new();

        for i in 0..4 {
            let handle = scheduler.handle().unwrap();
            let finished = finished.clone();
            scheduler
                .run(&handle, format!("worker-{i}"), move |stop| {
                    while !stop.is_cancelled() {
                        thread::sleep(Duration::from_millis(1));
                    }
                    thread::sleep(Duration::from_millis(10));
                    finished.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        drop(scheduler);
        assert_eq!(finished.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_handle_deregisters_on_drop() {
        let scheduler = Scheduler::new();
        let handle = scheduler.handle().unwrap();
        let clone = handle.clone();
        assert_eq!(scheduler.registered(), 1);

        drop(handle);
        assert_eq!(scheduler.registered(), 1);
        drop(clone);
        assert_eq!(scheduler.registered(), 0);
    }

    #[test]
    fn test_drop_from_owned_thread_does_not_deadlock() {
        let scheduler = Arc::new(Mutex::new(Some(Scheduler::new())));
        let handle = scheduler.lock().as_ref().unwrap().handle().unwrap();
        let dropped = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let owner = scheduler.clone();
        let flag = dropped.clone();
        scheduler
            .lock()
            .as_ref()
            .unwrap()
            .run(&handle, "self-owner".into(), move |_| {
                let scheduler = owner.lock().take();
                drop(scheduler);
                flag.store(true, Ordering::SeqCst);
                tx.send(()).unwrap();
            })
            .unwrap();
        drop(handle);

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(dropped.load(Ordering::SeqCst));
    }
}
