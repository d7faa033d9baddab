//! Proof of execution context on a host thread.
//!
//! A [`Lock`] is only ever created by the host itself: by its run loop around
//! each task, during setup, during teardown, or by nesting an existing lock.
//! Holding one means the current thread is the host's thread and the isolate
//! may be used.
//!
//! Each lock pushes its host's [`HostEnv`] onto a thread-local stack and pops
//! it on drop, so engine callbacks that receive no host pointer can still
//! reach host state with [`with_current`].

use crate::runtime::agent::Agent;
use crate::runtime::host::{Host, HostEnv};
use crate::runtime::remote::RemoteHandleList;
use deno_core::v8;
use std::cell::RefCell;
use std::rc::Rc;
use std::thread::{self, ThreadId};
use std::time::Instant;

thread_local! {
    static CURRENT: RefCell<Vec<Rc<HostEnv>>> = const { RefCell::new(Vec::new()) };
}

/// Host state of the innermost lock held on this thread, if any.
pub fn try_current() -> Option<Rc<HostEnv>> {
    CURRENT.with(|current| current.borrow().last().cloned())
}

/// Whether any lock is held on this thread.
pub fn is_held() -> bool {
    CURRENT.with(|current| !current.borrow().is_empty())
}

/// Run `f` with the host state of the innermost lock held on this thread.
///
/// # Panics
///
/// If no lock is held. Only engine callbacks invoked under a lock may use this.
pub fn with_current<R>(f: impl FnOnce(&HostEnv) -> R) -> R {
    let env = try_current().unwrap_or_else(|| panic!("no host lock is held on this thread"));
    f(&env)
}

pub struct Lock<'h> {
    host: &'h mut Host,
    depth: usize,
}

impl<'h> Lock<'h> {
    pub(crate) fn enter(host: &'h mut Host) -> Self {
        debug_assert_eq!(
            thread::current().id(),
            host.env.thread_id(),
            "lock entered off the host thread"
        );
        CURRENT.with(|current| current.borrow_mut().push(host.env.clone()));
        Self { host, depth: 0 }
    }

    /// Enter a nested lock on the same host. The outer lock is unusable until
    /// the nested one drops.
    pub fn nested(&mut self) -> Lock<'_> {
        CURRENT.with(|current| current.borrow_mut().push(self.host.env.clone()));
        Lock {
            host: &mut *self.host,
            depth: self.depth + 1,
        }
    }

    /// Nesting level: 0 for a task's own lock.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn host_id(&self) -> u64 {
        self.host.env.id()
    }

    pub fn thread_id(&self) -> ThreadId {
        self.host.env.thread_id()
    }

    pub fn isolate(&mut self) -> &mut v8::Isolate {
        &mut self.host.isolate
    }

    /// A new agent handle for this host.
    pub fn agent(&self) -> Agent {
        self.host.agent()
    }

    pub fn clock_time_ms(&self) -> i64 {
        self.host.env.clock_time_ms()
    }

    pub fn take_random_seed(&self) -> Option<f64> {
        self.host.env.take_random_seed()
    }

    pub fn remote_handles(&self) -> &RemoteHandleList {
        self.host.shared.remotes()
    }

    pub fn perform_microtask_checkpoint(&mut self) {
        self.host.isolate.perform_microtask_checkpoint();
    }

    /// Drop a termination request that arrived while no script was running,
    /// so it cannot hit an unrelated script. A host over its heap limit stays
    /// terminated.
    pub(crate) fn cancel_pending_termination(&mut self) {
        let shared = &self.host.shared;
        if !shared.memory_exceeded() {
            shared.isolate_handle().cancel_terminate_execution();
        }
    }

    /// Run queued nestable tasks inside this lock until none are runnable.
    /// Returns how many ran.
    pub fn run_nestable_tasks(&mut self) -> usize {
        let shared = self.host.shared.clone();
        let mut ran = 0;
        while let Some(task) = shared.runner().pop_nestable(Instant::now()) {
            let mut nested = self.nested();
            nested.begin_tick();
            task(&mut nested);
            ran += 1;
        }
        ran
    }

    pub(crate) fn env(&self) -> &Rc<HostEnv> {
        &self.host.env
    }

    pub(crate) fn begin_tick(&self) {
        self.host.env.begin_tick();
    }

    /// Run `f` inside the host's scratch context, created on first use.
    /// Context-independent work (compiling scripts and modules) happens here.
    pub(crate) fn with_scratch_scope<R>(
        &mut self,
        f: impl for<'s> FnOnce(&mut v8::HandleScope<'s>) -> R,
    ) -> R {
        let host = &mut *self.host;
        let scope = &mut v8::HandleScope::new(&mut host.isolate);
        let context = match &host.scratch_context {
            Some(context) => v8::Local::new(scope, context),
            None => {
                let context = v8::Context::new(scope, Default::default());
                host.scratch_context = Some(v8::Global::new(scope, context));
                context
            }
        };
        let scope = &mut v8::ContextScope::new(scope, context);
        f(scope)
    }
}

impl Drop for Lock<'_> {
    fn drop(&mut self) {
        let popped = CURRENT.with(|current| current.borrow_mut().pop());
        debug_assert!(
            popped.is_some_and(|env| Rc::ptr_eq(&env, &self.host.env)),
            "lock stack unwound out of order"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_lock_outside_host() {
        assert!(!is_held());
        assert!(try_current().is_none());
    }

    #[test]
    #[should_panic(expected = "no host lock is held")]
    fn test_with_current_requires_lock() {
        with_current(|env| env.id());
    }
}
