//! Thread-safe facade over a host.
//!
//! An [`Agent`] holds only a weak reference to its host plus the host's
//! severable token. Once the host starts tearing down, every operation is a
//! silent no-op: a request against a host that went away is moot, not an
//! error.

use crate::runtime::host::{HostShared, HostState, HostTask, Severable};
use crate::runtime::lock::Lock;
use crate::runtime::task_queue::TaskPriority;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Clone)]
pub struct Agent {
    id: u64,
    host: Weak<HostShared>,
    severable: Arc<Severable>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Agent {
    pub(crate) fn new(shared: &Arc<HostShared>) -> Self {
        Self {
            id: shared.id(),
            host: Arc::downgrade(shared),
            severable: shared.severable().clone(),
        }
    }

    fn host(&self) -> Option<Arc<HostShared>> {
        if self.severable.is_severed() {
            return None;
        }
        self.host.upgrade()
    }

    fn post(&self, task: HostTask) {
        let Some(host) = self.host() else {
            trace!(agent = self.id, "host gone, task dropped");
            return;
        };
        if host.runner().post(TaskPriority::UserVisible, task).is_err() {
            trace!(agent = self.id, "host draining, task dropped");
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run `task` on the host thread with the lock held. Tasks scheduled on the
    /// same agent run in submission order.
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce(&mut Lock<'_>) + Send + 'static,
    {
        self.post(Box::new(move |lock: &mut Lock<'_>| {
            lock.begin_tick();
            task(lock);
        }));
    }

    /// Like [`schedule`](Self::schedule), but `task` also receives the host's
    /// stop token. Cancellation is cooperative.
    pub fn schedule_async<F>(&self, task: F)
    where
        F: FnOnce(&mut Lock<'_>, CancellationToken) + Send + 'static,
    {
        let Some(host) = self.host() else {
            return;
        };
        let stop = host.stop_token().clone();
        drop(host);
        self.post(Box::new(move |lock: &mut Lock<'_>| {
            lock.begin_tick();
            task(lock, stop);
        }));
    }

    /// Run `task` no earlier than `delay` from now.
    pub fn schedule_delayed<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce(&mut Lock<'_>) + Send + 'static,
    {
        let Some(host) = self.host() else {
            return;
        };
        let task: HostTask = Box::new(move |lock: &mut Lock<'_>| {
            lock.begin_tick();
            task(lock);
        });
        if host
            .runner()
            .post_delayed(TaskPriority::UserVisible, delay, task)
            .is_err()
        {
            trace!(agent = self.id, "host draining, delayed task dropped");
        }
    }

    /// Interrupt whatever script the host is running. The interrupted call
    /// reports a `Terminated` error; later tasks run normally. A request that
    /// arrives while no script runs is discarded when the next task starts.
    pub fn terminate(&self) {
        if let Some(host) = self.host() {
            host.isolate_handle().terminate_execution();
        }
    }

    /// Ask the host to stop after its current task.
    pub fn shutdown(&self) {
        if let Some(host) = self.host() {
            host.stop_token().cancel();
        }
    }

    pub fn is_alive(&self) -> bool {
        self.host()
            .is_some_and(|host| host.state() == HostState::Running)
    }

    pub fn state(&self) -> HostState {
        match self.host.upgrade() {
            Some(host) => host.state(),
            None => HostState::Destroyed,
        }
    }
}
