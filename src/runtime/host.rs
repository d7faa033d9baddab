//! Agent host: one isolate, its thread and everything that must die with it.
//!
//! A host is split in two. [`HostShared`] is reachable from any thread (task
//! runner, remote-handle registry, stop source, lifecycle state) and is what
//! agents and remote handles point at weakly. [`Host`] stays on the host
//! thread and owns the isolate; it is only reachable through a [`Lock`].
//!
//! Teardown order: state goes to draining, agents are severed, the runner is
//! closed and its abandoned tasks dropped, every remote handle is reset under a
//! lock, and finally the isolate is destroyed.

use crate::runtime::agent::Agent;
use crate::runtime::clock::Clock;
use crate::runtime::config::BehaviorParams;
use crate::runtime::lock::Lock;
use crate::runtime::remote::RemoteHandleList;
use crate::runtime::task_queue::ForegroundRunner;
use crate::runtime::timers::TimerTable;
use deno_core::v8;
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

// Extra heap granted once the limit is hit, so the terminated script can unwind.
const HEAP_LIMIT_HEADROOM: usize = 256 * 1024 * 1024;

/// Work item executed on the host thread with the lock held.
pub type HostTask = Box<dyn FnOnce(&mut Lock<'_>) + Send>;

/// Host lifecycle as observed from other threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HostState {
    Uninitialized = 0,
    Running = 1,
    Draining = 2,
    Destroyed = 3,
}

impl HostState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HostState::Uninitialized,
            1 => HostState::Running,
            2 => HostState::Draining,
            _ => HostState::Destroyed,
        }
    }
}

/// Detach switch shared by every agent of one host.
#[derive(Default)]
pub(crate) struct Severable {
    severed: AtomicBool,
}

impl Severable {
    pub(crate) fn sever(&self) {
        self.severed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_severed(&self) -> bool {
        self.severed.load(Ordering::SeqCst)
    }
}

/// Thread-safe half of a host.
pub struct HostShared {
    id: u64,
    thread_id: ThreadId,
    runner: ForegroundRunner<HostTask>,
    remotes: RemoteHandleList,
    stop: CancellationToken,
    isolate_handle: v8::IsolateHandle,
    severable: Arc<Severable>,
    state: AtomicU8,
    memory_exceeded: AtomicBool,
}

impl HostShared {
    fn new(id: u64, stop: CancellationToken, isolate_handle: v8::IsolateHandle) -> Self {
        Self {
            id,
            thread_id: thread::current().id(),
            runner: ForegroundRunner::new(),
            remotes: RemoteHandleList::new(),
            stop,
            isolate_handle,
            severable: Arc::new(Severable::default()),
            state: AtomicU8::new(HostState::Uninitialized as u8),
            memory_exceeded: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn state(&self) -> HostState {
        HostState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: HostState) {
        self.state.store(state as u8, Ordering::SeqCst);
        trace!(host = self.id, ?state, "host state changed");
    }

    pub(crate) fn runner(&self) -> &ForegroundRunner<HostTask> {
        &self.runner
    }

    pub(crate) fn remotes(&self) -> &RemoteHandleList {
        &self.remotes
    }

    pub(crate) fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub(crate) fn isolate_handle(&self) -> &v8::IsolateHandle {
        &self.isolate_handle
    }

    pub(crate) fn severable(&self) -> &Arc<Severable> {
        &self.severable
    }

    /// Whether the isolate ran into its heap limit. Such a host stops taking
    /// tasks and tears down.
    pub fn memory_exceeded(&self) -> bool {
        self.memory_exceeded.load(Ordering::SeqCst)
    }

    fn mark_memory_exceeded(&self) {
        self.memory_exceeded.store(true, Ordering::SeqCst);
    }
}

extern "C" fn near_heap_limit(
    data: *mut c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points at the host's `HostShared`. The isolate slot holds
    // a strong reference to it, so it outlives every callback of the isolate.
    let shared = unsafe { &*(data as *const HostShared) };
    shared.mark_memory_exceeded();
    shared.isolate_handle().terminate_execution();
    current_heap_limit.saturating_add(HEAP_LIMIT_HEADROOM)
}

/// Host state reachable from engine callbacks through the current lock.
pub struct HostEnv {
    id: u64,
    thread_id: ThreadId,
    clock: RefCell<Clock>,
    random_seed: Cell<Option<f64>>,
    timers: RefCell<TimerTable>,
}

impl HostEnv {
    fn new(id: u64, params: &BehaviorParams) -> Self {
        Self {
            id,
            thread_id: thread::current().id(),
            clock: RefCell::new(Clock::from_config(&params.clock)),
            random_seed: Cell::new(params.random_seed),
            timers: RefCell::new(TimerTable::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn clock_time_ms(&self) -> i64 {
        self.clock.borrow_mut().clock_time_ms()
    }

    /// Returns the configured seed the first time only.
    pub fn take_random_seed(&self) -> Option<f64> {
        self.random_seed.take()
    }

    /// Hand back a seed whose realm failed to bootstrap.
    pub(crate) fn restore_random_seed(&self, seed: f64) {
        self.random_seed.set(Some(seed));
    }

    pub(crate) fn begin_tick(&self) {
        self.clock.borrow_mut().begin_tick();
    }

    pub(crate) fn timers(&self) -> &RefCell<TimerTable> {
        &self.timers
    }
}

/// Thread-owned half of a host. Field order matters: the isolate drops last.
pub(crate) struct Host {
    pub(crate) shared: Arc<HostShared>,
    pub(crate) env: Rc<HostEnv>,
    pub(crate) scratch_context: Option<v8::Global<v8::Context>>,
    pub(crate) isolate: v8::OwnedIsolate,
}

impl Host {
    fn new(id: u64, params: &BehaviorParams, stop: CancellationToken) -> Self {
        let mut create_params = v8::CreateParams::default();
        if let Some(max) = params.max_heap_size {
            create_params = create_params.heap_limits(params.initial_heap_size.unwrap_or(0), max);
        }

        let mut isolate = v8::Isolate::new(create_params);
        isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);

        let shared = Arc::new(HostShared::new(id, stop, isolate.thread_safe_handle()));
        isolate.set_slot(shared.clone());
        if params.max_heap_size.is_some() {
            let data = Arc::as_ptr(&shared) as *mut c_void;
            isolate.add_near_heap_limit_callback(near_heap_limit, data);
        }

        Self {
            shared,
            env: Rc::new(HostEnv::new(id, params)),
            scratch_context: None,
            isolate,
        }
    }

    /// Body of a host thread: build the host, run `setup` under a lock, then
    /// process tasks until `stop` is cancelled.
    pub(crate) fn run<F>(id: u64, params: BehaviorParams, stop: CancellationToken, setup: F)
    where
        F: FnOnce(&mut Lock<'_>),
    {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(host = id, %err, "failed to build host event loop");
                return;
            }
        };

        let mut host = Host::new(id, &params, stop);
        let shared = host.shared.clone();
        shared.set_state(HostState::Running);
        debug!(host = id, "host started");

        {
            let mut lock = Lock::enter(&mut host);
            lock.cancel_pending_termination();
            setup(&mut lock);
            lock.perform_microtask_checkpoint();
        }

        runtime.block_on(host.run_loop());

        drop(host);
        shared.set_state(HostState::Destroyed);
        debug!(host = id, "host destroyed");
    }

    async fn run_loop(&mut self) {
        let shared = self.shared.clone();
        while !shared.memory_exceeded() {
            let Some(task) = shared.runner().next(shared.stop_token()).await else {
                break;
            };
            let mut lock = Lock::enter(self);
            lock.cancel_pending_termination();
            task(&mut lock);
            lock.perform_microtask_checkpoint();
        }
        if shared.memory_exceeded() {
            warn!(host = shared.id(), "heap limit reached, disposing host");
        }
    }

    pub(crate) fn agent(&self) -> Agent {
        Agent::new(&self.shared)
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        let shared = self.shared.clone();
        shared.set_state(HostState::Draining);
        shared.severable().sever();
        shared.stop_token().cancel();

        let abandoned = shared.runner().close();
        if !abandoned.is_empty() {
            debug!(host = shared.id(), count = abandoned.len(), "dropping unrun tasks");
        }
        drop(abandoned);

        {
            let lock = Lock::enter(self);
            let released = lock.remote_handles().reset_all(&lock);
            debug!(host = shared.id(), released, "remote handles reset");
        }

        self.scratch_context = None;
    }
}
