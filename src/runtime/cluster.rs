//! Entry point: a cluster owns the platform reference and the scheduler that
//! runs every agent thread.
//!
//! Dropping a cluster stops all of its agents and waits for their threads to
//! finish tearing down. The platform reference is released after that.

use crate::runtime::agent::Agent;
use crate::runtime::config::{BehaviorParams, ClusterConfig};
use crate::runtime::dispatch::{self, Pending};
use crate::runtime::error::Result;
use crate::runtime::host::Host;
use crate::runtime::lock::Lock;
use crate::runtime::platform::PlatformHandle;
use crate::runtime::scheduler::Scheduler;
use tracing::debug;

pub struct Cluster {
    // Field order matters: hosts must be gone before the platform is released.
    scheduler: Scheduler,
    platform: PlatformHandle,
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_config(&ClusterConfig::default())
    }

    pub fn with_config(config: &ClusterConfig) -> Self {
        let platform = PlatformHandle::acquire_with(config);
        debug!(generation = platform.generation(), "cluster created");
        Self {
            scheduler: Scheduler::new(),
            platform,
        }
    }

    /// Start a new agent on its own thread.
    ///
    /// `setup` runs on the agent thread under the first lock, before any
    /// scheduled task. The returned future resolves to the agent once setup
    /// has finished; it fails with [`Error::Abandoned`](crate::runtime::Error::Abandoned)
    /// if the agent thread died before that.
    pub fn make_agent<F>(&self, params: BehaviorParams, setup: F) -> Result<Pending<Agent>>
    where
        F: FnOnce(&mut Lock<'_>, Agent) + Send + 'static,
    {
        params.validate()?;
        let handle = self.scheduler.handle()?;
        let id = handle.id();
        let (dispatch, pending) = dispatch::channel();

        self.scheduler
            .run(&handle, format!("jscluster-agent-{id}"), move |stop| {
                Host::run(id, params, stop, move |lock| {
                    let agent = lock.agent();
                    setup(lock, agent.clone());
                    dispatch.dispatch(agent);
                });
            })?;

        debug!(agent = id, "agent spawned");
        Ok(pending)
    }

    pub fn platform(&self) -> &PlatformHandle {
        &self.platform
    }

    /// Number of agent threads that have not finished tearing down.
    pub fn agent_count(&self) -> usize {
        self.scheduler.registered()
    }
}
