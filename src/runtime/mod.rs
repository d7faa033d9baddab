//! Multi-agent JavaScript runtime.
//!
//! A [`Cluster`] spawns agents. Each agent owns one V8 isolate on a dedicated
//! OS thread with a single-threaded Tokio event loop driving its
//! [`ForegroundRunner`](task_queue::ForegroundRunner). Other threads talk to an
//! agent only through its [`Agent`] handle, by scheduling closures that run on
//! the agent thread with a [`Lock`] held.
//!
//! Engine objects never leave their thread as raw handles. They are held as
//! [`RemoteHandle`]s, which may be dropped anywhere: the release is posted back
//! to the owning host, or skipped if the host is already gone.

pub mod agent;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod js_value;
pub mod lock;
pub mod platform;
pub mod realm;
pub mod remote;
pub mod scheduler;
pub mod script;
pub mod task_queue;
pub mod timers;

pub use agent::Agent;
pub use cluster::Cluster;
pub use config::{BehaviorParams, ClockConfig, ClusterConfig};
pub use dispatch::{Dispatch, Pending};
pub use error::{Error, ErrorKind, Result, ScriptError};
pub use host::HostState;
pub use js_value::JsValue;
pub use lock::Lock;
pub use platform::{is_v8_initialized, Platform, PlatformHandle};
pub use realm::{Realm, RealmScope};
pub use remote::{RemoteHandle, SharedRemote, UniqueRemote};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use script::{Module, Script, SourceLocation, SourceOrigin};
pub use task_queue::TaskPriority;
