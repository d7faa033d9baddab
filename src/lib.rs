//! jscluster: a multi-agent JavaScript host built on V8.
//!
//! Each agent is an isolate on its own thread. Work reaches it as closures
//! scheduled through an [`Agent`], and engine objects cross threads only as
//! remote handles.

pub mod runtime;

pub use runtime::{
    Agent, BehaviorParams, ClockConfig, Cluster, ClusterConfig, Error, ErrorKind, JsValue, Lock,
    Module, Pending, Realm, RealmScope, Result, Script, ScriptError, SharedRemote, SourceOrigin,
    UniqueRemote,
};
