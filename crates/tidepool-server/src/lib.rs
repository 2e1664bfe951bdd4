//! Server side of the Tidepool remoting engine: per-session command
//! dispatch, the parked long-poll task queue and the reachability GC over
//! the server-held presentation-model graph.

pub mod config;
pub mod contract;
pub mod dispatch;
pub mod gc;
pub mod handlers;
pub mod session;
pub mod tasks;
pub mod telemetry;

pub use config::{BusyPolicy, ServerConfig};
pub use contract::{Controller, ControllerError, ControllerFactory, EmptyControllerFactory};
pub use dispatch::{CommandDispatcher, SessionContext};
pub use gc::{CollectionVeto, GarbageCollector, GcStats, Instance, InstanceArena};
pub use handlers::{router, AppState};
pub use session::{
    BatchOutcome, ControllerEntry, ServerSession, SessionError, SessionRegistry, SessionState,
    ERROR_ATTRIBUTE,
};
pub use tasks::{SessionTask, TaskQueue};
