//! Client side of the Tidepool remoting engine: command batching/merging,
//! the thread-safe outgoing queue and the HTTP long-poll transport with
//! out-of-band interrupt.

pub mod merge;
pub mod queue;
pub mod transport;

pub use merge::{merge_into, MergeOutcome};
pub use queue::{CommandQueue, Completion};
pub use transport::{
    ClientConfig, ClientError, ConnectionState, DirectExecutor, ErrorHandler, RemotingClient,
    UiExecutor,
};
