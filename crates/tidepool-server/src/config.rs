use std::time::Duration;

use clap::ValueEnum;

/// What a second concurrent command batch for an already-active session
/// gets: queue behind the first call, or an immediate rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BusyPolicy {
    Wait,
    Reject,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound on how long a `StartLongPoll` call stays parked.
    pub max_poll_time: Duration,
    /// Run the garbage collector every N long-poll cycles; 0 disables it.
    pub gc_every_polls: u64,
    pub busy_policy: BusyPolicy,
    /// Sessions quiet for longer than this are recycled.
    pub session_idle_timeout: Duration,
    pub recycle_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_poll_time: Duration::from_secs(20),
            gc_every_polls: 1,
            busy_policy: BusyPolicy::Wait,
            session_idle_timeout: Duration::from_secs(300),
            recycle_interval: Duration::from_secs(30),
        }
    }
}
