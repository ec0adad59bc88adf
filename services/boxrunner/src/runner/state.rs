//! Control states of a runner.

use std::fmt;

/// Control state of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Process start.
    Init,
    /// Find or create the session, check the runtime.
    Discover,
    /// Try to take the lock.
    Compete,
    /// Pull, create and start the container.
    Start,
    /// Watch lock and container until one of them changes.
    Running,
    /// Wait for the lock to be freed by its holder.
    Sleep,
    /// Lock lost while the container runs.
    Stop,
    /// Give the lock back.
    Release,
    /// Remove the container.
    Remove,
    /// Back off, then rediscover.
    Failed,
}

impl State {
    /// Every state, in protocol order.
    pub const ALL: [State; 10] = [
        State::Init,
        State::Discover,
        State::Compete,
        State::Start,
        State::Running,
        State::Sleep,
        State::Stop,
        State::Release,
        State::Remove,
        State::Failed,
    ];

    /// Upper-case name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Init => "INIT",
            State::Discover => "DISCOVER",
            State::Compete => "COMPETE",
            State::Start => "START",
            State::Running => "RUNNING",
            State::Sleep => "SLEEP",
            State::Stop => "STOP",
            State::Release => "RELEASE",
            State::Remove => "REMOVE",
            State::Failed => "FAILED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
