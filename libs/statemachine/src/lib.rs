//! Named-state dispatcher.
//!
//! A [`Machine`] owns a dispatch table mapping each state to an async handler.
//! [`Machine::run`] starts at a fixed initial state, invokes the handler for
//! the current state and moves to whatever state the handler returns, forever.
//!
//! # Invariants
//!
//! - The table is built once and only read while running
//! - Handlers see nothing but the context passed to `run`
//! - A state without a handler is a wiring defect: `run` stops with
//!   [`MachineError::UnknownState`] instead of retrying or panicking
//!
//! The engine itself is sequential. Handlers are free to spawn concurrent
//! work, but only one handler executes at a time.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::hash::Hash;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, error, info};

/// Handler bound to a single state.
///
/// Receives exclusive access to the context for the duration of the call and
/// yields the next state.
pub type Handler<C, S> = Box<dyn for<'a> Fn(&'a mut C) -> BoxFuture<'a, S> + Send + Sync>;

/// Errors that stop the run loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MachineError {
    /// A handler returned a state nothing is registered for.
    #[error("no handler registered for state: {0}")]
    UnknownState(String),
}

impl MachineError {
    /// Name of the state that caused the error.
    pub fn state(&self) -> &str {
        match self {
            MachineError::UnknownState(state) => state,
        }
    }
}

/// State machine over context `C` and state type `S`.
pub struct Machine<C, S> {
    initial: S,
    handlers: HashMap<S, Handler<C, S>>,
}

impl<C, S> Machine<C, S>
where
    S: Clone + Eq + Hash + fmt::Display,
{
    /// Create an empty machine that starts at `initial`.
    pub fn new(initial: S) -> Self {
        Self {
            initial,
            handlers: HashMap::new(),
        }
    }

    /// Bind `handler` to `state`, replacing any previous binding.
    pub fn register<F>(&mut self, state: S, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut C) -> BoxFuture<'a, S> + Send + Sync + 'static,
    {
        debug!(state = %state, "Registering state handler");
        self.handlers.insert(state, Box::new(handler));
        self
    }

    /// Returns true if a handler is bound to `state`.
    pub fn is_registered(&self, state: &S) -> bool {
        self.handlers.contains_key(state)
    }

    /// Number of registered states.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no state is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// The state `run` starts from.
    pub fn initial(&self) -> &S {
        &self.initial
    }

    /// Drive the machine until a handler returns an unregistered state.
    ///
    /// There is no terminal state: the only way out is a dispatch error.
    pub async fn run(&self, ctx: &mut C) -> Result<Infallible, MachineError> {
        let mut state = self.initial.clone();
        info!(state = %state, "State machine starting");

        loop {
            let Some(handler) = self.handlers.get(&state) else {
                error!(state = %state, "No handler registered for state");
                return Err(MachineError::UnknownState(state.to_string()));
            };

            let next = handler(ctx).await;
            info!(from = %state, to = %next, "State transition");
            state = next;
        }
    }
}

impl<C, S: fmt::Debug> fmt::Debug for Machine<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("initial", &self.initial)
            .field("states", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
