//! Runner control loop.
//!
//! A runner competes with its peers for the lock named after the service.
//! The holder runs the workload container; everybody else waits for the lock
//! to be freed. Every step is a handler on [`Runner`] that returns the next
//! [`State`], and [`Runner::state_machine`] wires them into a
//! [`Machine`].
//!
//! ```text
//! INIT -> DISCOVER -> COMPETE -+-> START -> RUNNING -+-> STOP -> RELEASE -> REMOVE -> COMPETE
//!                              |                     +-> RELEASE (container exited)
//!                              +-> SLEEP -> COMPETE
//! any failure -> FAILED -> (backoff) -> DISCOVER
//! ```

mod race;
mod state;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use boxrunner_statemachine::{Machine, MachineError};
use futures_util::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, DEFAULT_CEILING, DEFAULT_FLOOR};
use crate::coordination::{CoordinationClient, CoordinationError, SERF_HEALTH_CHECK};
use crate::identity::RunnerIdentity;
use crate::runtime::{ContainerRuntime, RuntimeError};

pub use race::{race, Watcher};
pub use state::State;

/// Tunables for one runner.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Workload image.
    pub image: String,

    /// Workload command.
    pub command: Vec<String>,

    /// URL the health check polls.
    pub liveness_url: String,

    /// Health check poll interval.
    pub check_interval: Duration,

    /// Lock delay of the session.
    pub lock_delay: Duration,

    /// Pause in SLEEP before watching the lock.
    pub sleep_interval: Duration,

    /// First backoff wait.
    pub backoff_floor: Duration,

    /// Largest backoff wait.
    pub backoff_ceiling: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            image: "busybox".to_string(),
            command: vec!["/bin/sleep".to_string(), "10".to_string()],
            liveness_url: "http://localhost:8080/health".to_string(),
            check_interval: Duration::from_secs(5),
            lock_delay: Duration::from_secs(5),
            sleep_interval: Duration::from_secs(3),
            backoff_floor: DEFAULT_FLOOR,
            backoff_ceiling: DEFAULT_CEILING,
        }
    }
}

/// The lock a runner competes for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    /// Lock key: the service name.
    pub key: String,

    /// Value written on acquisition: the runner id.
    pub value: String,

    /// Session used to acquire the lock, once discovered.
    pub session: Option<String>,
}

/// Result of the RUNNING race.
#[derive(Debug)]
enum WatchOutcome {
    /// The lock is no longer held by this runner's session.
    LockLost,
    LockWatchFailed(CoordinationError),
    ContainerExited(i64),
    ContainerWaitFailed(RuntimeError),
}

/// One runner process.
pub struct Runner {
    identity: RunnerIdentity,
    settings: RunnerSettings,
    store: Arc<dyn CoordinationClient>,
    runtime: Arc<dyn ContainerRuntime>,
    lock: Lock,
    /// Created on the first failure.
    backoff: Option<Backoff>,
}

impl Runner {
    /// Create a runner in its initial state.
    pub fn new(
        identity: RunnerIdentity,
        settings: RunnerSettings,
        store: Arc<dyn CoordinationClient>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let lock = Lock {
            key: identity.service.clone(),
            value: identity.runner_id.to_string(),
            session: None,
        };

        Self {
            identity,
            settings,
            store,
            runtime,
            lock,
            backoff: None,
        }
    }

    /// Get the runner identity.
    pub fn identity(&self) -> &RunnerIdentity {
        &self.identity
    }

    /// Get the runner settings.
    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Get the lock descriptor.
    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    /// Session id, once DISCOVER has run.
    pub fn session_id(&self) -> Option<&str> {
        self.lock.session.as_deref()
    }

    /// Backoff state, once a failure has happened.
    pub fn backoff(&self) -> Option<&Backoff> {
        self.backoff.as_ref()
    }

    /// Build the state machine driving a runner.
    pub fn state_machine() -> Machine<Runner, State> {
        let mut machine: Machine<Runner, State> = Machine::new(State::Init);
        machine
            .register(State::Init, |r| Box::pin(r.init()))
            .register(State::Discover, |r| Box::pin(r.discover()))
            .register(State::Compete, |r| Box::pin(r.compete()))
            .register(State::Start, |r| Box::pin(r.start()))
            .register(State::Running, |r| Box::pin(r.running()))
            .register(State::Sleep, |r| Box::pin(r.sleep()))
            .register(State::Stop, |r| Box::pin(r.stop()))
            .register(State::Release, |r| Box::pin(r.release()))
            .register(State::Remove, |r| Box::pin(r.remove()))
            .register(State::Failed, |r| Box::pin(r.failed()));
        machine
    }

    /// Drive this runner until dispatch fails.
    pub async fn run(&mut self) -> Result<Infallible, MachineError> {
        Self::state_machine().run(self).await
    }

    /// INIT: nothing to set up yet.
    pub async fn init(&mut self) -> State {
        info!(
            service = %self.identity.service,
            runner_id = %self.identity.runner_id,
            "Runner starting"
        );
        State::Discover
    }

    /// DISCOVER: make sure a session exists and the runtime answers.
    pub async fn discover(&mut self) -> State {
        let session = match self.find_or_create_session().await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Could not set up session");
                return State::Failed;
            }
        };
        self.lock.session = Some(session);

        if let Err(e) = self.runtime.ping().await {
            error!(error = %e, "Container runtime is not reachable");
            return State::Failed;
        }

        State::Compete
    }

    async fn find_or_create_session(&self) -> Result<String, CoordinationError> {
        let runner_id = self.identity.runner_id.as_str();

        let sessions = self.store.list_sessions().await?;
        if let Some(existing) = sessions.into_iter().find(|s| s.name == runner_id) {
            info!(session = %existing.id, "Reusing existing session");
            return Ok(existing.id);
        }

        let checks = self.store.list_health_checks().await?;
        if checks.iter().any(|c| c.id == runner_id) {
            debug!(check_id = runner_id, "Health check already registered");
        } else {
            self.store
                .register_health_check(
                    runner_id,
                    &self.settings.liveness_url,
                    self.settings.check_interval,
                )
                .await?;
            info!(
                check_id = runner_id,
                url = %self.settings.liveness_url,
                "Health check registered"
            );
        }

        let checks = [SERF_HEALTH_CHECK.to_string(), runner_id.to_string()];
        let session = self
            .store
            .create_session(runner_id, &checks, self.settings.lock_delay)
            .await?;
        info!(session = %session, "Session created");
        Ok(session)
    }

    /// COMPETE: try to take the lock once.
    pub async fn compete(&mut self) -> State {
        let Some(session) = self.lock.session.clone() else {
            error!("No session to compete with");
            return State::Failed;
        };

        debug!(key = %self.lock.key, "Trying to acquire lock");
        match self
            .store
            .kv_acquire(&self.lock.key, self.lock.value.as_bytes(), &session)
            .await
        {
            Ok(true) => {
                info!(key = %self.lock.key, "Lock acquired");
                State::Start
            }
            Ok(false) => {
                self.log_contention().await;
                State::Sleep
            }
            Err(e) => {
                error!(error = %e, "Could not acquire lock");
                State::Failed
            }
        }
    }

    async fn log_contention(&self) {
        match self.store.kv_get(&self.lock.key, None).await {
            Ok(Some(pair)) if pair.session.is_some() => {
                info!(holder = %pair.value_str(), "Lock is held by another runner");
            }
            Ok(_) => info!("Lock is free but still inside its lock delay"),
            Err(e) => warn!(error = %e, "Could not read lock holder"),
        }
    }

    /// START: pull, create and start the workload container.
    ///
    /// A container left over under this runner's name, from an earlier
    /// RUNNING that ended in FAILED or from a crashed process, is removed
    /// before the new one is created.
    pub async fn start(&mut self) -> State {
        let image = self.settings.image.as_str();
        let name = self.identity.container_name();

        if let Err(e) = self.runtime.pull_image(image).await {
            error!(error = %e, image, "Could not pull image");
            return State::Failed;
        }
        debug!(image, "Image pulled");

        if let Err(e) = self.runtime.remove_container(name).await {
            error!(error = %e, container = name, "Could not clear leftover container");
            return State::Failed;
        }

        let container_id = match self
            .runtime
            .create_container(name, image, &self.settings.command)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, container = name, "Could not create container");
                return State::Failed;
            }
        };

        if let Err(e) = self.runtime.start_container(&container_id).await {
            error!(error = %e, container = name, "Could not start container");
            return State::Failed;
        }

        info!(container = name, container_id = %container_id, image, "Container started");
        State::Running
    }

    /// RUNNING: wait until the lock is lost or the container exits.
    pub async fn running(&mut self) -> State {
        let Some(session) = self.lock.session.clone() else {
            error!("No session to watch the lock with");
            return State::Failed;
        };

        let store = Arc::clone(&self.store);
        let key = self.lock.key.clone();
        let lock_watch: BoxFuture<'static, WatchOutcome> = Box::pin(async move {
            let lost = |holder: Option<&str>| holder != Some(session.as_str());
            match wait_for_lock_change(store.as_ref(), &key, lost).await {
                Ok(()) => WatchOutcome::LockLost,
                Err(e) => WatchOutcome::LockWatchFailed(e),
            }
        });

        let runtime = Arc::clone(&self.runtime);
        let container = self.identity.container_name().to_string();
        let container_watch: BoxFuture<'static, WatchOutcome> = Box::pin(async move {
            match runtime.wait_container(&container).await {
                Ok(code) => WatchOutcome::ContainerExited(code),
                Err(e) => WatchOutcome::ContainerWaitFailed(e),
            }
        });

        let outcome = race(vec![
            Watcher::new("lock", lock_watch),
            Watcher::new("container", container_watch),
        ])
        .await;

        match outcome {
            Some(WatchOutcome::LockLost) => {
                warn!(key = %self.lock.key, "Lock lost");
                State::Stop
            }
            Some(WatchOutcome::ContainerExited(code)) => {
                if code != 0 {
                    warn!(exit_code = code, "Container exited with error");
                } else {
                    info!(exit_code = code, "Container exited");
                }
                State::Release
            }
            Some(WatchOutcome::LockWatchFailed(e)) => {
                error!(error = %e, "Lock watch failed");
                State::Failed
            }
            Some(WatchOutcome::ContainerWaitFailed(e)) => {
                error!(error = %e, "Container wait failed");
                State::Failed
            }
            None => {
                error!("Watchers ended without an outcome");
                State::Failed
            }
        }
    }

    /// SLEEP: pause, then wait until nobody holds the lock.
    pub async fn sleep(&mut self) -> State {
        tokio::time::sleep(self.settings.sleep_interval).await;

        let free = |holder: Option<&str>| holder.is_none();
        match wait_for_lock_change(self.store.as_ref(), &self.lock.key, free).await {
            Ok(()) => {
                debug!(key = %self.lock.key, "Lock is free");
                State::Compete
            }
            Err(e) => {
                error!(error = %e, "Could not watch lock");
                State::Failed
            }
        }
    }

    /// STOP: the container keeps running until REMOVE.
    pub async fn stop(&mut self) -> State {
        info!(container = self.identity.container_name(), "Stopping workload");
        State::Release
    }

    /// RELEASE: give the lock back.
    pub async fn release(&mut self) -> State {
        let Some(session) = self.lock.session.clone() else {
            error!("No session to release the lock with");
            return State::Failed;
        };

        match self.store.kv_release(&self.lock.key, &session).await {
            Ok(true) => {
                info!(key = %self.lock.key, "Lock released");
                State::Remove
            }
            Ok(false) => {
                debug!(key = %self.lock.key, "Lock was not held by this session");
                State::Remove
            }
            Err(e) => {
                error!(error = %e, "Could not release lock");
                State::Failed
            }
        }
    }

    /// REMOVE: force-remove the container.
    pub async fn remove(&mut self) -> State {
        let name = self.identity.container_name();
        match self.runtime.remove_container(name).await {
            Ok(()) => {
                info!(container = name, "Container removed");
                State::Compete
            }
            Err(e) => {
                error!(error = %e, container = name, "Could not remove container");
                State::Failed
            }
        }
    }

    /// FAILED: wait out the backoff, then rediscover.
    pub async fn failed(&mut self) -> State {
        let (floor, ceiling) = (self.settings.backoff_floor, self.settings.backoff_ceiling);
        let backoff = self
            .backoff
            .get_or_insert_with(|| Backoff::new(floor, ceiling));

        let wait = backoff.record_failure(Instant::now());
        warn!(
            wait_ms = wait.as_millis() as u64,
            next_wait_ms = backoff.current().as_millis() as u64,
            "Backing off before rediscovery"
        );
        tokio::time::sleep(wait).await;
        State::Discover
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("identity", &self.identity)
            .field("lock", &self.lock)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// Long-poll `key` until it is absent or `done` holds for its session.
async fn wait_for_lock_change<F>(
    store: &dyn CoordinationClient,
    key: &str,
    done: F,
) -> Result<(), CoordinationError>
where
    F: Fn(Option<&str>) -> bool,
{
    let mut index = None;
    loop {
        match store.kv_get(key, index).await? {
            None => return Ok(()),
            Some(pair) if done(pair.session.as_deref()) => return Ok(()),
            Some(pair) => {
                debug!(key, modify_index = pair.modify_index, "Lock unchanged, watching");
                index = Some(pair.modify_index);
            }
        }
    }
}
