//! In-memory container runtime for tests and development.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{ContainerRuntime, RuntimeError};

#[derive(Debug)]
struct MockContainer {
    id: String,
    image: String,
    running: bool,
    exit: watch::Sender<Option<i64>>,
}

#[derive(Debug, Default)]
struct MockState {
    unavailable: bool,
    images: BTreeSet<String>,
    /// Keyed by container name.
    containers: HashMap<String, MockContainer>,
}

impl MockState {
    fn ensure_available(&self) -> Result<(), RuntimeError> {
        if self.unavailable {
            return Err(RuntimeError::Unavailable(
                "mock runtime configured to fail".to_string(),
            ));
        }
        Ok(())
    }

    fn find_mut(&mut self, id_or_name: &str) -> Option<&mut MockContainer> {
        if self.containers.contains_key(id_or_name) {
            return self.containers.get_mut(id_or_name);
        }
        self.containers.values_mut().find(|c| c.id == id_or_name)
    }

    fn name_of(&self, id_or_name: &str) -> Option<String> {
        if self.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.containers
            .iter()
            .find(|(_, c)| c.id == id_or_name)
            .map(|(name, _)| name.clone())
    }
}

fn no_such_container(id: &str) -> RuntimeError {
    RuntimeError::Api {
        status: 404,
        message: format!("No such container: {id}"),
    }
}

/// Mock runtime that tracks containers in memory.
///
/// Containers run until [`MockRuntime::exit_container`] is called, or for a
/// fixed duration when built with [`MockRuntime::with_run_duration`].
#[derive(Debug, Default)]
pub struct MockRuntime {
    id_counter: AtomicU64,
    state: Arc<Mutex<MockState>>,
    run_for: Option<(Duration, i64)>,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock runtime that fails every call.
    pub fn failing() -> Self {
        let runtime = Self::new();
        runtime.set_unavailable(true);
        runtime
    }

    /// Containers exit with `exit_code` once they have run for `duration`.
    pub fn with_run_duration(mut self, duration: Duration, exit_code: i64) -> Self {
        self.run_for = Some((duration, exit_code));
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Make a running container exit with `exit_code`.
    pub fn exit_container(&self, id_or_name: &str, exit_code: i64) -> bool {
        let mut state = self.lock();
        match state.find_mut(id_or_name) {
            Some(container) if container.running => {
                container.running = false;
                container.exit.send_replace(Some(exit_code));
                true
            }
            _ => false,
        }
    }

    /// Returns true if the container exists and runs.
    pub fn is_running(&self, id_or_name: &str) -> bool {
        self.lock()
            .find_mut(id_or_name)
            .is_some_and(|c| c.running)
    }

    /// Number of containers that exist, running or not.
    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    /// Returns true if `image` has been pulled.
    pub fn has_image(&self, image: &str) -> bool {
        self.lock().images.contains(image)
    }

    fn next_container_id(&self) -> String {
        let counter = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("{:064x}", counter)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.lock().ensure_available()
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.ensure_available()?;
        state.images.insert(image.to_string());
        debug!(image = image, "[MOCK] Image pulled");
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        image: &str,
        _cmd: &[String],
    ) -> Result<String, RuntimeError> {
        let mut state = self.lock();
        state.ensure_available()?;

        if state.containers.contains_key(name) {
            return Err(RuntimeError::Api {
                status: 409,
                message: format!("Conflict. The container name \"/{name}\" is already in use"),
            });
        }

        let id = self.next_container_id();
        let (exit, _) = watch::channel(None);
        state.containers.insert(
            name.to_string(),
            MockContainer {
                id: id.clone(),
                image: image.to_string(),
                running: false,
                exit,
            },
        );
        debug!(name = name, image = image, "[MOCK] Container created");
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.ensure_available()?;

        let container = state.find_mut(id).ok_or_else(|| no_such_container(id))?;
        container.running = true;
        info!(container = id, image = %container.image, "[MOCK] Container started");

        if let Some((duration, exit_code)) = self.run_for {
            let shared = Arc::clone(&self.state);
            let id = container.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(container) = state.find_mut(&id) {
                    if container.running {
                        container.running = false;
                        container.exit.send_replace(Some(exit_code));
                    }
                }
            });
        }
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        let mut exit = {
            let mut state = self.lock();
            state.ensure_available()?;
            let container = state.find_mut(id).ok_or_else(|| no_such_container(id))?;
            container.exit.subscribe()
        };

        let exit_code = *exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| no_such_container(id))?;
        Ok(exit_code.unwrap_or_default())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.ensure_available()?;

        if let Some(name) = state.name_of(id) {
            state.containers.remove(&name);
            debug!(container = id, "[MOCK] Container removed");
        }
        Ok(())
    }
}
