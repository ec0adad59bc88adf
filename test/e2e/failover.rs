//! End-to-end failover tests.
//!
//! Two runners compete for the same service through a shared in-memory
//! coordination store, each with its own mock container runtime standing in
//! for the Docker daemon on its host. The tests validate:
//!
//! 1. Exactly one runner holds the lock and runs the container
//! 2. A dead holder is replaced once its session is invalidated
//! 3. A holder that loses its session stops its container and rejoins
//! 4. A container that exits hands the lock on without overlap
//!
//! ## Running
//!
//! ```bash
//! cargo test -p boxrunner-e2e --test failover
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use boxrunner::coordination::{CoordinationClient, MemoryStore};
use boxrunner::runtime::{ContainerRuntime, MockRuntime};
use boxrunner::{Runner, RunnerIdentity, RunnerSettings};
use tokio::task::JoinHandle;
use tracing::info;

const SERVICE: &str = "web";
const TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "boxrunner=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn settings() -> RunnerSettings {
    RunnerSettings {
        lock_delay: Duration::from_millis(50),
        sleep_interval: Duration::from_millis(20),
        backoff_floor: Duration::from_millis(20),
        backoff_ceiling: Duration::from_millis(200),
        ..RunnerSettings::default()
    }
}

/// One simulated host: a runner task plus the runtime it drives.
struct Host {
    runner_id: String,
    runtime: Arc<MockRuntime>,
    task: JoinHandle<()>,
}

impl Host {
    fn spawn(store: &Arc<MemoryStore>, runtime: MockRuntime, port: u16) -> Self {
        Self::spawn_with(store, runtime, port, settings())
    }

    fn spawn_with(
        store: &Arc<MemoryStore>,
        runtime: MockRuntime,
        port: u16,
        settings: RunnerSettings,
    ) -> Self {
        let runtime = Arc::new(runtime);
        let identity = RunnerIdentity::new(SERVICE, "e2e", port);
        let runner_id = identity.runner_id.to_string();

        let mut runner = Runner::new(
            identity,
            settings,
            Arc::clone(store) as Arc<dyn CoordinationClient>,
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        );
        let task = tokio::spawn(async move {
            let Err(e) = runner.run().await;
            panic!("runner stopped: {e}");
        });

        Self {
            runner_id,
            runtime,
            task,
        }
    }

    fn is_running(&self) -> bool {
        self.runtime.is_running(&self.runner_id)
    }
}

async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while !condition() {
        if start.elapsed() > TIMEOUT {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn session_of(store: &MemoryStore, runner_id: &str) -> String {
    store
        .list_sessions()
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.name == runner_id)
        .map(|s| s.id)
        .unwrap_or_else(|| panic!("no session for {runner_id}"))
}

/// Wait for a holder and return (holder, other).
async fn elect<'a>(store: &MemoryStore, a: &'a Host, b: &'a Host) -> (&'a Host, &'a Host) {
    eventually("a lock holder", || store.holder(SERVICE).is_some()).await;
    let holder = store.holder(SERVICE).unwrap_or_default();
    if holder == a.runner_id {
        (a, b)
    } else {
        assert_eq!(holder, b.runner_id);
        (b, a)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_holder_runs_container() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let a = Host::spawn(&store, MockRuntime::new(), 8080);
    let b = Host::spawn(&store, MockRuntime::new(), 8081);

    let (holder, standby) = elect(&store, &a, &b).await;
    eventually("the holder's container", || holder.is_running()).await;
    info!(holder = %holder.runner_id, "Holder elected");

    // The standby keeps waiting and never starts anything.
    eventually("the standby's session", || store.session_count() == 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!standby.is_running());
    assert_eq!(standby.runtime.container_count(), 0);
    assert_eq!(store.holder(SERVICE).as_deref(), Some(holder.runner_id.as_str()));

    a.task.abort();
    b.task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dead_holder_is_replaced() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let a = Host::spawn(&store, MockRuntime::new(), 8080);
    let b = Host::spawn(&store, MockRuntime::new(), 8081);

    let (holder, standby) = elect(&store, &a, &b).await;
    eventually("the holder's container", || holder.is_running()).await;

    // The host dies: its process is gone and its health check fails.
    holder.task.abort();
    let session = session_of(&store, &holder.runner_id).await;
    assert!(store.invalidate_session(&session));
    info!(dead = %holder.runner_id, "Holder killed");

    eventually("the standby to take over", || {
        store.holder(SERVICE).as_deref() == Some(standby.runner_id.as_str())
    })
    .await;
    eventually("the standby's container", || standby.is_running()).await;

    standby.task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_holder_losing_session_stops_and_rejoins() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());

    // A slow backoff keeps the old holder out of the race for the freed lock.
    let slow = RunnerSettings {
        backoff_floor: Duration::from_millis(500),
        ..settings()
    };
    let holder = Host::spawn_with(&store, MockRuntime::new(), 8080, slow);
    eventually("the first holder", || {
        store.holder(SERVICE).as_deref() == Some(holder.runner_id.as_str())
    })
    .await;
    eventually("the holder's container", || holder.is_running()).await;
    let standby = Host::spawn(&store, MockRuntime::new(), 8081);
    eventually("the standby's session", || store.session_count() == 2).await;

    // Only the session dies; the runner process stays up.
    let session = session_of(&store, &holder.runner_id).await;
    assert!(store.invalidate_session(&session));

    eventually("the old holder to remove its container", || {
        holder.runtime.container_count() == 0
    })
    .await;
    eventually("the standby's container", || standby.is_running()).await;
    assert_eq!(store.holder(SERVICE).as_deref(), Some(standby.runner_id.as_str()));

    // The old holder rediscovers with a fresh session and waits its turn.
    eventually("the old holder's new session", || store.session_count() == 2).await;
    assert_ne!(session_of(&store, &holder.runner_id).await, session);
    assert!(!holder.is_running());

    holder.task.abort();
    standby.task.abort();
}

// Single-threaded so both runtimes are inspected without a runner step in
// between.
#[tokio::test]
async fn test_exiting_workload_hands_over_without_overlap() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let workload = || MockRuntime::new().with_run_duration(Duration::from_millis(100), 0);
    let a = Host::spawn(&store, workload(), 8080);
    let b = Host::spawn(&store, workload(), 8081);

    let mut holders = BTreeSet::new();
    let start = tokio::time::Instant::now();
    while start.elapsed() < Duration::from_secs(2) {
        assert!(
            !(a.is_running() && b.is_running()),
            "both containers running at once"
        );
        if let Some(holder) = store.holder(SERVICE) {
            holders.insert(holder);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(!holders.is_empty());
    assert!(holders.iter().all(|h| *h == a.runner_id || *h == b.runner_id));
    assert_eq!(store.session_count(), 2);

    a.task.abort();
    b.task.abort();
}
