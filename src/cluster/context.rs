use std::fmt;
use std::path::Path;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tracing::info;

use crate::cluster::runtime::{ClusterRuntime, NodeRole};
use crate::cluster::store::{JsonCodec, ReplicatedMap};
use crate::cluster::store_info::StoreInfo;
use crate::cluster::BootstrapError;
use crate::config::{properties, ClusterTopology};

/// Name of the replicated placement map, shared with the store servers.
pub const STORE_INFO_MAP: &str = "store-info";

/// Fully assembled gateway cluster state: the parsed topology, the live
/// runtime and the attached placement map. Write-once, then immutable for
/// the process lifetime.
pub struct ClusterContext {
    topology: ClusterTopology,
    runtime: ClusterRuntime,
    store: ReplicatedMap<StoreInfo>,
}

static CONTEXT: OnceLock<ClusterContext> = OnceLock::new();
static INIT_LOCK: Mutex<()> = Mutex::new(());

impl ClusterContext {
    /// Runs the full load → parse → classify → start → attach pipeline.
    pub fn bootstrap<P: AsRef<Path>>(config_path: P) -> Result<Self, BootstrapError> {
        let props = properties::load(config_path)?;
        let topology = ClusterTopology::from_properties(&props)?;
        Self::bootstrap_from(topology)
    }

    /// Bootstraps from an already-parsed topology.
    pub fn bootstrap_from(topology: ClusterTopology) -> Result<Self, BootstrapError> {
        let local = topology.local_node()?.clone();
        let metadata_dir = topology.metadata_path();
        info!(
            "bootstrapping cluster as {} with {} seed nodes, metadata in {:?}",
            local.id,
            topology.bootstrap_nodes().len(),
            metadata_dir
        );

        let mut runtime = ClusterRuntime::builder()
            .with_local_node(&local, NodeRole::Data)
            .with_bootstrap_nodes(topology.bootstrap_nodes())
            .with_metadata_dir(metadata_dir)
            .build()?;
        runtime.start()?;

        let store = runtime
            .map_builder::<StoreInfo>(STORE_INFO_MAP)
            .with_persistence(true)
            .with_codec(JsonCodec)
            .with_retry_delay(Duration::from_secs(1))
            .with_max_retries(3)
            .with_backups(2)
            .build()?;

        Ok(Self {
            topology,
            runtime,
            store,
        })
    }

    /// Process-wide context. The first caller pays for the whole pipeline;
    /// everyone racing it blocks and then observes the same completed
    /// context. A failed bootstrap is returned to the triggering caller and
    /// leaves the cell empty.
    pub fn get_or_init<P: AsRef<Path>>(
        config_path: P,
    ) -> Result<&'static ClusterContext, BootstrapError> {
        get_or_try_init(&CONTEXT, &INIT_LOCK, || Self::bootstrap(config_path))
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn runtime(&self) -> &ClusterRuntime {
        &self.runtime
    }

    pub fn store(&self) -> &ReplicatedMap<StoreInfo> {
        &self.store
    }
}

impl fmt::Debug for ClusterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClusterContext(local={}, nodes={}, store={})",
            self.topology.local,
            self.topology.nodes.len(),
            self.store.name()
        )
    }
}

/// Double-checked one-shot init over an `OnceLock`: check, lock, check
/// again, initialize. `init` runs at most once no matter how many threads
/// race the first call.
fn get_or_try_init<'a, T, E>(
    cell: &'a OnceLock<T>,
    lock: &Mutex<()>,
    init: impl FnOnce() -> Result<T, E>,
) -> Result<&'a T, E> {
    if let Some(value) = cell.get() {
        return Ok(value);
    }
    // the guard only serializes init; the () it protects carries no state,
    // so a poisoned lock from an earlier panic is safe to re-enter
    let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(value) = cell.get() {
        return Ok(value);
    }
    let value = init()?;
    Ok(cell.get_or_init(|| value))
}

#[cfg(test)]
mod tests {
    use super::get_or_try_init;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Mutex, OnceLock};
    use std::thread;

    #[test]
    fn concurrent_first_callers_run_init_once() {
        static CELL: OnceLock<u32> = OnceLock::new();
        static LOCK: Mutex<()> = Mutex::new(());
        static RUNS: AtomicU32 = AtomicU32::new(0);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                thread::spawn(|| {
                    get_or_try_init(&CELL, &LOCK, || {
                        RUNS.fetch_add(1, Ordering::SeqCst);
                        // widen the race window
                        thread::sleep(std::time::Duration::from_millis(20));
                        Ok::<_, ()>(42)
                    })
                    .map(|v| *v)
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(42));
        }
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_init_leaves_the_cell_empty_for_a_later_attempt() {
        static CELL: OnceLock<u32> = OnceLock::new();
        static LOCK: Mutex<()> = Mutex::new(());

        let first: Result<&u32, &str> = get_or_try_init(&CELL, &LOCK, || Err("boom"));
        assert_eq!(first.unwrap_err(), "boom");
        assert!(CELL.get().is_none());

        let second: Result<&u32, &str> = get_or_try_init(&CELL, &LOCK, || Ok(7));
        assert_eq!(second.unwrap(), &7);
    }
}
