use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::cluster::runtime::ClusterRuntime;
use crate::cluster::StoreError;

const OP_PUT: u8 = 0;
const OP_REMOVE: u8 = 1;

/// The on-disk key-length field is a u16.
const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Encodes map values for replication and the on-disk log. Injected so the
/// value format can change without touching the map itself.
pub trait Codec<V>: Send + Sync {
    fn encode(&self, value: &V) -> Result<Vec<u8>, StoreError>;
    fn decode(&self, bytes: &[u8]) -> Result<V, StoreError>;
}

/// Stock serde_json codec.
pub struct JsonCodec;

impl<V: Serialize + DeserializeOwned> Codec<V> for JsonCodec {
    fn encode(&self, value: &V) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<V, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One durable copy of the record stream. The primary and each backup keep
/// their own log; a write is acknowledged only once every replica has it.
pub trait ReplicaLog: Send {
    fn append(&mut self, record: &[u8]) -> Result<(), StoreError>;
}

struct FileLog {
    file: File,
}

impl FileLog {
    fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(StoreError::Replica)?;
        Ok(Self { file })
    }
}

impl ReplicaLog for FileLog {
    fn append(&mut self, record: &[u8]) -> Result<(), StoreError> {
        self.file.write_all(record).map_err(StoreError::Replica)?;
        self.file.flush().map_err(StoreError::Replica)?;
        Ok(())
    }
}

/// Fixed per-map policy knobs.
#[derive(Debug, Clone)]
pub struct StorePolicy {
    /// Attempt budget for a replicated write.
    pub max_retries: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
    /// Backup replicas kept in addition to the primary.
    pub backups: u32,
    /// Whether entries survive a process restart.
    pub persistent: bool,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            backups: 2,
            persistent: true,
        }
    }
}

/// Named, persistent, replicated string-keyed map. Values go through the
/// injected codec; mutations are appended to every replica log before the
/// in-memory view changes, and transiently failing appends are retried per
/// the policy. Writers serialize on the replica lock; readers only touch the
/// entries lock and never wait out a retry.
pub struct ReplicatedMap<V> {
    name: String,
    policy: StorePolicy,
    codec: Box<dyn Codec<V>>,
    entries: RwLock<HashMap<String, Vec<u8>>>,
    replicas: Mutex<Vec<Box<dyn ReplicaLog>>>,
}

pub struct MapBuilder<'rt, V> {
    runtime: &'rt ClusterRuntime,
    name: String,
    policy: StorePolicy,
    codec: Option<Box<dyn Codec<V>>>,
}

impl ClusterRuntime {
    /// Builder for a named replicated map living under this runtime's
    /// metadata directory.
    pub fn map_builder<V>(&self, name: &str) -> MapBuilder<'_, V> {
        MapBuilder {
            runtime: self,
            name: name.to_string(),
            policy: StorePolicy::default(),
            codec: None,
        }
    }
}

impl<'rt, V> MapBuilder<'rt, V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn with_persistence(mut self, persistent: bool) -> Self {
        self.policy.persistent = persistent;
        self
    }

    pub fn with_codec(mut self, codec: impl Codec<V> + 'static) -> Self {
        self.codec = Some(Box::new(codec));
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.policy.retry_delay = delay;
        self
    }

    pub fn with_max_retries(mut self, attempts: u32) -> Self {
        self.policy.max_retries = attempts;
        self
    }

    pub fn with_backups(mut self, backups: u32) -> Self {
        self.policy.backups = backups;
        self
    }

    pub fn build(self) -> Result<ReplicatedMap<V>, StoreError> {
        if !self.runtime.is_started() {
            return Err(StoreError::RuntimeNotStarted);
        }
        let codec = self.codec.unwrap_or_else(|| Box::new(JsonCodec));
        let store_dir = self.runtime.metadata_dir().join("store");
        ReplicatedMap::attach(self.name, self.policy, codec, &store_dir)
    }
}

impl<V> ReplicatedMap<V> {
    /// Opens (or creates) the replica logs and replays the primary into the
    /// in-memory view. A memory-only map skips disk entirely.
    fn attach(
        name: String,
        policy: StorePolicy,
        codec: Box<dyn Codec<V>>,
        store_dir: &Path,
    ) -> Result<Self, StoreError> {
        let mut entries = HashMap::new();
        let mut replicas: Vec<Box<dyn ReplicaLog>> = Vec::new();

        if policy.persistent {
            fs::create_dir_all(store_dir)?;
            let primary = store_dir.join(format!("{name}.log"));
            entries = replay(&primary)?;
            replicas.push(Box::new(FileLog::open(&primary)?));
            for i in 1..=policy.backups {
                let path = store_dir.join(format!("{name}.backup{i}.log"));
                replicas.push(Box::new(FileLog::open(&path)?));
            }
            debug!(
                "map {:?} attached with {} entries, {} replicas",
                name,
                entries.len(),
                replicas.len()
            );
        }

        Ok(Self {
            name,
            policy,
            codec,
            entries: RwLock::new(entries),
            replicas: Mutex::new(replicas),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        self.read_entries()?
            .get(key)
            .map(|bytes| self.codec.decode(bytes))
            .transpose()
    }

    pub fn put(&self, key: &str, value: &V) -> Result<(), StoreError> {
        let bytes = self.codec.encode(value)?;
        let record = encode_record(OP_PUT, key, &bytes)?;
        // held across the insert so log order matches map order
        let mut replicas = self.lock_replicas()?;
        self.replicate(&mut replicas, &record)?;
        self.write_entries()?.insert(key.to_string(), bytes);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<Option<V>, StoreError> {
        let mut replicas = self.lock_replicas()?;
        if !self.read_entries()?.contains_key(key) {
            return Ok(None);
        }
        let record = encode_record(OP_REMOVE, key, &[])?;
        self.replicate(&mut replicas, &record)?;
        self.write_entries()?
            .remove(key)
            .map(|bytes| self.codec.decode(&bytes))
            .transpose()
    }

    pub fn contains_key(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.read_entries()?.contains_key(key))
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.read_entries()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.read_entries()?.is_empty())
    }

    fn read_entries(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Vec<u8>>>, StoreError> {
        self.entries.read().map_err(|_| StoreError::LockPoisoned)
    }

    fn write_entries(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Vec<u8>>>, StoreError> {
        self.entries.write().map_err(|_| StoreError::LockPoisoned)
    }

    fn lock_replicas(&self) -> Result<MutexGuard<'_, Vec<Box<dyn ReplicaLog>>>, StoreError> {
        self.replicas.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Appends the record to every replica, retrying transient failures with
    /// the configured delay. The replica lock stays held between attempts so
    /// concurrent writers cannot interleave records; a retried write may
    /// leave duplicate records on replicas that already took it, which is
    /// harmless because replay is idempotent.
    fn replicate(
        &self,
        replicas: &mut [Box<dyn ReplicaLog>],
        record: &[u8],
    ) -> Result<(), StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match append_all(replicas, record) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    warn!(
                        "map {:?} write attempt {} failed, retrying: {}",
                        self.name, attempt, e
                    );
                    std::thread::sleep(self.policy.retry_delay);
                }
                Err(e) if e.is_transient() => {
                    return Err(StoreError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<V> fmt::Debug for ReplicatedMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entries.read() {
            Ok(entries) => write!(
                f,
                "ReplicatedMap(name={}, entries={}, backups={})",
                self.name,
                entries.len(),
                self.policy.backups
            ),
            Err(_) => write!(f, "ReplicatedMap(name={}, poisoned)", self.name),
        }
    }
}

fn append_all(replicas: &mut [Box<dyn ReplicaLog>], record: &[u8]) -> Result<(), StoreError> {
    for log in replicas.iter_mut() {
        log.append(record)?;
    }
    Ok(())
}

/// Record layout: u32 payload length, payload, u64 xxh3 of the payload.
/// Payload: op byte, u16 key length, key bytes, value bytes.
fn encode_record(op: u8, key: &str, value: &[u8]) -> Result<Vec<u8>, StoreError> {
    let key_bytes = key.as_bytes();
    if key_bytes.len() > MAX_KEY_LEN {
        return Err(StoreError::KeyTooLarge {
            len: key_bytes.len(),
            max: MAX_KEY_LEN,
        });
    }
    let mut payload = Vec::with_capacity(3 + key_bytes.len() + value.len());
    payload.push(op);
    payload.extend_from_slice(&(key_bytes.len() as u16).to_be_bytes());
    payload.extend_from_slice(key_bytes);
    payload.extend_from_slice(value);

    let mut record = Vec::with_capacity(4 + payload.len() + 8);
    record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    record.extend_from_slice(&payload);
    record.extend_from_slice(&xxh3_64(&payload).to_be_bytes());
    Ok(record)
}

/// Replays the primary log in order. A torn tail from a crash mid-write is
/// dropped with a warning rather than failing the attach.
fn replay(path: &Path) -> Result<HashMap<String, Vec<u8>>, StoreError> {
    let mut entries = HashMap::new();
    if !path.exists() {
        return Ok(entries);
    }

    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).is_err() {
            warn!("truncated record in {:?}, dropping tail", path);
            break;
        }
        let mut sum_buf = [0u8; 8];
        if reader.read_exact(&mut sum_buf).is_err() {
            warn!("record without checksum in {:?}, dropping tail", path);
            break;
        }
        if u64::from_be_bytes(sum_buf) != xxh3_64(&payload) {
            warn!("checksum mismatch in {:?}, dropping tail", path);
            break;
        }

        let (op, key, value) = parse_payload(path, &payload)?;
        match op {
            OP_PUT => {
                entries.insert(key, value.to_vec());
            }
            OP_REMOVE => {
                entries.remove(&key);
            }
            other => {
                return Err(StoreError::Corrupt {
                    path: path.to_path_buf(),
                    reason: format!("unknown op {other}"),
                });
            }
        }
    }
    Ok(entries)
}

fn parse_payload<'a>(path: &Path, payload: &'a [u8]) -> Result<(u8, String, &'a [u8]), StoreError> {
    let corrupt = |reason: &str| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if payload.len() < 3 {
        return Err(corrupt("payload shorter than header"));
    }
    let op = payload[0];
    let key_len = u16::from_be_bytes([payload[1], payload[2]]) as usize;
    if payload.len() < 3 + key_len {
        return Err(corrupt("key extends past payload"));
    }
    let key = std::str::from_utf8(&payload[3..3 + key_len])
        .map_err(|_| corrupt("key is not valid UTF-8"))?
        .to_string();
    Ok((op, key, &payload[3 + key_len..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    /// Fails the first `failures` appends with a transient error, then
    /// succeeds, counting every attempt.
    struct FlakyLog {
        failures: u32,
        attempts: Arc<AtomicU32>,
    }

    impl ReplicaLog for FlakyLog {
        fn append(&mut self, _record: &[u8]) -> Result<(), StoreError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures {
                Err(StoreError::Replica(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "replica unavailable",
                )))
            } else {
                Ok(())
            }
        }
    }

    fn test_map(
        failures: u32,
        attempts: Arc<AtomicU32>,
        retry_delay: Duration,
    ) -> ReplicatedMap<String> {
        let policy = StorePolicy {
            retry_delay,
            persistent: false,
            ..StorePolicy::default()
        };
        ReplicatedMap {
            name: "test".to_string(),
            policy,
            codec: Box::new(JsonCodec),
            entries: RwLock::new(HashMap::new()),
            replicas: Mutex::new(vec![Box::new(FlakyLog { failures, attempts })]),
        }
    }

    #[test]
    fn transient_failures_within_budget_are_invisible() {
        let attempts = Arc::new(AtomicU32::new(0));
        let map = test_map(2, attempts.clone(), Duration::from_millis(5));

        map.put("k", &"v".to_string()).unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(map.get("k").unwrap(), Some("v".to_string()));
    }

    #[test]
    fn exhausted_retries_surface_after_the_last_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let map = test_map(3, attempts.clone(), Duration::from_millis(5));

        let err = map.put("k", &"v".to_string()).unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(
            matches!(err, StoreError::RetriesExhausted { attempts: 3, .. }),
            "got: {err:?}"
        );
        assert_eq!(map.get("k").unwrap(), None);
    }

    #[test]
    fn oversized_key_is_rejected_before_any_replica_write() {
        let attempts = Arc::new(AtomicU32::new(0));
        let map = test_map(0, attempts.clone(), Duration::from_millis(5));
        let key = "k".repeat(70_000);

        let err = map.put(&key, &"v".to_string()).unwrap_err();

        assert!(
            matches!(err, StoreError::KeyTooLarge { len: 70_000, .. }),
            "got: {err:?}"
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert!(map.is_empty().unwrap());
    }

    #[test]
    fn reads_do_not_wait_on_a_retrying_write() {
        let attempts = Arc::new(AtomicU32::new(0));
        let map = Arc::new(test_map(2, attempts, Duration::from_millis(300)));

        let writer_map = map.clone();
        let writer = thread::spawn(move || writer_map.put("k", &"v".to_string()));

        // let the writer get into its first retry pause
        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        assert_eq!(map.get("other").unwrap(), None);
        assert!(
            start.elapsed() < Duration::from_millis(200),
            "read stalled behind a retrying write for {:?}",
            start.elapsed()
        );

        writer.join().unwrap().unwrap();
        assert_eq!(map.get("k").unwrap(), Some("v".to_string()));
    }

    #[test]
    fn replay_rebuilds_puts_and_removes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.log");
        let mut log = FileLog::open(&path).unwrap();
        log.append(&encode_record(OP_PUT, "a", b"\"1\"").unwrap())
            .unwrap();
        log.append(&encode_record(OP_PUT, "b", b"\"2\"").unwrap())
            .unwrap();
        log.append(&encode_record(OP_REMOVE, "a", &[]).unwrap())
            .unwrap();
        log.append(&encode_record(OP_PUT, "b", b"\"3\"").unwrap())
            .unwrap();

        let entries = replay(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["b"], b"\"3\"".to_vec());
    }

    #[test]
    fn replay_drops_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.log");
        let mut log = FileLog::open(&path).unwrap();
        log.append(&encode_record(OP_PUT, "a", b"\"1\"").unwrap())
            .unwrap();
        let mut torn = encode_record(OP_PUT, "b", b"\"2\"").unwrap();
        torn.truncate(torn.len() - 10);
        log.append(&torn).unwrap();

        let entries = replay(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("a"));
    }

    #[test]
    fn remove_of_absent_key_writes_nothing() {
        let attempts = Arc::new(AtomicU32::new(0));
        let map = test_map(0, attempts.clone(), Duration::from_millis(5));

        assert!(map.remove("ghost").unwrap().is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }
}
