//! The store engine: lifecycle, directory ownership and connection factory.

use crate::config::StoreConfig;
use crate::connection::NativeStoreConnection;
use crate::dictionary::ValueDictionary;
use crate::dirlock::DirectoryLock;
use crate::error::{Result, StoreError};
use crate::index::Record;
use crate::lock::{LockCoordinator, LockInfo};
use crate::namespaces::NamespaceStore;
use crate::term::{Statement, NULL_ID};
use crate::triple_store::TripleStore;
use log::{debug, error, info};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Summary of what a commit changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreChange {
    pub statements_added: bool,
    pub statements_removed: bool,
}

/// Observer notified after every commit that changed the store.
pub trait StoreListener: Send + Sync {
    fn store_changed(&self, change: &StoreChange);
}

type Listeners = Arc<Mutex<Vec<Arc<dyn StoreListener>>>>;

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub spec: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub values: usize,
    pub statements: usize,
    pub contexts: usize,
    pub namespaces: usize,
    pub indexes: Vec<IndexStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub values: usize,
    pub records: usize,
}

/// Substores shared by every connection of an initialized store.
pub(crate) struct Engine {
    pub(crate) dict: Arc<ValueDictionary>,
    pub(crate) triples: Arc<TripleStore>,
    pub(crate) namespaces: NamespaceStore,
    pub(crate) locks: LockCoordinator,
    listeners: Listeners,
    running: AtomicBool,
}

impl Engine {
    fn open(dir: &Path, config: &StoreConfig, listeners: Listeners) -> Result<Self> {
        let specs = config.index_specs()?;
        let namespaces = NamespaceStore::open(dir)?;
        let dict = ValueDictionary::open(
            dir,
            config.sync_mode(),
            config.value_cache_size,
            config.value_id_cache_size,
        )?;
        let triples = TripleStore::open(dir, &specs, config.sync_mode())?;
        Ok(Self {
            dict: Arc::new(dict),
            triples: Arc::new(triples),
            namespaces,
            locks: LockCoordinator::new(config.track_locks, config.lock_timeout()),
            listeners,
            running: AtomicBool::new(true),
        })
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::IllegalState("store has been shut down".into()))
        }
    }

    /// Decode a record into a statement.
    pub(crate) fn statement(&self, record: &Record) -> Result<Statement> {
        let context = match record.context() {
            NULL_ID => None,
            id => Some(self.dict.resolve(id)?),
        };
        Ok(Statement {
            subject: self.dict.resolve(record.subject())?,
            predicate: self.dict.resolve(record.predicate())?,
            object: self.dict.resolve(record.object())?,
            context,
        })
    }

    pub(crate) fn notify(&self, change: &StoreChange) {
        let listeners = match self.listeners.lock() {
            Ok(l) => l.clone(),
            Err(_) => return,
        };
        for l in listeners {
            l.store_changed(change);
        }
    }

    /// Close substores in reverse open order, reporting the first failure.
    fn close(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let triples = self.triples.close();
        let dict = self.dict.close();
        let namespaces = self.namespaces.close();
        triples.and(dict).and(namespaces)
    }
}

enum StoreState {
    Uninitialized,
    Initialized {
        engine: Arc<Engine>,
        dir_lock: DirectoryLock,
    },
    ShutDown,
}

/// A file-backed RDF quad store.
///
/// Configure it, call [`NativeStore::initialize`], then work through
/// [`NativeStore::connection`]. [`NativeStore::shut_down`] (also run on drop)
/// waits for the open transaction and readers before closing the files.
pub struct NativeStore {
    config: Mutex<StoreConfig>,
    state: Mutex<StoreState>,
    listeners: Listeners,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::IllegalState("store state lock poisoned".into())
}

/// Files and directories that an initialization attempt may leave behind.
struct CreatedPaths {
    /// Topmost directory created by the attempt.
    root: Option<PathBuf>,
    dir: PathBuf,
    before: HashSet<PathBuf>,
}

impl CreatedPaths {
    fn prepare(dir: &Path) -> Result<Self> {
        if dir.exists() {
            if !dir.is_dir() {
                return Err(StoreError::Configuration(format!(
                    "data directory {} is not a directory",
                    dir.display()
                )));
            }
            let before = fs::read_dir(dir)?
                .map(|e| e.map(|e| e.path()))
                .collect::<std::io::Result<HashSet<_>>>()?;
            return Ok(Self {
                root: None,
                dir: dir.to_path_buf(),
                before,
            });
        }
        let mut root = dir.to_path_buf();
        while let Some(parent) = root.parent() {
            if parent.as_os_str().is_empty() || parent.exists() {
                break;
            }
            root = parent.to_path_buf();
        }
        fs::create_dir_all(dir)?;
        Ok(Self {
            root: Some(root),
            dir: dir.to_path_buf(),
            before: HashSet::new(),
        })
    }

    fn clean_up(&self) {
        let result = match &self.root {
            Some(root) => fs::remove_dir_all(root),
            None => fs::read_dir(&self.dir).and_then(|entries| {
                for entry in entries {
                    let path = entry?.path();
                    if !self.before.contains(&path) {
                        if path.is_dir() {
                            fs::remove_dir_all(&path)?;
                        } else {
                            fs::remove_file(&path)?;
                        }
                    }
                }
                Ok(())
            }),
        };
        if let Err(e) = result {
            error!("Failed to clean up after initialization failure: {e}");
        }
    }
}

impl NativeStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config: Mutex::new(config),
            state: Mutex::new(StoreState::Uninitialized),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Store in `data_dir` with the default configuration.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self::new(StoreConfig::new(data_dir))
    }

    fn state(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(poisoned)
    }

    fn update_config(&self, f: impl FnOnce(&mut StoreConfig) -> Result<()>) -> Result<()> {
        let state = self.state()?;
        if !matches!(*state, StoreState::Uninitialized) {
            return Err(StoreError::Configuration(
                "the store can only be configured before it is initialized".into(),
            ));
        }
        let mut config = self.config.lock().map_err(poisoned)?;
        f(&mut config)
    }

    /// Replace the whole configuration.
    pub fn configure(&self, config: StoreConfig) -> Result<()> {
        config.index_specs()?;
        self.update_config(|c| {
            *c = config;
            Ok(())
        })
    }

    pub fn set_data_dir(&self, dir: impl Into<PathBuf>) -> Result<()> {
        let dir = dir.into();
        self.update_config(|c| {
            c.data_dir = dir;
            Ok(())
        })
    }

    pub fn set_triple_indexes(&self, indexes: &str) -> Result<()> {
        crate::index::IndexSpec::parse_list(indexes)?;
        self.update_config(|c| {
            c.triple_indexes = indexes.to_string();
            Ok(())
        })
    }

    pub fn set_track_locks(&self, track: bool) -> Result<()> {
        self.update_config(|c| {
            c.track_locks = track;
            Ok(())
        })
    }

    pub fn set_force_sync(&self, force: bool) -> Result<()> {
        self.update_config(|c| {
            c.force_sync = force;
            Ok(())
        })
    }

    pub fn set_lock_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.update_config(|c| {
            c.lock_timeout_ms = timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
            Ok(())
        })
    }

    pub fn config(&self) -> Result<StoreConfig> {
        Ok(self.config.lock().map_err(poisoned)?.clone())
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        Ok(self.config()?.data_dir)
    }

    pub fn is_initialized(&self) -> bool {
        self.state()
            .map(|s| matches!(*s, StoreState::Initialized { .. }))
            .unwrap_or(false)
    }

    /// Lock the data directory and open every substore. On failure nothing
    /// created by the attempt is left on disk.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state()?;
        match *state {
            StoreState::Uninitialized => {}
            StoreState::Initialized { .. } => {
                return Err(StoreError::IllegalState("store is already initialized".into()))
            }
            StoreState::ShutDown => {
                return Err(StoreError::IllegalState("store has been shut down".into()))
            }
        }
        let config = self.config()?;
        config.index_specs()?;
        let dir = config.data_dir.clone();
        info!("Initializing native store in {}", dir.display());

        let created = CreatedPaths::prepare(&dir)?;
        let opened = DirectoryLock::acquire(&dir).and_then(|dir_lock| {
            let engine = Engine::open(&dir, &config, Arc::clone(&self.listeners))?;
            Ok((engine, dir_lock))
        });
        match opened {
            Ok((engine, dir_lock)) => {
                *state = StoreState::Initialized {
                    engine: Arc::new(engine),
                    dir_lock,
                };
                info!("Native store initialized");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize native store in {}: {e}", dir.display());
                created.clean_up();
                Err(e)
            }
        }
    }

    /// Open a new connection. Requires an initialized store.
    pub fn connection(&self) -> Result<NativeStoreConnection> {
        match &*self.state()? {
            StoreState::Initialized { engine, .. } => {
                Ok(NativeStoreConnection::new(Arc::clone(engine)))
            }
            StoreState::Uninitialized => Err(StoreError::IllegalState(
                "store has not been initialized".into(),
            )),
            StoreState::ShutDown => Err(StoreError::IllegalState(
                "store has been shut down".into(),
            )),
        }
    }

    fn engine(&self) -> Result<Arc<Engine>> {
        match &*self.state()? {
            StoreState::Initialized { engine, .. } => Ok(Arc::clone(engine)),
            _ => Err(StoreError::IllegalState("store is not initialized".into())),
        }
    }

    /// Wait for the open transaction and active readers, then close every
    /// substore and release the data directory. Safe to call repeatedly.
    pub fn shut_down(&self) -> Result<()> {
        let mut state = self.state()?;
        let (engine, dir_lock) = match std::mem::replace(&mut *state, StoreState::ShutDown) {
            StoreState::Initialized { engine, dir_lock } => (engine, dir_lock),
            StoreState::Uninitialized => {
                *state = StoreState::Uninitialized;
                return Ok(());
            }
            StoreState::ShutDown => return Ok(()),
        };
        let locks = engine
            .locks
            .transaction_lock()
            .and_then(|txn| Ok((txn, engine.locks.write_lock()?)));
        let (txn, write) = match locks {
            Ok(locks) => locks,
            Err(e) => {
                *state = StoreState::Initialized { engine, dir_lock };
                return Err(e);
            }
        };
        let result = engine.close();
        drop(write);
        drop(txn);
        drop(dir_lock);
        match &result {
            Ok(()) => info!("Native store shut down"),
            Err(e) => error!("Error while shutting down native store: {e}"),
        }
        result
    }

    pub fn add_store_listener(&self, listener: Arc<dyn StoreListener>) {
        if let Ok(mut l) = self.listeners.lock() {
            l.push(listener);
        }
    }

    pub fn remove_store_listener(&self, listener: &Arc<dyn StoreListener>) {
        if let Ok(mut l) = self.listeners.lock() {
            l.retain(|x| !Arc::ptr_eq(x, listener));
        }
    }

    /// Locks currently held; empty unless lock tracking is enabled.
    pub fn active_locks(&self) -> Result<Vec<LockInfo>> {
        Ok(self.engine()?.locks.active_locks())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let engine = self.engine()?;
        let _lock = engine.locks.read_lock()?;
        let indexes: Vec<IndexStats> = engine
            .triples
            .index_stats()?
            .into_iter()
            .map(|(spec, records)| IndexStats {
                spec: spec.to_string(),
                records,
            })
            .collect();
        Ok(StoreStats {
            values: engine.dict.len()?,
            statements: engine.triples.size(None, false)?,
            contexts: engine.triples.context_ids()?.len(),
            namespaces: engine.namespaces.list()?.len(),
            indexes,
        })
    }

    /// Check that every value decodes, every index holds the same records
    /// and every record references registered values.
    pub fn verify(&self) -> Result<VerifyReport> {
        let engine = self.engine()?;
        let _lock = engine.locks.read_lock()?;
        let values = engine.dict.verify()?;
        let records = engine.triples.verify()?;
        for record in engine.triples.scan([None; 4], false)? {
            let record = record?;
            if let Some(id) = record.quad.iter().find(|id| **id as usize > values) {
                return Err(StoreError::corrupt(format!(
                    "record {:?} references unregistered value {id}",
                    record.quad
                )));
            }
            if record.quad[..3].contains(&NULL_ID) {
                return Err(StoreError::corrupt(format!(
                    "record {:?} has an empty component",
                    record.quad
                )));
            }
        }
        debug!("Verified {values} values and {records} records");
        Ok(VerifyReport { values, records })
    }
}

impl Drop for NativeStore {
    fn drop(&mut self) {
        if let Err(e) = self.shut_down() {
            error!("Failed to shut down native store on drop: {e}");
        }
    }
}
