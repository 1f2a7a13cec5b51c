//! Prefix to namespace-IRI mappings, persisted as `namespaces.json`.

use crate::error::{Result, StoreError};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const NAMESPACES_FILE: &str = "namespaces.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Namespace {
    pub prefix: String,
    pub name: String,
}

#[derive(Default)]
struct State {
    map: BTreeMap<String, String>,
    dirty: bool,
}

pub struct NamespaceStore {
    path: PathBuf,
    state: RwLock<State>,
}

impl NamespaceStore {
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(NAMESPACES_FILE);
        let map = if path.exists() {
            let text = fs::read_to_string(&path)?;
            serde_json::from_str(&text)?
        } else {
            BTreeMap::new()
        };
        let store = Self {
            path,
            state: RwLock::new(State { map, dirty: false }),
        };
        if !store.path.exists() {
            store.save(&BTreeMap::new())?;
        }
        Ok(store)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| StoreError::IllegalState("namespace store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| StoreError::IllegalState("namespace store lock poisoned".into()))
    }

    pub fn get(&self, prefix: &str) -> Result<Option<String>> {
        Ok(self.read()?.map.get(prefix).cloned())
    }

    /// Every mapping, ordered by prefix.
    pub fn list(&self) -> Result<Vec<Namespace>> {
        Ok(self
            .read()?
            .map
            .iter()
            .map(|(prefix, name)| Namespace {
                prefix: prefix.clone(),
                name: name.clone(),
            })
            .collect())
    }

    pub fn set(&self, prefix: &str, name: &str) -> Result<()> {
        let mut state = self.write()?;
        if state.map.get(prefix).map(String::as_str) != Some(name) {
            state.map.insert(prefix.to_string(), name.to_string());
            state.dirty = true;
        }
        Ok(())
    }

    pub fn remove(&self, prefix: &str) -> Result<()> {
        let mut state = self.write()?;
        if state.map.remove(prefix).is_some() {
            state.dirty = true;
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        let mut state = self.write()?;
        if !state.map.is_empty() {
            state.map.clear();
            state.dirty = true;
        }
        Ok(())
    }

    /// Persist pending changes.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.write()?;
        if state.dirty {
            self.save(&state.map)?;
            state.dirty = false;
            debug!("Saved {} namespaces", state.map.len());
        }
        Ok(())
    }

    fn save(&self, map: &BTreeMap<String, String>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(map)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mappings_persist_only_after_sync() {
        let dir = tempdir().unwrap();
        let ns = NamespaceStore::open(dir.path()).unwrap();
        ns.set("ex", "http://example.org/").unwrap();
        ns.set("rdf", "http://www.w3.org/1999/02/22-rdf-syntax-ns#")
            .unwrap();
        assert!(NamespaceStore::open(dir.path()).unwrap().list().unwrap().is_empty());
        ns.sync().unwrap();

        let reopened = NamespaceStore::open(dir.path()).unwrap();
        let prefixes: Vec<String> = reopened
            .list()
            .unwrap()
            .into_iter()
            .map(|n| n.prefix)
            .collect();
        assert_eq!(prefixes, vec!["ex", "rdf"]);
        reopened.remove("ex").unwrap();
        assert_eq!(reopened.get("ex").unwrap(), None);
        reopened.clear().unwrap();
        reopened.close().unwrap();
        assert!(NamespaceStore::open(dir.path()).unwrap().list().unwrap().is_empty());
    }
}
