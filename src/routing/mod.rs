//! Persisted set of hosts that must go through the relay.
//!
//! The backing file holds one bare hostname per line and only ever grows.
//! It is read once at startup; after that the in-memory set is authoritative
//! and every new host is appended to the file.

pub mod policy;

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub use policy::{RecordOutcome, Resolver, RoutingPolicy, SystemResolver};

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Failed to load routing table {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to persist {host} to {path}: {source}")]
    Persist {
        host: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct HostRoutingTable {
    hosts: Mutex<HashSet<String>>,
    file: PathBuf,
}

impl HostRoutingTable {
    /// Opens (creating if needed) the table file and loads every entry.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RoutingError> {
        let file = path.as_ref().to_path_buf();
        let load_err = |source| RoutingError::Load {
            path: file.clone(),
            source,
        };

        if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(load_err)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
            .map_err(load_err)?;

        let contents = fs::read_to_string(&file).map_err(load_err)?;
        let hosts: HashSet<String> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        tracing::info!(path = %file.display(), hosts = hosts.len(), "Loaded routing table");

        Ok(Self {
            hosts: Mutex::new(hosts),
            file,
        })
    }

    pub fn has(&self, host: &str) -> bool {
        self.lock().contains(host)
    }

    /// Inserts `host` and appends it to the file. Returns `Ok(false)` when
    /// the host was already present. If the append fails the host stays in
    /// memory and the error is returned.
    pub fn add(&self, host: &str) -> Result<bool, RoutingError> {
        let mut hosts = self.lock();
        if !hosts.insert(host.to_string()) {
            return Ok(false);
        }

        let persisted = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file)
            .and_then(|mut f| f.write_all(format!("{host}\n").as_bytes()));

        persisted.map_err(|source| RoutingError::Persist {
            host: host.to_string(),
            path: self.file.clone(),
            source,
        })?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.hosts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
