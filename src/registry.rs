//! Registry Store
//!
//! Durable per-module installation records. The store is the only persisted
//! state; everything else is recomputed from module sources on each run.
//!
//! # Invariants
//!
//! - One record per module path, addressed by [`ModulePath::encode`]
//! - `installed_at` is written once, the first time a module reaches
//!   `installed`/`active`, and preserved by every later `put`
//! - `updated_at` is refreshed by every mutation
//! - Status changes follow [`ModuleStatus::can_transition`]
//! - `removed` records are kept; only [`RegistryStore::delete`] erases one
//!
//! The file-backed store writes each record to a temporary file in the same
//! directory, syncs it, then renames it over the target. A crash leaves
//! either the old record or the new one, never a torn file.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::discovery::DiscoveredModule;
use crate::types::{Capability, InstallMethod, ModulePath, ModuleStatus, StatusTransitionError};

const RECORD_EXTENSION: &str = "json";

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed registry record {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    InvalidTransition(#[from] StatusTransitionError),

    #[error("no registry record for {0}")]
    NotFound(ModulePath),
}

impl From<RegistryError> for crate::error::ModhostError {
    fn from(err: RegistryError) -> Self {
        crate::error::ModhostError::Registry(err.to_string())
    }
}

/// Millisecond-precision ISO-8601 UTC timestamps
mod timestamp {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            dt: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match dt {
                Some(dt) => super::serialize(dt, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw: Option<String> = Option::deserialize(d)?;
            raw.map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
        }
    }
}

/// Current time at the precision records are stored with
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Persisted installation record for one module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub module_path: ModulePath,
    pub name: String,
    pub version: String,
    pub category: String,
    pub status: ModuleStatus,
    /// First successful install; `None` for a module that has only failed
    #[serde(default, with = "timestamp::option")]
    pub installed_at: Option<DateTime<Utc>>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
    pub installed_by: String,
    pub install_method: InstallMethod,
    /// SHA-256 of the module source at install time
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub dependencies: Vec<ModulePath>,
    #[serde(default)]
    pub packages: BTreeSet<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub log_files: Vec<PathBuf>,
}

impl RegistryEntry {
    /// Minimal record; identity comes from the path
    pub fn new(
        path: ModulePath,
        status: ModuleStatus,
        method: InstallMethod,
        installed_by: impl Into<String>,
    ) -> Self {
        Self {
            name: path.name().to_string(),
            category: path.category().to_string(),
            module_path: path,
            version: String::from("unknown"),
            status,
            installed_at: None,
            updated_at: now(),
            installed_by: installed_by.into(),
            install_method: method,
            fingerprint: None,
            capabilities: BTreeSet::new(),
            dependencies: Vec::new(),
            packages: BTreeSet::new(),
            service: None,
            log_files: Vec::new(),
        }
    }

    /// Record with a snapshot of the module's manifest
    pub fn for_module(
        module: &DiscoveredModule,
        status: ModuleStatus,
        method: InstallMethod,
        installed_by: impl Into<String>,
    ) -> Self {
        let mut entry = Self::new(module.path.clone(), status, method, installed_by);
        if let Some(manifest) = &module.manifest {
            if !manifest.name.is_empty() {
                entry.name = manifest.name.clone();
            }
            if !manifest.version.is_empty() {
                entry.version = manifest.version.clone();
            }
            entry.capabilities = manifest.capabilities.clone();
            entry.dependencies = manifest.dependencies.clone();
            entry.packages = manifest.required_packages.clone();
            entry.service = manifest.service_name();
            entry.log_files = manifest.log_files.clone();
        }
        entry
    }

    pub fn with_fingerprint(mut self, fingerprint: Option<String>) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub fn is_installed(&self) -> bool {
        self.status.is_installed()
    }
}

/// Apply the write-once and transition rules for a `put`
fn prepare_put(
    previous: Option<&RegistryEntry>,
    mut entry: RegistryEntry,
) -> Result<RegistryEntry, RegistryError> {
    ModuleStatus::check_transition(
        &entry.module_path,
        previous.map(|p| p.status),
        entry.status,
    )?;

    let stamp = now();
    entry.updated_at = stamp;
    entry.installed_at = match previous.and_then(|p| p.installed_at) {
        Some(first) => Some(first),
        None if entry.status.is_installed() => Some(stamp),
        None => None,
    };
    Ok(entry)
}

fn prepare_removal(previous: RegistryEntry) -> Result<RegistryEntry, RegistryError> {
    ModuleStatus::check_transition(
        &previous.module_path,
        Some(previous.status),
        ModuleStatus::Removed,
    )?;
    Ok(RegistryEntry {
        status: ModuleStatus::Removed,
        updated_at: now(),
        ..previous
    })
}

/// Registry Store interface
pub trait RegistryStore {
    fn get(&self, path: &ModulePath) -> Result<Option<RegistryEntry>, RegistryError>;

    /// Create or update a record. Returns the record as stored.
    fn put(&mut self, entry: RegistryEntry) -> Result<RegistryEntry, RegistryError>;

    /// Soft delete: set status to `removed`, keep the record
    fn mark_removed(&mut self, path: &ModulePath) -> Result<RegistryEntry, RegistryError>;

    /// Erase the record. Returns whether one existed. Purge only.
    fn delete(&mut self, path: &ModulePath) -> Result<bool, RegistryError>;

    /// All records, ordered by module path
    fn list(&self) -> Result<Vec<RegistryEntry>, RegistryError>;
}

/// Directory of JSON records, one file per module
#[derive(Debug, Clone)]
pub struct FileRegistry {
    dir: PathBuf,
}

impl FileRegistry {
    /// The directory is created on first write, not here.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the record for `path`
    pub fn record_path(&self, path: &ModulePath) -> PathBuf {
        self.dir.join(format!("{}.{}", path.encode(), RECORD_EXTENSION))
    }

    fn read_record(&self, file: &Path) -> Result<Option<RegistryEntry>, RegistryError> {
        let content = match fs::read_to_string(file) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(RegistryError::Io {
                    path: file.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| RegistryError::Malformed {
                path: file.to_path_buf(),
                source,
            })
    }

    fn write_record(&self, entry: &RegistryEntry) -> Result<(), RegistryError> {
        let target = self.record_path(&entry.module_path);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| RegistryError::Io { path, source }
        };

        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;

        let json = serde_json::to_string_pretty(entry).map_err(|source| {
            RegistryError::Malformed {
                path: target.clone(),
                source,
            }
        })?;

        let temp = self.dir.join(format!(
            ".{}.{}.tmp-{}",
            entry.module_path.encode(),
            RECORD_EXTENSION,
            std::process::id()
        ));
        {
            let mut file = File::create(&temp).map_err(io_err(&temp))?;
            file.write_all(json.as_bytes()).map_err(io_err(&temp))?;
            file.write_all(b"\n").map_err(io_err(&temp))?;
            file.sync_all().map_err(io_err(&temp))?;
        }

        if let Err(source) = fs::rename(&temp, &target) {
            let _ = fs::remove_file(&temp);
            return Err(RegistryError::Io {
                path: target,
                source,
            });
        }

        // Persist the rename itself
        if let Err(e) = File::open(&self.dir).and_then(|d| d.sync_all()) {
            debug!("Could not sync registry directory {}: {}", self.dir.display(), e);
        }

        debug!(
            "Wrote registry record {} ({})",
            target.display(),
            entry.status
        );
        Ok(())
    }
}

impl RegistryStore for FileRegistry {
    fn get(&self, path: &ModulePath) -> Result<Option<RegistryEntry>, RegistryError> {
        self.read_record(&self.record_path(path))
    }

    fn put(&mut self, entry: RegistryEntry) -> Result<RegistryEntry, RegistryError> {
        // A torn record is invisible to list(), so it must not block the rewrite
        let previous = match self.get(&entry.module_path) {
            Err(RegistryError::Malformed { path, source }) => {
                warn!(
                    "Replacing malformed registry record {}: {}",
                    path.display(),
                    source
                );
                None
            }
            other => other?,
        };
        let entry = prepare_put(previous.as_ref(), entry)?;
        self.write_record(&entry)?;
        Ok(entry)
    }

    fn mark_removed(&mut self, path: &ModulePath) -> Result<RegistryEntry, RegistryError> {
        let previous = self
            .get(path)?
            .ok_or_else(|| RegistryError::NotFound(path.clone()))?;
        let entry = prepare_removal(previous)?;
        self.write_record(&entry)?;
        Ok(entry)
    }

    fn delete(&mut self, path: &ModulePath) -> Result<bool, RegistryError> {
        let file = self.record_path(path);
        match fs::remove_file(&file) {
            Ok(()) => {
                debug!("Deleted registry record {}", file.display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(RegistryError::Io { path: file, source }),
        }
    }

    fn list(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        let dir = match fs::read_dir(&self.dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(RegistryError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut entries = Vec::new();
        for item in dir {
            let item = item.map_err(|source| RegistryError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let file = item.path();
            let Some(stem) = record_stem(&file) else {
                continue;
            };
            let Ok(expected) = ModulePath::decode(stem) else {
                warn!("Ignoring registry file with undecodable name: {}", file.display());
                continue;
            };
            match self.read_record(&file) {
                Ok(Some(entry)) if entry.module_path == expected => entries.push(entry),
                Ok(Some(entry)) => warn!(
                    "Ignoring registry record {}: it describes {}",
                    file.display(),
                    entry.module_path
                ),
                Ok(None) => {}
                Err(e) => warn!("Ignoring unreadable registry record: {}", e),
            }
        }
        entries.sort_by(|a, b| a.module_path.cmp(&b.module_path));
        Ok(entries)
    }
}

/// Encoded module path of a record file; `None` for temp files and strangers
fn record_stem(file: &Path) -> Option<&str> {
    if file.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
        return None;
    }
    file.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.starts_with('.'))
}

/// In-memory store, for tests and dry runs
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    entries: BTreeMap<ModulePath, RegistryEntry>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy every record of another store
    pub fn snapshot(store: &dyn RegistryStore) -> Result<Self, RegistryError> {
        Ok(Self::from_entries(store.list()?))
    }

    /// Seed with records as-is, bypassing the put rules
    pub fn from_entries(entries: impl IntoIterator<Item = RegistryEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| (e.module_path.clone(), e))
                .collect(),
        }
    }
}

impl RegistryStore for MemoryRegistry {
    fn get(&self, path: &ModulePath) -> Result<Option<RegistryEntry>, RegistryError> {
        Ok(self.entries.get(path).cloned())
    }

    fn put(&mut self, entry: RegistryEntry) -> Result<RegistryEntry, RegistryError> {
        let entry = prepare_put(self.entries.get(&entry.module_path), entry)?;
        self.entries
            .insert(entry.module_path.clone(), entry.clone());
        Ok(entry)
    }

    fn mark_removed(&mut self, path: &ModulePath) -> Result<RegistryEntry, RegistryError> {
        let previous = self
            .entries
            .get(path)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(path.clone()))?;
        let entry = prepare_removal(previous)?;
        self.entries.insert(path.clone(), entry.clone());
        Ok(entry)
    }

    fn delete(&mut self, path: &ModulePath) -> Result<bool, RegistryError> {
        Ok(self.entries.remove(path).is_some())
    }

    fn list(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        Ok(self.entries.values().cloned().collect())
    }
}
