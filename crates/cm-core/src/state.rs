//! Persistent environment ledger
//!
//! The ledger is one versioned JSON document mapping environment IDs to
//! [`Environment`] records, plus a single active-environment pointer. Every
//! write replaces the whole document through a sibling temp file and a
//! rename, so readers only ever see a complete document.

use crate::{CoreError, Environment, EnvironmentStatus, ErrorCode, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Ledger file name inside the state directory
pub const STATE_FILE: &str = "environments.json";

/// Current ledger format version
pub const STATE_VERSION: u32 = 1;

/// Write `content` to `path` atomically (temp file in the same directory,
/// then rename over the target)
pub(crate) fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// The on-disk document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(default)]
    pub version: u32,
    /// Active environment ID, empty when none
    #[serde(default)]
    pub active_env: String,
    #[serde(default)]
    pub environments: HashMap<String, Environment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            active_env: String::new(),
            environments: HashMap::new(),
            last_sync: None,
        }
    }
}

impl Ledger {
    /// Parse a ledger document
    pub fn parse(content: &[u8]) -> Result<Self> {
        let mut ledger: Self = serde_json::from_slice(content)?;

        if ledger.version == 0 {
            ledger.version = STATE_VERSION;
        } else if ledger.version > STATE_VERSION {
            tracing::warn!(
                "State file version {} is newer than supported version {}",
                ledger.version,
                STATE_VERSION
            );
        }

        Ok(ledger)
    }

    fn get(&self, id: &str) -> Result<&Environment> {
        self.environments
            .get(id)
            .ok_or_else(|| CoreError::env_not_found(id))
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Environment> {
        self.environments
            .get_mut(id)
            .ok_or_else(|| CoreError::env_not_found(id))
    }

    fn find(&self, pred: impl Fn(&Environment) -> bool) -> Option<&Environment> {
        // Oldest first keeps lookups stable if a name ever appears twice
        self.environments
            .values()
            .filter(|env| pred(env))
            .min_by_key(|env| env.created_at)
    }
}

/// Durable store of environments
///
/// Lookups fail with [`ErrorCode::EnvNotFound`] when nothing matches.
pub trait StateStore: Send + Sync {
    /// Insert or replace by ID, stamping `updated_at`
    fn save(&self, env: &mut Environment) -> Result<()>;

    fn load(&self, id: &str) -> Result<Environment>;

    fn load_by_name(&self, name: &str) -> Result<Environment>;

    fn get_by_name(&self, name: &str) -> Result<Environment> {
        self.load_by_name(name)
    }

    fn get_by_container_id(&self, container_id: &str) -> Result<Environment>;

    /// Remove by ID, clearing the active pointer if it pointed here
    fn delete(&self, id: &str) -> Result<()>;

    /// All environments, in no particular order
    fn list(&self) -> Result<Vec<Environment>>;

    /// Point at an existing environment, or clear with an empty ID
    fn set_active(&self, id: &str) -> Result<()>;

    fn get_active(&self) -> Result<Option<String>>;

    fn find_by_status(&self, status: EnvironmentStatus) -> Result<Vec<Environment>>;

    fn find_by_project(&self, project_dir: &Path) -> Result<Vec<Environment>>;

    fn count(&self) -> Result<usize>;

    fn update_status(&self, id: &str, status: EnvironmentStatus, msg: Option<String>)
        -> Result<()>;

    fn update_last_used(&self, id: &str) -> Result<()>;

    /// Whole ledger as JSON
    fn export_state(&self) -> Result<Vec<u8>>;

    /// Replace the whole ledger; only JSON well-formedness is checked
    fn import_state(&self, data: &[u8]) -> Result<()>;
}

/// Where a ledger is made durable
pub trait LedgerBackend: Send + Sync {
    fn persist(&self, ledger: &Ledger) -> Result<()>;
}

/// Persists to a JSON file
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl LedgerBackend for FileBackend {
    fn persist(&self, ledger: &Ledger) -> Result<()> {
        let content = serde_json::to_vec_pretty(ledger)?;
        atomic_write(&self.path, &content).map_err(|e| {
            CoreError::new(
                ErrorCode::Io,
                format!("failed to write {}", self.path.display()),
            )
            .with_source(e)
        })
    }
}

/// Keeps the ledger in memory only
#[derive(Debug, Clone, Default)]
pub struct InMemory;

impl LedgerBackend for InMemory {
    fn persist(&self, _ledger: &Ledger) -> Result<()> {
        Ok(())
    }
}

/// Ledger held in memory behind a reader/writer lock, persisted through `B`
/// after every mutation
pub struct LedgerStore<B> {
    backend: B,
    ledger: RwLock<Ledger>,
}

/// Production store backed by `environments.json`
pub type FileStateStore = LedgerStore<FileBackend>;

/// Store that never touches disk
pub type MemoryStateStore = LedgerStore<InMemory>;

impl FileStateStore {
    /// Open the ledger at `path`, starting empty if it does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let ledger = if path.exists() {
            let content = std::fs::read(&path)?;
            Ledger::parse(&content).map_err(|e| {
                CoreError::new(
                    ErrorCode::StateCorrupted,
                    format!("cannot read environment state at {}", path.display()),
                )
                .with_source(e)
                .with_suggestion(format!(
                    "Move {} aside to start with an empty ledger",
                    path.display()
                ))
            })?
        } else {
            Ledger::default()
        };

        tracing::debug!(
            "Opened ledger {:?} with {} environments",
            path,
            ledger.environments.len()
        );

        Ok(Self {
            backend: FileBackend { path },
            ledger: RwLock::new(ledger),
        })
    }

    /// Open `environments.json` in the configured state directory
    pub fn open_default() -> Result<Self> {
        let dir = cm_config::GlobalConfig::state_dir()?;
        Self::open(dir.join(STATE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.backend.path
    }
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::with_backend(InMemory)
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: LedgerBackend> LedgerStore<B> {
    /// Empty store persisting through `backend`
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend,
            ledger: RwLock::new(Ledger::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Ledger>> {
        self.ledger.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Ledger>> {
        self.ledger.write().map_err(|_| poisoned())
    }

    /// Apply `f` to a copy of the ledger, persist it, then publish it
    ///
    /// If `f` or the persist fails, the in-memory ledger is untouched.
    fn mutate<T>(&self, f: impl FnOnce(&mut Ledger) -> Result<T>) -> Result<T> {
        let mut guard = self.write()?;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        next.last_sync = Some(Utc::now());
        self.backend.persist(&next)?;
        *guard = next;
        Ok(out)
    }
}

fn poisoned() -> CoreError {
    CoreError::new(ErrorCode::StateCorrupted, "state lock poisoned")
}

impl<B: LedgerBackend> StateStore for LedgerStore<B> {
    fn save(&self, env: &mut Environment) -> Result<()> {
        if env.id.is_empty() {
            return Err(CoreError::invalid_config("environment ID is required")
                .with_env("", env.name.as_str()));
        }

        self.mutate(|ledger| {
            if let Some(existing) = ledger.environments.get(&env.id) {
                if existing.created_at != env.created_at {
                    return Err(CoreError::new(
                        ErrorCode::EnvExists,
                        format!("ID {} already belongs to environment {}", env.id, existing.name),
                    )
                    .with_env(env.id.as_str(), env.name.as_str()));
                }
            }

            let now = Utc::now();
            env.updated_at = now.max(env.updated_at);
            ledger.environments.insert(env.id.clone(), env.clone());
            Ok(())
        })
    }

    fn load(&self, id: &str) -> Result<Environment> {
        self.read()?.get(id).cloned()
    }

    fn load_by_name(&self, name: &str) -> Result<Environment> {
        self.read()?
            .find(|env| env.name == name)
            .cloned()
            .ok_or_else(|| CoreError::env_not_found(name))
    }

    fn get_by_container_id(&self, container_id: &str) -> Result<Environment> {
        self.read()?
            .find(|env| env.container_id.as_deref() == Some(container_id))
            .cloned()
            .ok_or_else(|| {
                CoreError::new(
                    ErrorCode::EnvNotFound,
                    format!("no environment owns container {}", container_id),
                )
            })
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.mutate(|ledger| {
            ledger
                .environments
                .remove(id)
                .ok_or_else(|| CoreError::env_not_found(id))?;
            if ledger.active_env == id {
                ledger.active_env.clear();
            }
            Ok(())
        })
    }

    fn list(&self) -> Result<Vec<Environment>> {
        Ok(self.read()?.environments.values().cloned().collect())
    }

    fn set_active(&self, id: &str) -> Result<()> {
        self.mutate(|ledger| {
            if !id.is_empty() {
                ledger.get(id)?;
            }
            ledger.active_env = id.to_string();
            Ok(())
        })
    }

    fn get_active(&self) -> Result<Option<String>> {
        let ledger = self.read()?;
        Ok((!ledger.active_env.is_empty()).then(|| ledger.active_env.clone()))
    }

    fn find_by_status(&self, status: EnvironmentStatus) -> Result<Vec<Environment>> {
        Ok(self
            .read()?
            .environments
            .values()
            .filter(|env| env.status == status)
            .cloned()
            .collect())
    }

    fn find_by_project(&self, project_dir: &Path) -> Result<Vec<Environment>> {
        Ok(self
            .read()?
            .environments
            .values()
            .filter(|env| env.project_dir == project_dir)
            .cloned()
            .collect())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.read()?.environments.len())
    }

    fn update_status(
        &self,
        id: &str,
        status: EnvironmentStatus,
        msg: Option<String>,
    ) -> Result<()> {
        self.mutate(|ledger| {
            let env = ledger.get_mut(id)?;
            env.status = status;
            env.status_msg = msg;
            env.updated_at = Utc::now();
            Ok(())
        })
    }

    fn update_last_used(&self, id: &str) -> Result<()> {
        self.mutate(|ledger| {
            let env = ledger.get_mut(id)?;
            let now = Utc::now();
            env.last_used_at = Some(now);
            env.updated_at = now;
            Ok(())
        })
    }

    fn export_state(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&*self.read()?)?)
    }

    fn import_state(&self, data: &[u8]) -> Result<()> {
        let imported = Ledger::parse(data)?;
        self.mutate(|ledger| {
            *ledger = imported;
            Ok(())
        })
    }
}
