//! Plugin registry
//!
//! The single source of truth mapping plugin name to descriptor, status,
//! loaded handle, and last error. Entries are owned exclusively by the
//! registry; other components receive read-only snapshots or call the
//! registry's transition methods. The `Loading`/`Unloading` statuses act as
//! the mutual-exclusion mechanism: a second concurrent transition attempt on
//! the same entry fails fast with `ConcurrentAccessError` instead of queuing
//! silently.

use crate::core::error::{PortalError, Result};
use crate::runtime::descriptor::PluginDescriptor;
use crate::runtime::dispatch::LoadedHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Plugin lifecycle status
///
/// Permitted transitions:
/// `Pending -> Loading -> Loaded`, `Loading -> Error`,
/// `Loaded -> Unloading -> Pending` (unload/reload),
/// `Pending -> MissingDependency`, and `MissingDependency -> Loading` once
/// the absent dependency registers. `Loaded` and `Error` are
/// terminal-for-session; both are re-enterable via reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginStatus {
    Pending,
    Loading,
    Loaded,
    Unloading,
    Error,
    MissingDependency,
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginStatus::Pending => write!(f, "pending"),
            PluginStatus::Loading => write!(f, "loading"),
            PluginStatus::Loaded => write!(f, "loaded"),
            PluginStatus::Unloading => write!(f, "unloading"),
            PluginStatus::Error => write!(f, "error"),
            PluginStatus::MissingDependency => write!(f, "missing-dependency"),
        }
    }
}

/// Outcome of a `register` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// A new entry was inserted as `Pending`
    Inserted,
    /// An existing non-loaded entry's descriptor was replaced; status reset to `Pending`
    Updated,
    /// The entry is currently `Loaded`; the new descriptor is staged and the
    /// caller must drive an unload-then-load sequence
    StagedReload,
}

/// Registry entry, owned exclusively by the registry
struct RegistryEntry {
    descriptor: PluginDescriptor,
    status: PluginStatus,
    handle: Option<LoadedHandle>,
    /// Descriptor staged by a re-register while `Loaded`; promoted to
    /// `descriptor` when the old handle finishes unloading
    staged: Option<PluginDescriptor>,
    error: Option<String>,
    last_loaded: Option<DateTime<Utc>>,
}

/// Read-only snapshot of a registry entry
///
/// Snapshots are cloned out of the registry; mutating one never affects
/// registry state.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub descriptor: PluginDescriptor,
    pub status: PluginStatus,
    pub error: Option<String>,
    pub last_loaded: Option<DateTime<Utc>>,
    /// True when a re-registered descriptor is waiting for the old handle to
    /// unload
    pub reload_staged: bool,
}

impl RegistryEntry {
    fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            descriptor: self.descriptor.clone(),
            status: self.status,
            error: self.error.clone(),
            last_loaded: self.last_loaded,
            reload_staged: self.staged.is_some(),
        }
    }
}

/// Plugin registry
///
/// Invariants: at most one entry per name; at most one in-flight load per
/// name (enforced through the `Loading` status, not a separate lock).
pub struct PluginRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl PluginRegistry {
    /// Create a new empty plugin registry
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a descriptor.
    ///
    /// A fresh name inserts a `Pending` entry. Re-registering a name whose
    /// entry is `Loaded` stages the new descriptor and returns
    /// `StagedReload`, the documented policy replacing the original
    /// system's silent overwrite: the caller performs exactly one unload of
    /// the old handle followed by one load of the staged descriptor.
    /// Re-registering while a transition is in flight fails with
    /// `ConcurrentAccessError`.
    pub async fn register(&self, descriptor: PluginDescriptor) -> Result<RegisterOutcome> {
        let mut entries = self.entries.write().await;

        match entries.get_mut(&descriptor.name) {
            None => {
                tracing::info!(plugin = %descriptor.name, kind = %descriptor.kind, "Plugin registered");
                entries.insert(
                    descriptor.name.clone(),
                    RegistryEntry {
                        descriptor,
                        status: PluginStatus::Pending,
                        handle: None,
                        staged: None,
                        error: None,
                        last_loaded: None,
                    },
                );
                Ok(RegisterOutcome::Inserted)
            }
            Some(entry) => match entry.status {
                PluginStatus::Loaded => {
                    tracing::info!(
                        plugin = %descriptor.name,
                        "Plugin re-registered while loaded; staging descriptor for reload"
                    );
                    entry.staged = Some(descriptor);
                    Ok(RegisterOutcome::StagedReload)
                }
                PluginStatus::Pending | PluginStatus::Error | PluginStatus::MissingDependency => {
                    tracing::info!(plugin = %descriptor.name, "Plugin descriptor replaced");
                    entry.descriptor = descriptor;
                    entry.status = PluginStatus::Pending;
                    entry.error = None;
                    Ok(RegisterOutcome::Updated)
                }
                PluginStatus::Loading | PluginStatus::Unloading => {
                    Err(concurrent(&entry.descriptor.name, entry.status, "register"))
                }
            },
        }
    }

    /// Transition `Pending | MissingDependency -> Loading`.
    ///
    /// A missing-dependency entry becomes loadable the moment the planner
    /// re-schedules it, with no detour through `Pending`. Returns the
    /// descriptor to load. Any other source status fails with
    /// `ConcurrentAccessError`; in particular a second concurrent load of an
    /// entry already `Loading` fails fast here.
    pub async fn mark_loading(&self, name: &str) -> Result<PluginDescriptor> {
        let mut entries = self.entries.write().await;
        let entry = get_mut(&mut entries, name)?;

        if !matches!(
            entry.status,
            PluginStatus::Pending | PluginStatus::MissingDependency
        ) {
            return Err(concurrent(name, entry.status, "loading"));
        }
        entry.status = PluginStatus::Loading;
        entry.error = None;
        Ok(entry.descriptor.clone())
    }

    /// Transition `Loading -> Loaded`, storing the handle
    pub async fn mark_loaded(&self, name: &str, handle: LoadedHandle) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = get_mut(&mut entries, name)?;

        if entry.status != PluginStatus::Loading {
            return Err(concurrent(name, entry.status, "loaded"));
        }
        entry.status = PluginStatus::Loaded;
        entry.handle = Some(handle);
        entry.error = None;
        entry.last_loaded = Some(Utc::now());
        tracing::info!(plugin = %name, "Plugin loaded");
        Ok(())
    }

    /// Transition `Loading -> Error`, preserving the underlying cause
    pub async fn mark_error(&self, name: &str, error: &PortalError) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = get_mut(&mut entries, name)?;

        if entry.status != PluginStatus::Loading {
            return Err(concurrent(name, entry.status, "error"));
        }
        entry.status = PluginStatus::Error;
        entry.error = Some(error.to_string());
        tracing::error!(plugin = %name, error = %error, "Plugin failed to load");
        Ok(())
    }

    /// Transition `Loaded -> Unloading`, handing the stored handle to the
    /// caller so loader dispatch can run teardown.
    pub async fn begin_unload(&self, name: &str) -> Result<LoadedHandle> {
        let mut entries = self.entries.write().await;
        let entry = get_mut(&mut entries, name)?;

        if entry.status != PluginStatus::Loaded {
            return Err(concurrent(name, entry.status, "unloading"));
        }
        let handle = entry.handle.take().ok_or_else(|| {
            PortalError::Runtime(format!("loaded entry '{}' has no handle", name))
        })?;
        entry.status = PluginStatus::Unloading;
        Ok(handle)
    }

    /// Transition `Unloading -> Pending`.
    ///
    /// If a reload was staged, the staged descriptor is promoted here so the
    /// next load picks it up.
    pub async fn mark_unloaded(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = get_mut(&mut entries, name)?;

        if entry.status != PluginStatus::Unloading {
            return Err(concurrent(name, entry.status, "unloaded"));
        }
        if let Some(staged) = entry.staged.take() {
            entry.descriptor = staged;
        }
        entry.status = PluginStatus::Pending;
        entry.error = None;
        tracing::info!(plugin = %name, "Plugin unloaded");
        Ok(())
    }

    /// Transition `Pending | MissingDependency -> MissingDependency`,
    /// recording which dependencies are absent.
    pub async fn mark_missing_dependency(&self, name: &str, missing: &[String]) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = get_mut(&mut entries, name)?;

        match entry.status {
            PluginStatus::Pending | PluginStatus::MissingDependency => {
                entry.status = PluginStatus::MissingDependency;
                entry.error = Some(format!("unresolved dependencies: {}", missing.join(", ")));
                Ok(())
            }
            status => Err(concurrent(name, status, "missing-dependency")),
        }
    }

    /// Transition `MissingDependency | Error -> Pending`, used when a newly
    /// registered plugin may satisfy a previously unresolved dependency.
    pub async fn mark_pending(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = get_mut(&mut entries, name)?;

        match entry.status {
            PluginStatus::MissingDependency | PluginStatus::Error => {
                entry.status = PluginStatus::Pending;
                entry.error = None;
                Ok(())
            }
            status => Err(concurrent(name, status, "pending")),
        }
    }

    /// Record a cycle report against an entry without changing its status.
    ///
    /// Cycle members stay `Pending` forever; the report is surfaced through
    /// snapshots rather than a status of its own.
    pub async fn note_cycle(&self, name: &str, members: &[String]) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = get_mut(&mut entries, name)?;
        entry.error = Some(format!("dependency cycle: {}", members.join(" -> ")));
        Ok(())
    }

    /// Remove an entry entirely.
    ///
    /// A `Loaded` entry must be unloaded first through loader dispatch;
    /// removal never skips unload. Removal during an in-flight transition
    /// fails with `ConcurrentAccessError`.
    pub async fn remove(&self, name: &str) -> Result<PluginDescriptor> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get(name)
            .ok_or_else(|| PortalError::PluginNotFound(name.to_string()))?;

        match entry.status {
            PluginStatus::Loaded => Err(PortalError::Runtime(format!(
                "plugin '{}' is loaded; unload it before unregistering",
                name
            ))),
            PluginStatus::Loading | PluginStatus::Unloading => {
                Err(concurrent(name, entry.status, "remove"))
            }
            _ => {
                let entry = entries.remove(name).expect("checked above");
                tracing::info!(plugin = %name, "Plugin unregistered");
                Ok(entry.descriptor)
            }
        }
    }

    /// Get a snapshot of one entry
    pub async fn get(&self, name: &str) -> Option<EntrySnapshot> {
        self.entries.read().await.get(name).map(|e| e.snapshot())
    }

    /// Return read-only snapshots of every entry matching the predicate.
    ///
    /// Output is sorted by name for deterministic iteration.
    pub async fn query<F>(&self, predicate: F) -> Vec<EntrySnapshot>
    where
        F: Fn(&EntrySnapshot) -> bool,
    {
        let entries = self.entries.read().await;
        let mut snapshots: Vec<EntrySnapshot> = entries
            .values()
            .map(|e| e.snapshot())
            .filter(|s| predicate(s))
            .collect();
        snapshots.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
        snapshots
    }

    /// Snapshot every entry
    pub async fn all(&self) -> Vec<EntrySnapshot> {
        self.query(|_| true).await
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn get_mut<'a>(
    entries: &'a mut HashMap<String, RegistryEntry>,
    name: &str,
) -> Result<&'a mut RegistryEntry> {
    entries
        .get_mut(name)
        .ok_or_else(|| PortalError::PluginNotFound(name.to_string()))
}

fn concurrent(name: &str, status: PluginStatus, attempted: &str) -> PortalError {
    // A race like this is a programming bug, not an expected runtime event.
    tracing::error!(
        plugin = %name,
        status = %status,
        attempted = %attempted,
        "Illegal concurrent state transition"
    );
    PortalError::ConcurrentAccess {
        plugin: name.to_string(),
        status: status.to_string(),
        attempted: attempted.to_string(),
    }
}
