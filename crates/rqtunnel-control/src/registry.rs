//! Registry of named tunnels and their public ports
//!
//! The server registers a tunnel when it starts (its configured name) and
//! whenever an agent announces itself on the control channel. The discovery
//! endpoint only reads snapshots via [`TunnelRegistry::listing`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A registered tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEntry {
    /// Tunnel name announced by the agent or configured on the server
    pub name: String,
    /// Externally reachable user-facing port
    pub port: u16,
    /// When this registration happened
    pub registered_at: chrono::DateTime<chrono::Utc>,
    /// Unique per registration; a re-registration gets a new one
    pub generation: u64,
}

/// Public view of one tunnel as served by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSummary {
    pub name: String,
    pub port: u16,
}

/// Discovery document: `{"list":[{"name":..,"port":..}]}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelListing {
    pub list: Vec<TunnelSummary>,
}

/// Thread-safe registry of named tunnels
#[derive(Debug, Clone, Default)]
pub struct TunnelRegistry {
    tunnels: Arc<RwLock<HashMap<String, TunnelEntry>>>,
    generations: Arc<AtomicU64>,
}

impl TunnelRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunnel, replacing any previous registration under the same name.
    ///
    /// Returns the replaced entry, if any.
    pub fn register_tunnel(&self, name: impl Into<String>, port: u16) -> Option<TunnelEntry> {
        self.claim_tunnel(name, port).1
    }

    /// Register a tunnel and return the new entry along with the replaced one.
    ///
    /// Keep the new entry's `generation` to remove exactly this registration
    /// later with [`unregister_if`](Self::unregister_if).
    pub fn claim_tunnel(
        &self,
        name: impl Into<String>,
        port: u16,
    ) -> (TunnelEntry, Option<TunnelEntry>) {
        let entry = TunnelEntry {
            name: name.into(),
            port,
            registered_at: chrono::Utc::now(),
            generation: self.generations.fetch_add(1, Ordering::Relaxed) + 1,
        };

        let old = match self.tunnels.write() {
            Ok(mut tunnels) => tunnels.insert(entry.name.clone(), entry.clone()),
            Err(_) => return (entry, None),
        };

        if let Some(ref replaced) = old {
            tracing::info!(
                name = %entry.name,
                port = entry.port,
                old_port = replaced.port,
                "Re-registered tunnel"
            );
        } else {
            tracing::info!(name = %entry.name, port = entry.port, "Registered tunnel");
        }

        (entry, old)
    }

    /// Remove a tunnel by name
    pub fn unregister_tunnel(&self, name: &str) -> Option<TunnelEntry> {
        let removed = self
            .tunnels
            .write()
            .ok()
            .and_then(|mut tunnels| tunnels.remove(name));

        if removed.is_some() {
            tracing::info!(name = %name, "Unregistered tunnel");
        } else {
            tracing::debug!(name = %name, "Attempted to unregister unknown tunnel");
        }

        removed
    }

    /// Remove `name` only if it is still the registration with `generation`.
    ///
    /// Returns `None` when the name is gone or was registered again since.
    pub fn unregister_if(&self, name: &str, generation: u64) -> Option<TunnelEntry> {
        let removed = self.tunnels.write().ok().and_then(|mut tunnels| {
            let owned =
                matches!(tunnels.get(name), Some(entry) if entry.generation == generation);
            if owned {
                tunnels.remove(name)
            } else {
                None
            }
        });

        if removed.is_some() {
            tracing::info!(name = %name, "Unregistered tunnel");
        } else {
            tracing::debug!(name = %name, generation, "Registration superseded, keeping tunnel");
        }

        removed
    }

    pub fn get(&self, name: &str) -> Option<TunnelEntry> {
        self.tunnels
            .read()
            .ok()
            .and_then(|tunnels| tunnels.get(name).cloned())
    }

    /// All registered tunnels, sorted by name
    pub fn list_tunnels(&self) -> Vec<TunnelEntry> {
        let mut entries: Vec<TunnelEntry> = match self.tunnels.read() {
            Ok(tunnels) => tunnels.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Snapshot in discovery format
    pub fn listing(&self) -> TunnelListing {
        TunnelListing {
            list: self
                .list_tunnels()
                .into_iter()
                .map(|entry| TunnelSummary {
                    name: entry.name,
                    port: entry.port,
                })
                .collect(),
        }
    }

    pub fn count(&self) -> usize {
        self.tunnels.read().map(|t| t.len()).unwrap_or(0)
    }
}
