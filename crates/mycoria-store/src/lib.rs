//! # mycoria-store
//!
//! The persisted router state: a JSON document of known routers (with their
//! gossiped public info) and domain mappings. Storage failures are reported
//! to the caller, logged, and retried on the next save; they never tear
//! anything down.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use mycoria_addr::prefix::ip_bits;
use serde::{Deserialize, Serialize};

/// Error types for state persistence.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Public information a router gossips about itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterInfo {
    /// Software version.
    #[serde(default)]
    pub version: String,
    /// Listener URLs the router accepts peerings on.
    #[serde(default)]
    pub listeners: Vec<String>,
    /// Globally resolvable hostnames or IPs for dialing the listeners.
    #[serde(default)]
    pub iana: Vec<String>,
    /// Advertised public services.
    #[serde(default)]
    pub public_services: Vec<String>,
}

/// A persisted record of a known router.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRouter {
    pub address: Ipv6Addr,
    /// Gossiped public info, when the router publishes any.
    #[serde(default)]
    pub public_info: Option<RouterInfo>,
    #[serde(default)]
    pub universe: String,
    /// The router announced it is going offline.
    #[serde(default)]
    pub offline: bool,
    pub created_at: u64,
    pub updated_at: u64,
    pub used_at: u64,
}

/// A `.myco` domain mapping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mapping {
    #[serde(rename = "Domain")]
    pub domain: String,
    #[serde(rename = "Router")]
    pub router: Ipv6Addr,
    #[serde(rename = "Created")]
    pub created: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    routers: HashMap<String, StoredRouter>,
    #[serde(default)]
    mappings: HashMap<String, Mapping>,
}

/// The state store: an in-memory map flushed to one JSON file.
pub struct Store {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl Store {
    /// Open the store, loading existing state when the file exists.
    pub fn open(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            StoreData::default()
        };
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Flush to disk. Failures are logged by the caller and retried at the
    /// next prune interval.
    pub fn save(&self) -> Result<()> {
        let raw = {
            let data = self.read();
            serde_json::to_string_pretty(&*data)?
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Insert or refresh a router record.
    pub fn update_router(&self, address: Ipv6Addr, universe: &str, info: Option<RouterInfo>) {
        let mut data = self.write();
        let now = now_secs();
        let entry = data
            .routers
            .entry(address.to_string())
            .or_insert_with(|| StoredRouter {
                address,
                public_info: None,
                universe: universe.to_string(),
                offline: false,
                created_at: now,
                updated_at: now,
                used_at: now,
            });
        entry.updated_at = now;
        entry.universe = universe.to_string();
        entry.offline = false;
        if info.is_some() {
            entry.public_info = info;
        }
    }

    /// Record that the router was peered with just now.
    pub fn mark_used(&self, address: Ipv6Addr) {
        if let Some(entry) = self.write().routers.get_mut(&address.to_string()) {
            entry.used_at = now_secs();
        }
    }

    /// Record an announced shutdown.
    pub fn mark_offline(&self, address: Ipv6Addr) {
        if let Some(entry) = self.write().routers.get_mut(&address.to_string()) {
            entry.offline = true;
            entry.updated_at = now_secs();
        }
    }

    /// Fetch one router record.
    pub fn get_router(&self, address: Ipv6Addr) -> Option<StoredRouter> {
        self.read().routers.get(&address.to_string()).cloned()
    }

    /// The known routers nearest to `local`, restricted to the same
    /// universe, online, and dialable (public listeners plus IANA hosts).
    /// Used by the auto-connect loop.
    pub fn nearest_dialable(&self, local: Ipv6Addr, universe: &str, limit: usize) -> Vec<StoredRouter> {
        let data = self.read();
        let mut candidates: Vec<&StoredRouter> = data
            .routers
            .values()
            .filter(|r| {
                !r.offline
                    && r.universe == universe
                    && r.public_info.as_ref().is_some_and(|info| {
                        !info.listeners.is_empty() && !info.iana.is_empty()
                    })
            })
            .collect();
        candidates.sort_by_key(|r| ip_bits(r.address).abs_diff(ip_bits(local)));
        candidates.into_iter().take(limit).cloned().collect()
    }

    /// Drop records unused for longer than `max_idle_secs`, returning how
    /// many were removed.
    pub fn prune(&self, max_idle_secs: u64) -> usize {
        let mut data = self.write();
        let cutoff = now_secs().saturating_sub(max_idle_secs);
        let before = data.routers.len();
        data.routers.retain(|_, r| r.used_at >= cutoff);
        let removed = before - data.routers.len();
        if removed > 0 {
            tracing::debug!(removed, "pruned stale router records");
        }
        removed
    }

    /// Look up a domain mapping.
    pub fn get_mapping(&self, domain: &str) -> Option<Mapping> {
        self.read().mappings.get(domain).cloned()
    }

    /// Create or replace a domain mapping.
    pub fn set_mapping(&self, domain: String, router: Ipv6Addr) {
        let mut data = self.write();
        let created = now_secs();
        data.mappings.insert(
            domain.clone(),
            Mapping {
                domain,
                router,
                created,
            },
        );
    }

    /// Number of stored router records.
    pub fn router_count(&self) -> usize {
        self.read().routers.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreData> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreData> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }
}
