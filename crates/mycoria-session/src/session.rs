//! Per-remote session records and the shared session map.
//!
//! A session bundles the signing and AEAD state for one remote router and
//! tracks its last activity. Idle sessions are killable after one hour, or
//! after one minute when the AEAD setup never completed.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mycoria_addr::{PrivateIdentity, RouterAddress};

use crate::aead::AeadSession;
use crate::signing::SigningSession;

/// Idle lifetime of a fully established session.
pub const SESSION_TTL: Duration = Duration::from_secs(60 * 60);

/// Idle lifetime of a session whose encryption setup never completed.
pub const SESSION_SETUP_TTL: Duration = Duration::from_secs(60);

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// All cryptographic state shared with one remote router.
pub struct Session {
    remote: RouterAddress,
    signing: SigningSession,
    aead: AeadSession,
    last_activity: AtomicU64,
}

impl Session {
    pub fn new(local: Arc<PrivateIdentity>, remote: RouterAddress) -> Self {
        Self {
            signing: SigningSession::new(local, remote.clone()),
            remote,
            aead: AeadSession::new(),
            last_activity: AtomicU64::new(now_secs()),
        }
    }

    /// The remote's address record.
    pub fn remote(&self) -> &RouterAddress {
        &self.remote
    }

    /// The remote's overlay IP.
    pub fn remote_ip(&self) -> Ipv6Addr {
        self.remote.ip
    }

    /// The signing session.
    pub fn signing(&self) -> &SigningSession {
        &self.signing
    }

    /// The end-to-end AEAD session.
    pub fn aead(&self) -> &AeadSession {
        &self.aead
    }

    /// Record activity, deferring cleanup.
    pub fn touch(&self) {
        self.last_activity.store(now_secs(), Ordering::Relaxed);
    }

    /// Seconds since the last recorded activity.
    pub fn idle_secs(&self) -> u64 {
        now_secs().saturating_sub(self.last_activity.load(Ordering::Relaxed))
    }

    /// Whether the cleaner may remove this session.
    pub fn killable(&self) -> bool {
        let ttl = if self.aead.is_ready() {
            SESSION_TTL
        } else {
            SESSION_SETUP_TTL
        };
        self.idle_secs() >= ttl.as_secs()
    }
}

/// The shared session map, keyed by remote address.
pub struct SessionManager {
    local: Arc<PrivateIdentity>,
    sessions: RwLock<HashMap<Ipv6Addr, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(local: Arc<PrivateIdentity>) -> Self {
        Self {
            local,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// The local identity sessions sign with.
    pub fn local(&self) -> &Arc<PrivateIdentity> {
        &self.local
    }

    /// Fetch the session for `ip`, if any.
    pub fn get(&self, ip: Ipv6Addr) -> Option<Arc<Session>> {
        self.read().get(&ip).cloned()
    }

    /// Fetch or create the session for a remote.
    pub fn get_or_create(&self, remote: RouterAddress) -> Arc<Session> {
        if let Some(session) = self.get(remote.ip) {
            return session;
        }
        let mut sessions = self.write();
        sessions
            .entry(remote.ip)
            .or_insert_with(|| Arc::new(Session::new(self.local.clone(), remote)))
            .clone()
    }

    /// Drop a session outright.
    pub fn remove(&self, ip: Ipv6Addr) {
        self.write().remove(&ip);
    }

    /// Remove all killable sessions, returning how many were dropped.
    pub fn kill_expired(&self) -> usize {
        let mut sessions = self.write();
        let before = sessions.len();
        sessions.retain(|_, session| !session.killable());
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(removed, "cleaned up idle sessions");
        }
        removed
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Ipv6Addr, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Ipv6Addr, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(seed: u8) -> Arc<PrivateIdentity> {
        Arc::new(PrivateIdentity::from_parts(&[seed; 32], 0))
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let manager = SessionManager::new(identity(1));
        let remote = identity(2);
        let first = manager.get_or_create(remote.address().clone());
        let second = manager.get_or_create(remote.address().clone());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_fresh_session_is_not_killable() {
        let manager = SessionManager::new(identity(1));
        let session = manager.get_or_create(identity(2).address().clone());
        assert!(!session.killable());
        assert_eq!(manager.kill_expired(), 0);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove() {
        let manager = SessionManager::new(identity(1));
        let remote = identity(2);
        manager.get_or_create(remote.address().clone());
        manager.remove(remote.ip());
        assert!(manager.get(remote.ip()).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_touch_resets_idle() {
        let manager = SessionManager::new(identity(1));
        let session = manager.get_or_create(identity(2).address().clone());
        session.touch();
        assert_eq!(session.idle_secs(), 0);
    }
}
