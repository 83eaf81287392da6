//! The link manager.
//!
//! Owns the link registries (by peer address and by switch label) and the
//! listener registry, feeds inbound frames to the router core, and runs the
//! connect loop that keeps the router attached to the overlay.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use mycoria_addr::classify::{classify, AddressType};
use mycoria_addr::{PrivateIdentity, RouterAddress};
use mycoria_frame::frame::Frame;
use mycoria_frame::FrameBuilder;
use mycoria_router::{RouteEntry, RoutingTable};
use mycoria_session::session::SessionManager;
use mycoria_store::Store;
use mycoria_switch::label::{derive_label, random_label};
use mycoria_switch::SwitchLabel;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::link::Link;
use crate::protocol::HandshakeConfig;
use crate::transport::{Acceptor, Transport};
use crate::url::PeeringUrl;
use crate::{PeeringError, Result};

/// Connect-loop interval while the router has no links.
pub const CONNECT_INTERVAL_FAST: Duration = Duration::from_secs(1);

/// Connect-loop interval once links exist.
pub const CONNECT_INTERVAL_SLOW: Duration = Duration::from_secs(60);

/// Inbound frame queue depth toward the router core.
const INBOUND_QUEUE_LEN: usize = 1000;

/// Peering policy, distilled from the configuration.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub router_version: String,
    pub universe: String,
    pub universe_secret: String,
    pub lite: bool,
    pub tun_mtu: u16,
    pub auto_connect: bool,
    pub min_auto_connect: usize,
    pub connect: Vec<PeeringUrl>,
    pub bootstrap: Vec<PeeringUrl>,
    pub listen: Vec<PeeringUrl>,
}

impl ManagerConfig {
    /// Distill the peering policy from the loaded configuration.
    pub fn from_config(config: &mycoria_config::Config) -> Result<Self> {
        let parse_all = |raw: &[String]| -> Result<Vec<PeeringUrl>> {
            let mut urls = raw
                .iter()
                .map(|u| PeeringUrl::parse(u))
                .collect::<Result<Vec<_>>>()?;
            urls.sort();
            Ok(urls)
        };
        Ok(Self {
            router_version: env!("CARGO_PKG_VERSION").to_string(),
            universe: config.router.universe.clone(),
            universe_secret: config.router.universe_secret.clone(),
            lite: config.router.lite,
            tun_mtu: config.system.tun_mtu,
            auto_connect: config.router.auto_connect && !config.router.isolate,
            min_auto_connect: config.router.min_auto_connect,
            connect: parse_all(&config.router.connect)?,
            bootstrap: parse_all(&config.router.bootstrap)?,
            listen: parse_all(&config.router.listen)?,
        })
    }
}

struct Registry {
    by_address: HashMap<Ipv6Addr, Arc<Link>>,
    by_label: HashMap<SwitchLabel, Arc<Link>>,
    /// Successful dials, so configured URLs are not redialed while their
    /// peer is connected.
    url_peers: HashMap<String, Ipv6Addr>,
}

/// The link manager.
pub struct LinkManager {
    local: Arc<PrivateIdentity>,
    config: ManagerConfig,
    sessions: Arc<SessionManager>,
    frames: Arc<FrameBuilder>,
    table: Arc<RoutingTable>,
    store: Arc<Store>,
    registry: RwLock<Registry>,
    listeners: RwLock<HashMap<String, CancellationToken>>,
    wake_connect: Notify,
    inbound_tx: mpsc::Sender<(Arc<Link>, Frame)>,
}

impl LinkManager {
    /// Build the manager; the returned receiver feeds the router core.
    pub fn new(
        local: Arc<PrivateIdentity>,
        config: ManagerConfig,
        sessions: Arc<SessionManager>,
        table: Arc<RoutingTable>,
        store: Arc<Store>,
    ) -> (Arc<Self>, mpsc::Receiver<(Arc<Link>, Frame)>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_LEN);
        let manager = Arc::new(Self {
            local,
            config,
            sessions,
            frames: Arc::new(FrameBuilder::new()),
            table,
            store,
            registry: RwLock::new(Registry {
                by_address: HashMap::new(),
                by_label: HashMap::new(),
                url_peers: HashMap::new(),
            }),
            listeners: RwLock::new(HashMap::new()),
            wake_connect: Notify::new(),
            inbound_tx,
        });
        (manager, inbound_rx)
    }

    pub fn local(&self) -> &Arc<PrivateIdentity> {
        &self.local
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn frames(&self) -> &FrameBuilder {
        &self.frames
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The handshake configuration for a new link.
    pub fn handshake_config(&self, client: bool) -> HandshakeConfig {
        HandshakeConfig {
            local: self.local.clone(),
            universe: self.config.universe.clone(),
            universe_secret: self.config.universe_secret.clone(),
            router_version: self.config.router_version.clone(),
            lite: self.config.lite,
            tun_mtu: self.config.tun_mtu,
            client,
        }
    }

    /// Register a freshly established link under one registry lock:
    /// rejects already-connected peers, assigns the switch label, stores
    /// both indexes and inserts the peer route.
    pub fn register_link(
        &self,
        remote: &RouterAddress,
        make: impl FnOnce(SwitchLabel) -> Arc<Link>,
    ) -> Result<Arc<Link>> {
        let link = {
            let mut registry = self.write();
            if registry.by_address.contains_key(&remote.ip) {
                return Err(PeeringError::HandshakeFailed(format!(
                    "already connected to {}",
                    remote.ip
                )));
            }

            let routable = classify(remote.ip) != AddressType::Privacy;
            let label = derive_label(remote.ip)
                .filter(|l| !registry.by_label.contains_key(l))
                .or_else(|| random_label(routable, |l| registry.by_label.contains_key(&l)))
                .ok_or_else(|| {
                    PeeringError::HandshakeFailed("no free switch label".into())
                })?;

            let link = make(label);
            registry.by_address.insert(remote.ip, link.clone());
            registry.by_label.insert(label, link.clone());
            link
        };

        if let Err(err) = self.table.add_route(RouteEntry::peer(remote.ip)) {
            tracing::warn!(peer = %remote.ip, %err, "peer route insert failed");
        }
        self.store.update_router(remote.ip, &self.config.universe, None);
        self.store.mark_used(remote.ip);
        tracing::info!(peer = %remote.ip, label = %link.label(), "link established");
        Ok(link)
    }

    /// Deregister a closed link, drop its routes, and wake the connect
    /// loop when it was the last one.
    pub fn remove_link(&self, link: &Arc<Link>) {
        let last_link = {
            let mut registry = self.write();
            let removed = match registry.by_address.get(&link.remote_ip()) {
                Some(current) if Arc::ptr_eq(current, link) => {
                    registry.by_address.remove(&link.remote_ip());
                    true
                }
                _ => false,
            };
            if removed {
                registry.by_label.remove(&link.label());
                registry.url_peers.retain(|_, ip| *ip != link.remote_ip());
            }
            removed && registry.by_address.is_empty()
        };

        self.table.remove_next_hop(link.remote_ip());
        tracing::info!(peer = %link.remote_ip(), "link removed");
        if last_link {
            self.wake_connect.notify_one();
        }
    }

    /// Hand an inbound frame to the router core.
    pub async fn dispatch(&self, link: &Arc<Link>, frame: Frame) {
        if let Some(session) = self.sessions.get(link.remote_ip()) {
            session.touch();
        }
        if self.inbound_tx.send((link.clone(), frame)).await.is_err() {
            tracing::debug!("router core is gone, dropping inbound frame");
        }
    }

    /// The link to a directly connected peer.
    pub fn link_by_address(&self, ip: Ipv6Addr) -> Option<Arc<Link>> {
        self.read().by_address.get(&ip).cloned()
    }

    /// The link behind a switch label.
    pub fn link_by_label(&self, label: SwitchLabel) -> Option<Arc<Link>> {
        self.read().by_label.get(&label).cloned()
    }

    /// Whether a peer is connected.
    pub fn is_connected(&self, ip: Ipv6Addr) -> bool {
        self.read().by_address.contains_key(&ip)
    }

    /// Number of live links.
    pub fn link_count(&self) -> usize {
        self.read().by_address.len()
    }

    /// Snapshot of all links.
    pub fn links(&self) -> Vec<Arc<Link>> {
        self.read().by_address.values().cloned().collect()
    }

    /// Dial one URL and establish a link over it.
    pub async fn connect_url<T: Transport>(
        self: &Arc<Self>,
        transport: &T,
        url: &PeeringUrl,
    ) -> Result<Arc<Link>> {
        let (stream, peer_addr) = transport
            .dial(url)
            .await
            .map_err(|e| PeeringError::NetworkWriteError(format!("dialing {url}: {e}")))?;
        let link = Link::establish(
            stream,
            Some(peer_addr),
            self.handshake_config(true),
            self.clone(),
        )
        .await?;
        self.write()
            .url_peers
            .insert(url.to_string(), link.remote_ip());
        Ok(link)
    }

    /// Bind a listener and accept peerings until cancelled. Returns the
    /// bound transport address.
    pub async fn listen<T: Transport>(
        self: &Arc<Self>,
        transport: &T,
        url: &PeeringUrl,
    ) -> Result<std::net::SocketAddr> {
        let mut acceptor = transport
            .listen(url)
            .await
            .map_err(|e| PeeringError::NetworkReadError(format!("listening on {url}: {e}")))?;
        let local_addr = acceptor
            .local_addr()
            .map_err(|e| PeeringError::NetworkReadError(e.to_string()))?;
        let cancel = CancellationToken::new();
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.to_string(), cancel.clone());
        tracing::info!(%url, %local_addr, "listening for peerings");

        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    () = cancel.cancelled() => break,
                    accepted = acceptor.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            let config = manager.handshake_config(false);
                            if let Err(err) =
                                Link::establish(stream, Some(peer_addr), config, manager.clone()).await
                            {
                                tracing::debug!(%peer_addr, %err, "inbound peering failed");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                        break;
                    }
                }
            }
        });
        Ok(local_addr)
    }

    /// Stop all listeners.
    pub fn close_listeners(&self) {
        for cancel in self
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .values()
        {
            cancel.cancel();
        }
    }

    /// The connect loop: dial configured peers, auto-connect to nearby
    /// routers, and fall back to bootstrap when isolated. Runs every
    /// second until links exist, then backs off to one minute; losing the
    /// last link wakes it immediately.
    pub async fn run_connect_loop<T: Transport>(
        self: Arc<Self>,
        transport: T,
        cancel: CancellationToken,
    ) {
        loop {
            let interval = if self.link_count() == 0 {
                CONNECT_INTERVAL_FAST
            } else {
                CONNECT_INTERVAL_SLOW
            };
            tokio::select! {
                () = cancel.cancelled() => return,
                () = self.wake_connect.notified() => {}
                () = tokio::time::sleep(interval) => {}
            }

            self.connect_round(&transport).await;
        }
    }

    async fn connect_round<T: Transport>(self: &Arc<Self>, transport: &T) {
        // (a) Configured peers.
        for url in self.config.connect.clone() {
            let connected = {
                let registry = self.read();
                registry
                    .url_peers
                    .get(&url.to_string())
                    .is_some_and(|ip| registry.by_address.contains_key(ip))
            };
            if connected {
                continue;
            }
            if let Err(err) = self.connect_url(transport, &url).await {
                tracing::debug!(%url, %err, "configured peer unreachable");
            }
        }

        // (b) Auto-connect to the nearest known routers.
        if self.config.auto_connect && self.link_count() < self.config.min_auto_connect {
            let candidates = self.store.nearest_dialable(
                self.local.ip(),
                &self.config.universe,
                self.config.min_auto_connect,
            );
            for candidate in candidates {
                if self.link_count() >= self.config.min_auto_connect {
                    break;
                }
                if self.is_connected(candidate.address) {
                    continue;
                }
                let Some(info) = candidate.public_info else { continue };
                self.try_router(transport, candidate.address, &info).await;
            }
        }

        // (c) Bootstrap when fully isolated.
        if self.link_count() == 0 {
            for url in self.config.bootstrap.clone() {
                match self.connect_url(transport, &url).await {
                    Ok(_) => break,
                    Err(err) => tracing::debug!(%url, %err, "bootstrap peer unreachable"),
                }
            }
        }
    }

    /// Try every (listener x IANA host) combination of one stored router.
    async fn try_router<T: Transport>(
        self: &Arc<Self>,
        transport: &T,
        address: Ipv6Addr,
        info: &mycoria_store::RouterInfo,
    ) {
        // Skip routers already connected under one of their hostnames.
        {
            let registry = self.read();
            if info.iana.iter().any(|host| {
                registry
                    .url_peers
                    .keys()
                    .any(|url| url.contains(host.as_str()))
            }) {
                return;
            }
        }

        for listener in &info.listeners {
            let Ok(base) = PeeringUrl::parse(listener) else { continue };
            if !transport.schemes().contains(&base.scheme.as_str()) {
                continue;
            }
            for host in &info.iana {
                let url = base.with_host(host);
                match self.connect_url(transport, &url).await {
                    Ok(link) => {
                        tracing::debug!(peer = %link.remote_ip(), %url, "auto-connected");
                        return;
                    }
                    Err(err) => {
                        tracing::trace!(%address, %url, %err, "auto-connect attempt failed");
                    }
                }
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycoria_router::build_routable_prefixes;

    fn test_manager() -> (Arc<LinkManager>, mpsc::Receiver<(Arc<Link>, Frame)>) {
        let local = Arc::new(PrivateIdentity::from_parts(&[7u8; 32], 0));
        let sessions = Arc::new(SessionManager::new(local.clone()));
        let table = Arc::new(RoutingTable::new(build_routable_prefixes(local.ip())));
        let dir = std::env::temp_dir().join(format!("mycoria-test-{}", std::process::id()));
        let store = Arc::new(Store::open(dir.join("state.json")).expect("store"));
        let config = ManagerConfig {
            router_version: "0.1.0".into(),
            universe: "main".into(),
            universe_secret: String::new(),
            lite: false,
            tun_mtu: 9000,
            auto_connect: true,
            min_auto_connect: 2,
            connect: Vec::new(),
            bootstrap: Vec::new(),
            listen: Vec::new(),
        };
        LinkManager::new(local, config, sessions, table, store)
    }

    #[test]
    fn test_manager_config_from_config() {
        let raw = "\
router:
  connect:
    - tcp://192.0.2.1:47369
  bootstrap:
    - tcp://192.0.2.2:47369
  listen:
    - tcp:47369
";
        let config = mycoria_config::Config::parse(raw).expect("config");
        let manager_config = ManagerConfig::from_config(&config).expect("manager config");
        assert_eq!(manager_config.connect.len(), 1);
        assert_eq!(manager_config.bootstrap.len(), 1);
        assert_eq!(manager_config.listen[0].port, 47369);
        assert!(manager_config.auto_connect);
    }

    #[test]
    fn test_isolate_disables_auto_connect() {
        let config = mycoria_config::Config::parse("router:\n  isolate: true\n").expect("config");
        let manager_config = ManagerConfig::from_config(&config).expect("manager config");
        assert!(!manager_config.auto_connect);
    }

    #[test]
    fn test_handshake_config() {
        let (manager, _rx) = test_manager();
        let hs = manager.handshake_config(true);
        assert!(hs.client);
        assert_eq!(hs.universe, "main");
        assert_eq!(hs.tun_mtu, 9000);
    }

    #[test]
    fn test_empty_registries() {
        let (manager, _rx) = test_manager();
        assert_eq!(manager.link_count(), 0);
        assert!(!manager.is_connected(manager.local().ip()));
        assert!(manager
            .link_by_label(SwitchLabel::new(5).expect("label"))
            .is_none());
    }
}
