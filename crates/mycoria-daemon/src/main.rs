//! mycoriad: the Mycoria router daemon.
//!
//! Single OS process on a Tokio runtime. Wires the address plane, routing
//! table, session manager and link manager together, then keeps the router
//! attached to the overlay until shutdown. Exits 0 on a clean stop and 1
//! on configuration or startup failure.

mod forwarder;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mycoria_addr::generate::{generate, GenerateConfig};
use mycoria_config::{AddressConfig, Config};
use mycoria_peering::manager::ManagerConfig;
use mycoria_peering::transport::TcpTransport;
use mycoria_peering::LinkManager;
use mycoria_router::{build_routable_prefixes, RoutingTable};
use mycoria_session::SessionManager;
use mycoria_store::Store;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Housekeeping interval: session cleanup, table cleaning, store flushing.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Stored routers unused for this long are pruned.
const STORE_MAX_IDLE_SECS: u64 = 30 * 24 * 60 * 60;

/// Repeated INT/TERM signals during shutdown force an exit.
const FORCE_EXIT_SIGNALS: u32 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mycoria=info".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yml"));

    info!(path = %config_path.display(), "mycoria router starting");
    let mut config = if config_path.exists() {
        Config::load(&config_path)?
    } else {
        Config::default()
    };

    // Load the identity, generating one on first start.
    let identity = match &config.router.address {
        Some(address) => Arc::new(address.to_identity()?),
        None => {
            info!("no identity configured, generating one");
            let identity = Arc::new(generate(&GenerateConfig {
                workers: std::thread::available_parallelism()
                    .map(std::num::NonZeroUsize::get)
                    .unwrap_or(1),
                ..GenerateConfig::default()
            })?);
            config.router.address = Some(AddressConfig::from_identity(&identity));
            if let Err(err) = std::fs::write(&config_path, config.to_yaml()?) {
                warn!(%err, "could not persist the new identity");
            }
            identity
        }
    };
    info!(address = %identity.ip(), "router identity ready");

    let store = Arc::new(Store::open(PathBuf::from(&config.system.state_path))?);
    let sessions = Arc::new(SessionManager::new(identity.clone()));
    let table = Arc::new(RoutingTable::new(build_routable_prefixes(identity.ip())));
    let manager_config = ManagerConfig::from_config(&config)?;
    let listen_urls = manager_config.listen.clone();
    let (manager, inbound) = LinkManager::new(
        identity.clone(),
        manager_config,
        sessions.clone(),
        table.clone(),
        store.clone(),
    );

    let cancel = CancellationToken::new();

    // Listeners: a busy port at startup is a configuration problem.
    let transport = TcpTransport;
    for url in &listen_urls {
        if let Err(err) = manager.listen(&transport, url).await {
            anyhow::bail!("cannot listen on {url}: {err}");
        }
    }

    // Connect loop.
    tokio::spawn(
        manager
            .clone()
            .run_connect_loop(TcpTransport, cancel.child_token()),
    );

    // Router core: forward or deliver inbound frames.
    tokio::spawn(forwarder::run(
        manager.clone(),
        inbound,
        cancel.child_token(),
    ));

    // Housekeeping.
    {
        let sessions = sessions.clone();
        let table = table.clone();
        let store = store.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(MAINTENANCE_INTERVAL) => {}
                }
                sessions.kill_expired();
                table.clean();
                store.prune(STORE_MAX_IDLE_SECS);
                if let Err(err) = store.save() {
                    // Retried at the next interval.
                    warn!(%err, "state save failed");
                }
            }
        });
    }

    wait_for_shutdown(&manager).await;

    info!("shutting down");
    cancel.cancel();
    manager.close_listeners();
    for link in manager.links() {
        link.close();
    }
    if let Err(err) = store.save() {
        warn!(%err, "final state save failed");
    }
    info!("router stopped");
    Ok(())
}

/// Block until INT or TERM; USR1 logs a status dump. Once shutdown begins,
/// a watcher keeps counting signals and forces the process out after five.
async fn wait_for_shutdown(manager: &Arc<LinkManager>) {
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(mut interrupt) = signal(SignalKind::interrupt()) else {
        error!("cannot install signal handler");
        return;
    };
    let Ok(mut terminate) = signal(SignalKind::terminate()) else {
        error!("cannot install signal handler");
        return;
    };
    let Ok(mut status) = signal(SignalKind::user_defined1()) else {
        error!("cannot install signal handler");
        return;
    };

    loop {
        tokio::select! {
            _ = interrupt.recv() => break,
            _ = terminate.recv() => break,
            _ = status.recv() => log_status(manager),
        }
    }

    // Shutdown has begun; impatient operators can force the exit.
    tokio::spawn(async move {
        let mut signals = 1u32;
        loop {
            tokio::select! {
                _ = interrupt.recv() => signals += 1,
                _ = terminate.recv() => signals += 1,
            }
            if signals >= FORCE_EXIT_SIGNALS {
                error!("forced exit");
                std::process::exit(1);
            }
        }
    });
}

fn log_status(manager: &Arc<LinkManager>) {
    info!(
        links = manager.link_count(),
        sessions = manager.sessions().len(),
        routes = manager.table().len(),
        stored_routers = manager.store().router_count(),
        "status"
    );
    for link in manager.links() {
        info!(
            peer = %link.remote_ip(),
            label = %link.label(),
            latency_ms = link.latency_ms(),
            bytes_in = link.bytes_in(),
            bytes_out = link.bytes_out(),
            client = link.is_client(),
            "link"
        );
    }
}
