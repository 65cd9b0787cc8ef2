//! rvmeshd: the rvmesh client daemon.
//!
//! Single OS process running a Tokio runtime. Front ends talk to it with
//! JSON-RPC over a Unix socket; inbound relay traffic is routed to the key
//! exchange, transfer, tip and group handlers.

mod commands;
mod config;
mod events;
mod groups;
mod maintenance;
mod router;
mod rpc;

use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rvmesh_crypto::identity::{LocalIdentity, StoredIdentity};
use rvmesh_db::queries::identity;
use rvmesh_kx::KxEngine;
use rvmesh_payments::PaymentPolicy;
use rvmesh_transfer::{ChunkStore, TransferEngine};
use rvmesh_transport::{wait_until_ready, Backoff, MemoryRelay, PaymentNetwork, SimLedger, SimPaymentNetwork};
use rvmesh_types::events::EventBus;
use rvmesh_types::{short_hex, unix_now};

use crate::config::DaemonConfig;
use crate::events::EventLog;
use crate::groups::GroupService;
use crate::rpc::RpcServer;

pub type Kx = KxEngine<MemoryRelay>;
pub type Payments = PaymentPolicy<SimPaymentNetwork>;
pub type Transfers = TransferEngine<Kx, SimPaymentNetwork>;

/// Daemon-wide shared state.
pub struct DaemonState {
    pub config: DaemonConfig,
    pub db: Arc<Mutex<Connection>>,
    pub events: EventBus,
    pub event_log: Arc<EventLog>,
    pub relay: Arc<MemoryRelay>,
    pub network: Arc<SimPaymentNetwork>,
    pub kx: Arc<Kx>,
    pub payments: Arc<Payments>,
    pub transfers: Arc<Transfers>,
    pub groups: GroupService<Kx>,
    /// Woken whenever the set of RVs to watch may have changed.
    pub rv_changed: Notify,
    pub shutdown: CancellationToken,
}

impl DaemonState {
    /// Wire the components over an opened database, creating the local
    /// identity on first start.
    pub fn open(
        config: DaemonConfig,
        conn: Connection,
        relay: Arc<MemoryRelay>,
        ledger: &SimLedger,
    ) -> anyhow::Result<Arc<Self>> {
        let local = match identity::load::<StoredIdentity>(&conn)? {
            Some(stored) => LocalIdentity::from_stored(&stored),
            None => {
                let fresh = LocalIdentity::generate(config.identity.nick.clone());
                identity::save(&conn, &fresh.to_stored(), unix_now())?;
                info!(id = %short_hex(&fresh.id()), nick = fresh.nick(), "generated new identity");
                fresh
            }
        };
        let me = local.id();

        let db = Arc::new(Mutex::new(conn));
        let events = EventBus::new(1000);
        let network = Arc::new(ledger.node(me));
        let kx = Arc::new(KxEngine::new(db.clone(), local, relay.clone(), events.clone()));
        let payments = Arc::new(PaymentPolicy::new(
            db.clone(),
            network.clone(),
            events.clone(),
            config.payments.max_attempts,
        ));
        let transfers = Arc::new(TransferEngine::new(
            db.clone(),
            kx.clone(),
            payments.clone(),
            events.clone(),
            ChunkStore::new(config.downloads_dir()),
        ));
        let groups = GroupService::new(db.clone(), kx.clone(), events.clone(), me);

        Ok(Arc::new(Self {
            config,
            db,
            events,
            event_log: Arc::new(EventLog::new()),
            relay,
            network,
            kx,
            payments,
            transfers,
            groups,
            rv_changed: Notify::new(),
            shutdown: CancellationToken::new(),
        }))
    }
}

fn init_tracing(config: &DaemonConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(config.log_directive().parse()?);
    if config.advanced.log_file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.advanced.log_file)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load config and start logging
    let config = DaemonConfig::load()?;
    init_tracing(&config)?;
    info!("rvmesh daemon starting");

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    std::fs::create_dir_all(config.downloads_dir())?;

    // 2. Open database
    let conn = rvmesh_db::open(&data_dir.join("rvmesh.db"))?;

    // 3. Build daemon state over the in-process relay and ledger
    let relay = Arc::new(MemoryRelay::new());
    let ledger = SimLedger::new();
    let state = DaemonState::open(config, conn, relay, &ledger)?;

    // 4. Wait for a usable wallet
    let (initial, max) = state.config.payments.wallet_backoff();
    let mut backoff = Backoff::new(initial, max);
    let network = state.network.clone();
    let ready = wait_until_ready(
        || {
            let network = network.clone();
            async move { network.wallet_ready().await }
        },
        &mut backoff,
        &state.shutdown,
    );
    tokio::select! {
        r = ready => r?,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received before wallet was ready");
            return Ok(());
        }
    }

    // 5. Republish anything left in the outbox
    match state.kx.resend_pending().await {
        Ok(0) => {}
        Ok(n) => info!(count = n, "resent pending relay messages"),
        Err(e) if e.is_fatal() => return Err(e.into()),
        Err(e) => warn!(error = %e, "outbox resend failed"),
    }

    // 6. Background tasks
    let mut router = tokio::spawn(router::run(state.clone()));
    let mut maintenance = tokio::spawn(maintenance::run(state.clone()));
    tokio::spawn(events::log_events(
        state.events.clone(),
        state.event_log.clone(),
        state.shutdown.clone(),
    ));

    // 7. Start IPC server
    let socket_path = state.config.data_dir().join("rvmesh.sock");
    let rpc_server = RpcServer::new(state.clone(), socket_path.clone());
    info!(socket = %socket_path.display(), me = %short_hex(&state.kx.identity().id()), "daemon ready");

    let outcome = tokio::select! {
        result = rpc_server.run() => result,
        result = &mut router => flatten("router", result),
        result = &mut maintenance => flatten("maintenance", result),
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
            Ok(())
        }
    };

    // Graceful shutdown
    state.shutdown.cancel();
    let _ = std::fs::remove_file(&socket_path);
    match &outcome {
        Ok(()) => info!("daemon stopped"),
        Err(e) => error!(error = %e, "daemon stopped on fatal error"),
    }
    outcome
}

fn flatten(
    task: &str,
    joined: std::result::Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(anyhow::anyhow!("{task} task failed: {e}")),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// In-memory daemon state sharing `relay` and `ledger` with other nodes.
    pub(crate) fn state(
        relay: &Arc<MemoryRelay>,
        ledger: &SimLedger,
        nick: &str,
        downloads: &std::path::Path,
    ) -> Arc<DaemonState> {
        let mut config = DaemonConfig::default();
        config.identity.nick = nick.to_string();
        config.storage.downloads_dir = downloads.to_string_lossy().to_string();
        let conn = rvmesh_db::open_memory().expect("open db");
        DaemonState::open(config, conn, relay.clone(), ledger).expect("state")
    }
}
