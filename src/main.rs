use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use tutorslot::config::Config;
use tutorslot::engine::ReservationEngine;
use tutorslot::notify::NotifyHub;
use tutorslot::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use tutorslot::store::{WalBookingStore, WalWindowStore};
use tutorslot::sweeper::{self, Compact};
use tutorslot::wire::{self, TutorSlotFactory};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let config = Config::from_env();
    tutorslot::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let windows = Arc::new(WalWindowStore::open(&config.windows_wal())?);
    let bookings = Arc::new(WalBookingStore::open(&config.bookings_wal())?);
    let engine = ReservationEngine::new(
        windows.clone(),
        bookings.clone(),
        Arc::new(NotifyHub::new()),
    );

    tokio::spawn(sweeper::run_reconciler(
        engine.clone(),
        config.reconcile_interval,
        config.reconcile_grace,
    ));
    let compactable: Vec<Arc<dyn Compact>> = vec![windows as Arc<dyn Compact>, bookings];
    tokio::spawn(sweeper::run_compactor(compactable, config.compact_threshold));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        %addr,
        data_dir = %config.data_dir.display(),
        max_connections = config.max_connections,
        reconcile_interval = ?config.reconcile_interval,
        reconcile_grace = ?config.reconcile_grace,
        metrics_port = ?config.metrics_port,
        "tutorslot ready"
    );

    let factory = Arc::new(TutorSlotFactory::new(engine, config.password.clone()));
    let slots = Arc::new(Semaphore::new(config.max_connections));
    serve(listener, factory, slots.clone(), shutdown_signal()?).await;
    drain(&slots, config.max_connections).await;

    info!("tutorslot stopped");
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on unix.
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    Ok(async move {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    })
}

/// Accept connections until `shutdown` resolves. Each connection holds one
/// permit of `slots` for its lifetime; sockets arriving with no permit left
/// are closed immediately.
async fn serve(
    listener: TcpListener,
    factory: Arc<TutorSlotFactory>,
    slots: Arc<Semaphore>,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = &mut shutdown => {
                info!("shutdown requested, no longer accepting");
                return;
            }
        };
        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };
        let Ok(permit) = slots.clone().try_acquire_owned() else {
            warn!(%peer, "at connection limit, closing");
            metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
            continue;
        };

        info!(%peer, "client connected");
        metrics::counter!(CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        let factory = factory.clone();
        tokio::spawn(async move {
            if let Err(e) = wire::process_connection(socket, factory).await {
                error!(%peer, "connection ended with error: {e}");
            }
            metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
            drop(permit);
        });
    }
}

/// Wait until every connection permit is back, or give up after
/// [`DRAIN_TIMEOUT`].
async fn drain(slots: &Semaphore, capacity: usize) {
    let open = capacity - slots.available_permits();
    if open == 0 {
        return;
    }
    info!(open, "waiting for open connections to finish");
    let Ok(permits) = u32::try_from(capacity) else {
        warn!(capacity, "connection limit too large to drain, not waiting");
        return;
    };
    // Taking every permit succeeds only once all connections have released theirs.
    match tokio::time::timeout(DRAIN_TIMEOUT, slots.acquire_many(permits)).await {
        Ok(_) => info!("all connections closed"),
        Err(_) => warn!(
            still_open = capacity - slots.available_permits(),
            "gave up waiting for connections"
        ),
    }
}
