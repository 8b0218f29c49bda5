use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::JoinHandle,
};
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::{
    config::ServerConfig,
    connection::{ConnectionSettings, serve_connection},
    hub::{ConnectionId, Hub},
    pool::WorkerPool,
    session::Coordinator,
    store::Store,
};

const SHUTDOWN_NOTICE: &str = "server shutting down";

pub struct Server {
    listener: TcpListener,
    hub: Hub,
    hub_task: JoinHandle<()>,
    pool: Arc<WorkerPool>,
    coordinator: Arc<Coordinator>,
    settings: ConnectionSettings,
    next_id: AtomicU64,
}

impl Server {
    /// Loads persisted state, binds the listener and starts the hub and workers.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let store = Store::open(&config.data_dir).with_context(|| {
            format!("failed to load data from {}", config.data_dir.display())
        })?;
        info!(
            accounts = store.account_count(),
            messages = store.message_count(),
            data_dir = %config.data_dir.display(),
            "store loaded"
        );
        let store = Arc::new(store);

        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;

        let (hub, hub_task) = Hub::spawn();
        let pool = Arc::new(WorkerPool::spawn(
            config.workers,
            config.job_queue_capacity,
            Arc::clone(&store),
        ));
        let coordinator = Arc::new(Coordinator::new(
            store,
            hub.clone(),
            Arc::clone(&pool),
            config.history_default,
        ));

        Ok(Self {
            listener,
            hub,
            hub_task,
            pool,
            coordinator,
            settings: config.connection_settings(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves, then winds everything
    /// down: connections are notified and closed, and queued messages are
    /// persisted before this returns.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            hub,
            hub_task,
            pool,
            coordinator,
            settings,
            next_id,
        } = self;
        let tracker = TaskTracker::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    handle_accept_result(accepted, id, &tracker, &coordinator, settings);
                }
            }
        }

        info!("server shutting down");
        drop(listener);
        coordinator.broadcast_system(SHUTDOWN_NOTICE);
        hub.shutdown();
        if let Err(err) = hub_task.await {
            warn!(error = ?err, "hub task failed");
        }

        tracker.close();
        tracker.wait().await;
        pool.shutdown().await;
        info!("server stopped");
        Ok(())
    }

    pub async fn run_until_shutdown_signal(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    id: ConnectionId,
    tracker: &TaskTracker,
    coordinator: &Arc<Coordinator>,
    settings: ConnectionSettings,
) {
    match result {
        Ok((stream, peer)) => {
            if let Err(err) = stream.set_nodelay(true) {
                warn!(conn = id, error = ?err, "failed to set TCP_NODELAY");
            }
            let coordinator = Arc::clone(coordinator);
            tracker.spawn(async move {
                serve_connection(stream, id, Some(peer), &coordinator, settings).await;
            });
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = ?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
