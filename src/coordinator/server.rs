//! Coordinator server: accepts client connections, one session task each

use crate::common::{Backoff, Error, NodeRole, NodeSettings, ReplicationMode, Result};
use crate::coordinator::replication_client::ReplicationClient;
use crate::coordinator::replication_log::ReplicationLog;
use crate::coordinator::replicator::start_replicator;
use crate::coordinator::session::{ConnectionSession, Replication, SessionContext};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub struct Coordinator {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    limiter: Option<Arc<Semaphore>>,
    replicator: Option<JoinHandle<()>>,
}

impl Coordinator {
    /// Set up replication and bind the client listener
    pub async fn bind(settings: NodeSettings) -> Result<Self> {
        let settings = Arc::new(settings);

        tracing::info!("Starting coordinator as {} node", settings.role);
        tracing::info!("  Storage engine: {}", settings.engine.socket_path.display());

        let (replication, replicator) = match (settings.role, settings.replication_target()) {
            (NodeRole::Primary, Some(peer)) => {
                let client = ReplicationClient::new(&settings.replication);
                match settings.replication.mode {
                    ReplicationMode::Sync => (
                        Replication::Sync {
                            client,
                            peer: peer.to_string(),
                        },
                        None,
                    ),
                    ReplicationMode::Async => {
                        let log = ReplicationLog::open(
                            &settings.replication.log_path,
                            settings.replication.sync_policy,
                        )?;
                        let backoff = Backoff::new(
                            Duration::from_millis(settings.replication.initial_backoff_ms),
                            Duration::from_millis(settings.replication.max_backoff_ms),
                        );
                        let (handle, task) = start_replicator(log, client, peer.to_string(), backoff);
                        (Replication::Async(handle), Some(task))
                    }
                }
            }
            (NodeRole::Primary, None) => {
                return Err(Error::InvalidConfig(
                    "PRIMARY node requires a secondary address".into(),
                ))
            }
            (NodeRole::Secondary, _) => {
                tracing::info!("  Trusted primary: {:?}", settings.trusted_primary_ips());
                (Replication::Disabled, None)
            }
        };

        if let (Some(mode), Some(peer)) = (replication.mode(), settings.replication_target()) {
            tracing::info!("  Replicating to {} ({:?})", peer, mode);
        }
        if settings.replication.shared_secret.is_some() {
            tracing::info!("  Shared-secret authentication enabled");
        }

        let listener = TcpListener::bind(settings.listen_addr).await?;
        let limiter = settings
            .limits
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max)));

        Ok(Self {
            listener,
            ctx: Arc::new(SessionContext::new(settings, replication)),
            limiter,
            replicator,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until Ctrl-C
    pub async fn serve(self) -> Result<()> {
        self.serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve until `shutdown` completes. Running sessions are left to finish.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tracing::info!("✓ Coordinator listening on {}", self.local_addr()?);

        loop {
            let permit = match &self.limiter {
                Some(limiter) => tokio::select! {
                    permit = limiter.clone().acquire_owned() => Some(
                        permit.map_err(|_| Error::Internal("connection limiter closed".into()))?,
                    ),
                    _ = &mut shutdown => break,
                },
                None => None,
            };

            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        let session = ConnectionSession::new(self.ctx.clone(), stream, addr);
                        tokio::spawn(async move {
                            session.run().await;
                            drop(permit);
                        });
                    }
                    Err(e) => tracing::error!("Error accepting TCP connection: {}", e),
                },
                _ = &mut shutdown => break,
            }
        }

        tracing::info!("Coordinator shutting down");
        if let Some(task) = self.replicator {
            task.abort();
        }
        Ok(())
    }
}
