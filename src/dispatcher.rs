use crate::config::Config;
use crate::error::ProxyError;
use crate::session::{ClientIdentity, ClientSession, SessionContext};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Hands out stable ids per client IP address. The first address seen gets
/// id 0; an address seen again keeps its id for the life of the process.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    ids: Mutex<HashMap<String, u64>>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identify(&self, address: &str) -> ClientIdentity {
        // A poisoned map still holds valid ids.
        let mut ids = self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = ids.len() as u64;
        let id = *ids.entry(address.to_string()).or_insert(next);
        ClientIdentity {
            id,
            address: address.to_string(),
        }
    }

    fn len(&self) -> usize {
        self.ids.lock().map(|ids| ids.len()).unwrap_or(0)
    }
}

/// Accepts client connections and runs one supervised session task per
/// connection.
pub struct ConnectionDispatcher {
    listener: TcpListener,
    registry: IdentityRegistry,
    context: Arc<SessionContext>,
    shutdown_grace: Duration,
}

impl ConnectionDispatcher {
    pub fn bind(config: &Config, context: Arc<SessionContext>) -> Result<Self, ProxyError> {
        let addr = config.listen_addr;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .map_err(|e| ProxyError::Config(format!("Failed to bind to {}: {}", addr, e)))?;
        let listener = socket
            .listen(config.backlog)
            .map_err(|e| ProxyError::Config(format!("Failed to listen on {}: {}", addr, e)))?;

        Ok(Self {
            listener,
            registry: IdentityRegistry::new(),
            context,
            shutdown_grace: config.shutdown_grace(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run_until(self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        info!("Caching proxy listening on {}", self.local_addr()?);

        let mut sessions = JoinSet::new();
        let mut accept_failures = 0u32;
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            accept_failures = 0;
                            let identity = self.registry.identify(&peer.ip().to_string());
                            debug!("Accepted {} as client {}", peer, identity.id);
                            let session = ClientSession::new(identity, peer, stream, self.context.clone());
                            sessions.spawn(session.run());
                        }
                        Err(e) => {
                            // EMFILE and friends persist until sessions finish;
                            // back off instead of spinning on them.
                            accept_failures = accept_failures.saturating_add(1);
                            let pause = accept_backoff(accept_failures);
                            warn!("Failed to accept connection: {} (retrying in {:?})", e, pause);
                            tokio::time::sleep(pause).await;
                        }
                    }
                }
                Some(finished) = sessions.join_next() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("Client session panicked: {}", e);
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }

        drain(sessions, self.shutdown_grace).await;
        info!("Served {} distinct client addresses", self.registry.len());
        Ok(())
    }
}

/// Pause after the `failures`-th consecutive accept error: doubles from
/// 10ms, capped at one second.
fn accept_backoff(failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_START
        .saturating_mul(1 << doublings)
        .min(ACCEPT_BACKOFF_MAX)
}

async fn drain(mut sessions: JoinSet<()>, grace: Duration) {
    if sessions.is_empty() {
        return;
    }
    info!("Waiting up to {:?} for {} active sessions", grace, sessions.len());

    let finished = tokio::time::timeout(grace, async {
        while let Some(result) = sessions.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("Client session panicked: {}", e);
                }
            }
        }
    })
    .await;

    if finished.is_err() {
        warn!("Aborting {} sessions still running after {:?}", sessions.len(), grace);
        sessions.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::connector::OriginConnector;
    use crate::fetcher::CacheAwareFetcher;
    use crate::logging::AuditLog;
    use crate::tunnel::TunnelRelay;

    fn context() -> Arc<SessionContext> {
        let connector = Arc::new(OriginConnector::new(Some(Duration::from_secs(1))));
        Arc::new(SessionContext {
            fetcher: CacheAwareFetcher::new(Arc::new(CacheStore::new()), connector.clone()),
            connector,
            relay: TunnelRelay::default(),
            audit: AuditLog::disabled(),
        })
    }

    #[test]
    fn test_identity_reused_per_address() {
        let registry = IdentityRegistry::new();
        let first = registry.identify("10.0.0.1");
        let second = registry.identify("10.0.0.2");
        let again = registry.identify("10.0.0.1");

        assert_eq!(first.id, 0);
        assert_eq!(second.id, 1);
        assert_eq!(again, first);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_identity_concurrent_first_sight() {
        let registry = Arc::new(IdentityRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.identify("192.168.1.50").id)
            })
            .collect();
        let ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ids.iter().all(|id| *id == 0));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_accept_backoff_grows_and_caps() {
        assert_eq!(accept_backoff(1), Duration::from_millis(10));
        assert_eq!(accept_backoff(2), Duration::from_millis(20));
        assert_eq!(accept_backoff(4), Duration::from_millis(80));
        assert_eq!(accept_backoff(8), Duration::from_secs(1));
        assert_eq!(accept_backoff(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_and_shutdown() {
        let config = Config {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..Config::default()
        };
        let dispatcher = ConnectionDispatcher::bind(&config, context()).unwrap();
        assert_ne!(dispatcher.local_addr().unwrap().port(), 0);

        let token = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.run_until(token.clone()));
        token.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let config = Config {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..Config::default()
        };
        let first = ConnectionDispatcher::bind(&config, context()).unwrap();
        let taken = Config {
            listen_addr: first.local_addr().unwrap(),
            ..Config::default()
        };
        // SO_REUSEADDR does not allow two listeners on one port.
        assert!(ConnectionDispatcher::bind(&taken, context()).is_err());
    }
}
