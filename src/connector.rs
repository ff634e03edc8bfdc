use crate::address::OriginAddress;
use crate::error::ProxyError;
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};

/// Name resolution seam for [`OriginConnector`].
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>>;
}

/// Resolves through the operating system (`getaddrinfo`).
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.collect())
    }
}

/// Fixed host table. Hosts not in the table fail to resolve.
#[derive(Default, Clone)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<SocketAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `host` to `addr`. The looked-up port replaces `addr`'s port only
    /// when `addr` carries port 0.
    pub fn with_host(mut self, host: &str, addr: SocketAddr) -> Self {
        self.hosts.entry(host.to_lowercase()).or_default().push(addr);
        self
    }
}

#[async_trait]
impl Resolve for StaticResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        match self.hosts.get(&host.to_lowercase()) {
            Some(addrs) => Ok(addrs
                .iter()
                .map(|addr| {
                    let mut addr = *addr;
                    if addr.port() == 0 {
                        addr.set_port(port);
                    }
                    addr
                })
                .collect()),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not in the host table", host),
            )),
        }
    }
}

/// Resolves an origin and opens a TCP connection to it. Each resolved
/// address is tried once, in order; retry policy belongs to callers.
pub struct OriginConnector {
    resolver: Arc<dyn Resolve>,
    connect_timeout: Option<Duration>,
}

impl OriginConnector {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self::with_resolver(Arc::new(SystemResolver), connect_timeout)
    }

    pub fn with_resolver(resolver: Arc<dyn Resolve>, connect_timeout: Option<Duration>) -> Self {
        Self {
            resolver,
            connect_timeout,
        }
    }

    pub async fn connect(&self, origin: &OriginAddress) -> Result<TcpStream, ProxyError> {
        let addrs = self
            .resolver
            .resolve(&origin.host, origin.port)
            .await
            .map_err(|e| ProxyError::Resolution {
                host: origin.host.clone(),
                reason: e.to_string(),
            })?;

        if addrs.is_empty() {
            return Err(ProxyError::Resolution {
                host: origin.host.clone(),
                reason: "no addresses returned".to_string(),
            });
        }

        let mut last_error = None;
        for addr in addrs {
            debug!("Connecting to {} ({})", origin, addr);
            let attempt = match self.connect_timeout {
                Some(limit) => match timeout(limit, TcpStream::connect(addr)).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(ProxyError::Timeout(format!(
                            "connecting to {} ({}) took longer than {:?}",
                            origin, addr, limit
                        )));
                    }
                },
                None => TcpStream::connect(addr).await,
            };

            match attempt {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("Connection to {} ({}) failed: {}", origin, addr, e);
                    last_error = Some((addr, e));
                }
            }
        }

        let (addr, source) = last_error.ok_or_else(|| {
            ProxyError::Connection(format!("no address attempted for {}", origin))
        })?;
        Err(ProxyError::Connect {
            addr: format!("{} ({})", origin, addr),
            source,
        })
    }
}
