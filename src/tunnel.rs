use crate::config::DEFAULT_TUNNEL_BUFFER_SIZE;
use crate::error::ProxyError;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Duration, Instant, sleep_until};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Relaying,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    pub state: TunnelState,
    pub client_to_origin: u64,
    pub origin_to_client: u64,
}

/// Relays raw bytes between a CONNECT client and its origin.
///
/// Each direction is forwarded unmodified and in order. Client end-of-stream
/// is propagated to the origin as a write shutdown and the relay keeps
/// draining the origin; origin end-of-stream closes the tunnel. Any I/O error
/// or an idle timeout aborts it. Both streams are shut down before `relay`
/// returns, whichever way the loop ended.
#[derive(Debug, Clone)]
pub struct TunnelRelay {
    buffer_size: usize,
    idle_timeout: Option<Duration>,
}

impl Default for TunnelRelay {
    fn default() -> Self {
        Self::new(DEFAULT_TUNNEL_BUFFER_SIZE, None)
    }
}

impl TunnelRelay {
    pub fn new(buffer_size: usize, idle_timeout: Option<Duration>) -> Self {
        Self {
            buffer_size,
            idle_timeout,
        }
    }

    pub async fn relay<C, O>(&self, client: C, origin: O) -> Result<TunnelStats, ProxyError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        O: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut origin_read, mut origin_write) = tokio::io::split(origin);

        let mut stats = TunnelStats {
            state: TunnelState::Relaying,
            client_to_origin: 0,
            origin_to_client: 0,
        };

        let result = self
            .pump(
                &mut client_read,
                &mut client_write,
                &mut origin_read,
                &mut origin_write,
                &mut stats,
            )
            .await;

        // Shut both sides down on every exit path; errors here only mean the
        // peer is already gone.
        let _ = origin_write.shutdown().await;
        let _ = client_write.shutdown().await;
        stats.state = TunnelState::Closed;

        result.map(|_| stats)
    }

    async fn pump<CR, CW, OR, OW>(
        &self,
        client_read: &mut CR,
        client_write: &mut CW,
        origin_read: &mut OR,
        origin_write: &mut OW,
        stats: &mut TunnelStats,
    ) -> Result<(), ProxyError>
    where
        CR: AsyncRead + Unpin,
        CW: AsyncWrite + Unpin,
        OR: AsyncRead + Unpin,
        OW: AsyncWrite + Unpin,
    {
        let mut client_buf = vec![0u8; self.buffer_size];
        let mut origin_buf = vec![0u8; self.buffer_size];
        let mut client_open = true;
        let mut deadline = self.next_deadline();

        while stats.state == TunnelState::Relaying {
            tokio::select! {
                read = client_read.read(&mut client_buf), if client_open => {
                    let n = read?;
                    if n == 0 {
                        debug!("Tunnel client finished sending after {} bytes", stats.client_to_origin);
                        origin_write.shutdown().await?;
                        client_open = false;
                    } else {
                        origin_write.write_all(&client_buf[..n]).await?;
                        origin_write.flush().await?;
                        stats.client_to_origin += n as u64;
                    }
                }
                read = origin_read.read(&mut origin_buf) => {
                    let n = read?;
                    if n == 0 {
                        debug!("Tunnel origin finished sending after {} bytes", stats.origin_to_client);
                        stats.state = TunnelState::Closed;
                    } else {
                        client_write.write_all(&origin_buf[..n]).await?;
                        client_write.flush().await?;
                        stats.origin_to_client += n as u64;
                    }
                }
                _ = idle(deadline) => {
                    return Err(ProxyError::Timeout(format!(
                        "tunnel idle for longer than {:?}",
                        self.idle_timeout.unwrap_or_default()
                    )));
                }
            }
            deadline = self.next_deadline();
        }

        Ok(())
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.idle_timeout.map(|limit| Instant::now() + limit)
    }
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
