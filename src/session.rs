use crate::address::{Scheme, parse_target};
use crate::common::{ProxyBody, ResponseBuilder};
use crate::connector::OriginConnector;
use crate::fetcher::CacheAwareFetcher;
use crate::logging::AuditLog;
use crate::tunnel::TunnelRelay;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub id: u64,
    pub address: String,
}

/// Everything a session needs that outlives it.
pub struct SessionContext {
    pub fetcher: CacheAwareFetcher,
    pub connector: Arc<OriginConnector>,
    pub relay: TunnelRelay,
    pub audit: AuditLog,
}

// A CONNECT that was acknowledged and is waiting for hyper to hand back the
// raw client connection.
struct PendingTunnel {
    target: String,
    origin: TcpStream,
    upgrade: OnUpgrade,
}

type TunnelSlot = Arc<Mutex<Option<oneshot::Sender<PendingTunnel>>>>;

/// One accepted client connection, serving exactly one request.
pub struct ClientSession {
    identity: ClientIdentity,
    peer: SocketAddr,
    stream: TcpStream,
    context: Arc<SessionContext>,
}

impl ClientSession {
    pub fn new(identity: ClientIdentity, peer: SocketAddr, stream: TcpStream, context: Arc<SessionContext>) -> Self {
        Self {
            identity,
            peer,
            stream,
            context,
        }
    }

    pub async fn run(self) {
        let ClientSession {
            identity,
            peer,
            stream,
            context,
        } = self;

        info!("Client {} connected from {}", identity.id, peer);
        context.audit.client_connected(&identity);

        let (tunnel_tx, tunnel_rx) = oneshot::channel();
        let slot: TunnelSlot = Arc::new(Mutex::new(Some(tunnel_tx)));

        let service = {
            let identity = identity.clone();
            let context = context.clone();
            service_fn(move |req| {
                let identity = identity.clone();
                let context = context.clone();
                let slot = slot.clone();
                async move { Ok::<_, Infallible>(route(req, &identity, &context, &slot).await) }
            })
        };

        if let Err(e) = ServerBuilder::new()
            .keep_alive(false)
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            debug!("Client {} connection ended: {}", identity.id, e);
        }

        let mut tunnel_rx = tunnel_rx;
        if let Ok(pending) = tunnel_rx.try_recv() {
            run_tunnel(pending, &identity, &context).await;
        }
        debug!("Client {} session finished", identity.id);
    }
}

async fn route(
    req: Request<Incoming>,
    identity: &ClientIdentity,
    context: &SessionContext,
    slot: &TunnelSlot,
) -> Response<ProxyBody> {
    let request_line = format!("{} {} {:?}", req.method(), req.uri(), req.version());

    let method = req.method().clone();
    match method {
        Method::CONNECT => {
            context.audit.request(identity, &request_line);
            open_tunnel(req, identity, context, slot).await
        }
        Method::GET => {
            context.audit.request(identity, &request_line);
            let (parts, body) = req.into_parts();
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    warn!("Client {} request body unreadable: {}", identity.id, e);
                    Bytes::new()
                }
            };
            match context.fetcher.fetch(Request::from_parts(parts, body)).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Client {} GET {} failed: {}", identity.id, request_line, e);
                    ResponseBuilder::proxy_error(&e)
                }
            }
        }
        _ => {
            debug!("Client {} sent unsupported method {}", identity.id, method);
            ResponseBuilder::bad_request("Unsupported request method")
        }
    }
}

async fn open_tunnel(
    mut req: Request<Incoming>,
    identity: &ClientIdentity,
    context: &SessionContext,
    slot: &TunnelSlot,
) -> Response<ProxyBody> {
    let target = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_else(|| req.uri().to_string());

    let origin = match parse_target(&target, Scheme::Connect) {
        Ok(origin) => origin,
        Err(e) => return ResponseBuilder::proxy_error(&e),
    };

    let stream = match context.connector.connect(&origin).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Client {} CONNECT {} failed: {}", identity.id, origin, e);
            return ResponseBuilder::proxy_error(&e);
        }
    };

    let pending = PendingTunnel {
        target: origin.to_string(),
        origin: stream,
        upgrade: hyper::upgrade::on(&mut req),
    };
    if hand_off(slot, pending) {
        ResponseBuilder::connection_established()
    } else {
        error!("Client {} tunnel to {} could not be handed off", identity.id, target);
        ResponseBuilder::error(hyper::StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
    }
}

// Passes `value` to the session task. Only the first hand-off on a
// connection succeeds.
fn hand_off<T>(slot: &Mutex<Option<oneshot::Sender<T>>>, value: T) -> bool {
    let sender = slot.lock().ok().and_then(|mut slot| slot.take());
    match sender {
        Some(sender) => sender.send(value).is_ok(),
        None => false,
    }
}

async fn run_tunnel(pending: PendingTunnel, identity: &ClientIdentity, context: &SessionContext) {
    let upgraded = match pending.upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!("Client {} tunnel to {} never upgraded: {}", identity.id, pending.target, e);
            return;
        }
    };

    debug!("Client {} tunnel to {} established", identity.id, pending.target);
    match context.relay.relay(TokioIo::new(upgraded), pending.origin).await {
        Ok(stats) => {
            info!(
                "Client {} tunnel to {} closed ({} bytes up, {} bytes down)",
                identity.id, pending.target, stats.client_to_origin, stats.origin_to_client
            );
            context.audit.tunnel_closed(identity);
        }
        Err(e) => {
            error!("Client {} tunnel to {} aborted: {}", identity.id, pending.target, e);
        }
    }
}
