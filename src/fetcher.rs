use crate::address::{OriginAddress, Scheme, parse_target};
use crate::cache::{CacheEntry, CacheKey, CacheStore, Freshness};
use crate::common::{ProxyBody, strip_hop_by_hop};
use crate::connector::OriginConnector;
use crate::error::ProxyError;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::header::{CONNECTION, HOST, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use log::{debug, info};
use std::sync::Arc;

/// A complete origin response, read into memory.
#[derive(Debug)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OriginResponse {
    fn into_response(self) -> Response<ProxyBody> {
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Serves GET requests through the shared [`CacheStore`].
pub struct CacheAwareFetcher {
    store: Arc<CacheStore>,
    connector: Arc<OriginConnector>,
}

impl CacheAwareFetcher {
    pub fn new(store: Arc<CacheStore>, connector: Arc<OriginConnector>) -> Self {
        Self { store, connector }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub async fn fetch(&self, req: Request<Bytes>) -> Result<Response<ProxyBody>, ProxyError> {
        let origin = request_origin(&req)?;
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let key = CacheKey::new(&origin.host, origin.port, path_and_query);

        if let Some(entry) = self.fresh_entry(&key).await {
            debug!("Cache hit for {}", key);
            self.store.record_hit();
            return Ok(entry.to_response());
        }

        let _flight = self.store.begin_flight(&key).await;

        // Whoever held the flight before us may have refreshed the entry.
        let cached = self.store.get(&key).await;
        if let Some(entry) = &cached {
            if entry.freshness(Utc::now()).is_fresh() {
                debug!("Cache hit for {} after waiting on another fetch", key);
                self.store.record_hit();
                return Ok(entry.to_response());
            }
        }

        match cached {
            None => {
                info!("Cache miss for {}, fetching from {}", key, origin);
                self.store.record_miss();
                let response = self.forward(&origin, &req, None).await?;
                if response.status == StatusCode::OK {
                    let entry = CacheEntry::new(
                        response.status,
                        response.headers.clone(),
                        response.body.clone(),
                        Utc::now(),
                    );
                    self.store.insert(key, entry).await;
                }
                Ok(response.into_response())
            }
            Some(entry) => self.revalidate(&origin, &req, key, &entry).await,
        }
    }

    async fn fresh_entry(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let entry = self.store.get(key).await?;
        match entry.freshness(Utc::now()) {
            Freshness::Fresh => Some(entry),
            Freshness::Stale(reason) => {
                debug!("Cached {} is stale: {:?}", key, reason);
                None
            }
        }
    }

    async fn revalidate(
        &self,
        origin: &OriginAddress,
        req: &Request<Bytes>,
        key: CacheKey,
        entry: &CacheEntry,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        info!("Revalidating {} with {}", key, origin);
        self.store.record_revalidation();

        let response = self.forward(origin, req, Some(entry.conditional_headers())).await?;
        match response.status {
            StatusCode::NOT_MODIFIED => {
                debug!("{} not modified, serving stored body", key);
                let refreshed = entry.revalidated(&response.headers, Utc::now());
                let reply = refreshed.to_response();
                self.store.insert(key, refreshed).await;
                Ok(reply)
            }
            StatusCode::OK => {
                debug!("{} changed at origin, replacing entry", key);
                let replacement = CacheEntry::new(
                    response.status,
                    response.headers.clone(),
                    response.body.clone(),
                    Utc::now(),
                );
                self.store.insert(key, replacement).await;
                Ok(response.into_response())
            }
            status => {
                debug!("Revalidation of {} returned {}, cache untouched", key, status);
                Ok(response.into_response())
            }
        }
    }

    /// Send `req` to `origin` over a fresh connection and read the whole
    /// response. `validators` turns it into a revalidation of a stored entry.
    async fn forward(
        &self,
        origin: &OriginAddress,
        req: &Request<Bytes>,
        validators: Option<HeaderMap>,
    ) -> Result<OriginResponse, ProxyError> {
        let stream = self.connector.connect(origin).await?;
        let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;

        let target = origin.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Origin connection to {} ended: {}", target, e);
            }
        });

        let outbound = origin_request(origin, req, validators)?;
        let response = sender.send_request(outbound).await?;

        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);

        Ok(OriginResponse {
            status: parts.status,
            headers,
            body,
        })
    }
}

/// Host and port the request is aimed at: the `Host` header, or the
/// authority of an absolute-form target.
pub fn request_origin<B>(req: &Request<B>) -> Result<OriginAddress, ProxyError> {
    let host_header = req.headers().get(HOST).and_then(|v| v.to_str().ok());
    let authority = req.uri().authority().map(|a| a.as_str());

    let target = host_header
        .or(authority)
        .ok_or_else(|| ProxyError::InvalidTarget(format!("no Host header or authority in '{}'", req.uri())))?;
    parse_target(target, Scheme::Get)
}

fn origin_request(
    origin: &OriginAddress,
    req: &Request<Bytes>,
    validators: Option<HeaderMap>,
) -> Result<Request<Full<Bytes>>, ProxyError> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = path_and_query
        .parse()
        .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", path_and_query, e)))?;

    let mut headers = req.headers().clone();
    strip_hop_by_hop(&mut headers);
    if !headers.contains_key(HOST) {
        let host = if origin.port == 80 {
            origin.host.clone()
        } else {
            origin.to_string()
        };
        let value = HeaderValue::from_str(&host)
            .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", host, e)))?;
        headers.insert(HOST, value);
    }
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    if let Some(validators) = validators {
        // The origin must answer about the stored entry, not whatever the
        // client has cached itself.
        headers.remove(IF_NONE_MATCH);
        headers.remove(IF_MODIFIED_SINCE);
        headers.extend(validators);
    }

    let mut outbound = Request::new(Full::new(req.body().clone()));
    *outbound.method_mut() = Method::GET;
    *outbound.uri_mut() = uri;
    *outbound.version_mut() = Version::HTTP_11;
    *outbound.headers_mut() = headers;
    Ok(outbound)
}
