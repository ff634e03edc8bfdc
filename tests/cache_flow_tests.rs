//! Integration tests for the GET path: cache misses, hits, revalidation and
//! single-flight fetching against a local mock origin.

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use http_body_util::{BodyExt, Full};
use http_cache_proxy::cache::{CacheEntry, CacheKey, CacheStore};
use http_cache_proxy::connector::{OriginConnector, StaticResolver};
use http_cache_proxy::fetcher::CacheAwareFetcher;
use hyper::body::Incoming;
use hyper::header::{CACHE_CONTROL, ETAG, HOST, IF_NONE_MATCH};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

const ORIGIN_HOST: &str = "origin.test";

type Handler = dyn Fn(&Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync;

struct MockOrigin {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    validators: Arc<Mutex<Vec<Option<String>>>>,
}

impl MockOrigin {
    fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn seen_validators(&self) -> Vec<Option<String>> {
        self.validators.lock().unwrap().clone()
    }
}

async fn spawn_origin(delay: Duration, handler: Arc<Handler>) -> MockOrigin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(AtomicUsize::new(0));
    let validators = Arc::new(Mutex::new(Vec::new()));

    let origin = MockOrigin {
        addr,
        requests: requests.clone(),
        validators: validators.clone(),
    };

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let handler = handler.clone();
            let requests = requests.clone();
            let validators = validators.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    let requests = requests.clone();
                    let validators = validators.clone();
                    async move {
                        requests.fetch_add(1, Ordering::SeqCst);
                        let validator = req
                            .headers()
                            .get(IF_NONE_MATCH)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        validators.lock().unwrap().push(validator);
                        let response = handler(&req);
                        tokio::time::sleep(delay).await;
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    origin
}

fn handler<F>(f: F) -> Arc<Handler>
where
    F: Fn(&Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn response(status: StatusCode, headers: &[(&str, &str)], body: &'static str) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Full::new(Bytes::from_static(body.as_bytes()))).unwrap()
}

fn fetcher_for(origin: &MockOrigin) -> CacheAwareFetcher {
    let resolver = StaticResolver::new().with_host(ORIGIN_HOST, origin.addr);
    let connector = OriginConnector::with_resolver(Arc::new(resolver), Some(Duration::from_secs(2)));
    CacheAwareFetcher::new(Arc::new(CacheStore::new()), Arc::new(connector))
}

fn get(path: &str) -> Request<Bytes> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(HOST, ORIGIN_HOST)
        .body(Bytes::new())
        .unwrap()
}

fn key(path: &str) -> CacheKey {
    CacheKey::new(ORIGIN_HOST, 80, path)
}

async fn body_of(response: Response<Full<Bytes>>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

#[tokio::test]
async fn test_miss_then_fresh_hit_contacts_origin_once() {
    let origin = spawn_origin(
        Duration::ZERO,
        handler(|_| response(StatusCode::OK, &[("cache-control", "max-age=60")], "hello from origin")),
    )
    .await;
    let fetcher = fetcher_for(&origin);

    let first = fetcher.fetch(get("/page")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(body_of(first).await, "hello from origin");
    assert!(fetcher.store().contains(&key("/page")).await);

    let second = fetcher.fetch(get("/page")).await.unwrap();
    assert_eq!(second.headers().get(CACHE_CONTROL).unwrap(), "max-age=60");
    assert_eq!(body_of(second).await, "hello from origin");

    assert_eq!(origin.request_count(), 1);
    let stats = fetcher.store().stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn test_repeated_gets_of_fresh_key_are_identical() {
    let origin = spawn_origin(
        Duration::ZERO,
        handler(|_| response(StatusCode::OK, &[("etag", "\"same\"")], "stable")),
    )
    .await;
    let fetcher = fetcher_for(&origin);

    let mut bodies = Vec::new();
    for _ in 0..5 {
        let response = fetcher.fetch(get("/stable")).await.unwrap();
        assert_eq!(response.headers().get(ETAG).unwrap(), "\"same\"");
        bodies.push(body_of(response).await);
    }

    assert!(bodies.iter().all(|b| b == "stable"));
    assert_eq!(origin.request_count(), 1);
}

#[tokio::test]
async fn test_no_store_is_never_cached() {
    let origin = spawn_origin(
        Duration::ZERO,
        handler(|_| response(StatusCode::OK, &[("cache-control", "no-store")], "secret")),
    )
    .await;
    let fetcher = fetcher_for(&origin);

    for _ in 0..3 {
        let response = fetcher.fetch(get("/secret")).await.unwrap();
        assert_eq!(body_of(response).await, "secret");
        assert!(!fetcher.store().contains(&key("/secret")).await);
    }
    assert_eq!(origin.request_count(), 3);
}

#[tokio::test]
async fn test_private_response_is_not_cached() {
    let origin = spawn_origin(
        Duration::ZERO,
        handler(|_| response(StatusCode::OK, &[("cache-control", "private, max-age=600")], "mine")),
    )
    .await;
    let fetcher = fetcher_for(&origin);

    fetcher.fetch(get("/inbox")).await.unwrap();
    fetcher.fetch(get("/inbox")).await.unwrap();

    assert!(fetcher.store().is_empty().await);
    assert_eq!(origin.request_count(), 2);
}

#[tokio::test]
async fn test_error_status_is_relayed_but_not_cached() {
    let origin = spawn_origin(
        Duration::ZERO,
        handler(|_| response(StatusCode::NOT_FOUND, &[("cache-control", "max-age=60")], "missing")),
    )
    .await;
    let fetcher = fetcher_for(&origin);

    let response = fetcher.fetch(get("/gone")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_of(response).await, "missing");
    assert!(!fetcher.store().contains(&key("/gone")).await);
}

#[tokio::test]
async fn test_must_revalidate_at_age_zero_revalidates_with_not_modified() {
    let origin = spawn_origin(
        Duration::ZERO,
        handler(|req| {
            let validator = req.headers().get(IF_NONE_MATCH).and_then(|v| v.to_str().ok());
            if validator == Some("\"v1\"") {
                response(StatusCode::NOT_MODIFIED, &[("etag", "\"v2\""), ("cache-control", "must-revalidate")], "")
            } else {
                response(StatusCode::OK, &[("etag", "\"v1\""), ("cache-control", "must-revalidate")], "original body")
            }
        }),
    )
    .await;
    let fetcher = fetcher_for(&origin);

    let first = fetcher.fetch(get("/doc")).await.unwrap();
    assert_eq!(body_of(first).await, "original body");

    // Immediately again: age 0, but must-revalidate forces a conditional GET.
    let second = fetcher.fetch(get("/doc")).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers().get(ETAG).unwrap(), "\"v2\"");
    assert_eq!(body_of(second).await, "original body");

    assert_eq!(origin.request_count(), 2);
    assert_eq!(origin.seen_validators(), vec![None, Some("\"v1\"".to_string())]);

    let stored = fetcher.store().get(&key("/doc")).await.unwrap();
    assert_eq!(stored.body, Bytes::from_static(b"original body"));
    assert_eq!(stored.etag.as_deref(), Some("\"v2\""));
    assert_eq!(fetcher.store().stats().revalidations, 1);
}

#[tokio::test]
async fn test_expired_entry_replaced_by_full_response() {
    let origin = spawn_origin(
        Duration::ZERO,
        handler(|_| response(StatusCode::OK, &[("etag", "\"new\""), ("cache-control", "max-age=60")], "new body")),
    )
    .await;
    let fetcher = fetcher_for(&origin);

    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, "max-age=60".parse().unwrap());
    headers.insert(ETAG, "\"old\"".parse().unwrap());
    let stale = CacheEntry::new(
        StatusCode::OK,
        headers,
        Bytes::from_static(b"old body"),
        Utc::now() - ChronoDuration::seconds(120),
    );
    fetcher.store().insert(key("/feed"), stale).await;

    let response = fetcher.fetch(get("/feed")).await.unwrap();
    assert_eq!(body_of(response).await, "new body");
    assert_eq!(origin.seen_validators(), vec![Some("\"old\"".to_string())]);

    let stored = fetcher.store().get(&key("/feed")).await.unwrap();
    assert_eq!(stored.body, Bytes::from_static(b"new body"));
    assert_eq!(stored.etag.as_deref(), Some("\"new\""));
}

#[tokio::test]
async fn test_fresh_entry_served_without_origin_contact() {
    let origin = spawn_origin(
        Duration::ZERO,
        handler(|_| response(StatusCode::OK, &[], "should not be fetched")),
    )
    .await;
    let fetcher = fetcher_for(&origin);

    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, "max-age=60".parse().unwrap());
    let entry = CacheEntry::new(
        StatusCode::OK,
        headers,
        Bytes::from_static(b"cached"),
        Utc::now() - ChronoDuration::seconds(30),
    );
    fetcher.store().insert(key("/warm"), entry).await;

    let response = fetcher.fetch(get("/warm")).await.unwrap();
    assert_eq!(body_of(response).await, "cached");
    assert_eq!(origin.request_count(), 0);
}

#[tokio::test]
async fn test_concurrent_misses_fetch_once() {
    let origin = spawn_origin(
        Duration::from_millis(100),
        handler(|_| response(StatusCode::OK, &[("cache-control", "max-age=60")], "shared")),
    )
    .await;
    let fetcher = Arc::new(fetcher_for(&origin));

    let fetches = (0..8).map(|_| {
        let fetcher = fetcher.clone();
        async move {
            let response = fetcher.fetch(get("/popular")).await.unwrap();
            body_of(response).await
        }
    });
    let bodies = futures::future::join_all(fetches).await;

    assert_eq!(bodies.len(), 8);
    assert!(bodies.iter().all(|b| b == "shared"));
    assert_eq!(origin.request_count(), 1);
}

#[tokio::test]
async fn test_unknown_origin_is_bad_gateway() {
    let origin = spawn_origin(Duration::ZERO, handler(|_| response(StatusCode::OK, &[], ""))).await;
    let fetcher = fetcher_for(&origin);

    let req = Request::builder()
        .method(Method::GET)
        .uri("/")
        .header(HOST, "nowhere.test")
        .body(Bytes::new())
        .unwrap();
    let err = fetcher.fetch(req).await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
}
