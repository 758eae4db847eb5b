//! Integration tests for Mirrorgate

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, HOST, LOCATION, USER_AGENT};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use mirrorgate::admin::{AdminServer, AdminState};
use mirrorgate::cache::CacheStore;
use mirrorgate::context::MirrorContext;
use mirrorgate::db::{Database, RecordFilter};
use mirrorgate::error::{ProxyBody, X_MIRROR_ERROR};
use mirrorgate::proxy::MirrorServer;
use mirrorgate::recorder::{AccessRecorder, RecordSink};
use mirrorgate::registry::SiteRegistry;
use mirrorgate::request::InboundRequest;
use mirrorgate::site::{make_site, SiteConfig, PAGE_NOT_FOUND, UPSTREAM_FAILED};
use mirrorgate::transport::{TransportConfig, UpstreamTransport};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

const GOOGLEBOT: &str = "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";
const BADBOT: &str = "BadBot/1.0";
const BROWSER: &str = "Mozilla/5.0 (X11; Linux x86_64) Firefox/120.0";

/// In-process upstream that counts every request it serves.
///
/// Aborting `handle` drops the listener and every open connection.
struct MockUpstream {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockUpstream {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        let handle = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    continue;
                };
                let counter = Arc::clone(&counter);
                connections.spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let authority = addr.to_string();
                        async move { Ok::<_, Infallible>(upstream_route(&req, &authority)) }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, hits, handle }
    }

    fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.handle.abort();
    }
}

fn upstream_route(req: &Request<Incoming>, authority: &str) -> Response<Full<Bytes>> {
    let builder = Response::builder();
    match req.uri().path() {
        "/missing" => builder
            .status(StatusCode::NOT_FOUND)
            .header("content-type", "text/html")
            .body(Full::new(Bytes::from("<h1>gone</h1>"))),
        "/redirect" => builder
            .status(StatusCode::FOUND)
            .header("location", "/landing?x=1")
            .body(Full::new(Bytes::new())),
        "/style.css" => builder
            .header("content-type", "text/css")
            .body(Full::new(Bytes::from(format!(
                "body{{background:url(http://{authority}/bg.png)}}"
            )))),
        "/error" => builder
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Full::new(Bytes::from("boom"))),
        _ => builder.header("content-type", "text/html; charset=utf-8").body(Full::new(Bytes::from(
            "<html><head><title>Origin Title</title></head>\
             <body><a href=\"/about\">About</a><p>Hello origin</p>\
             <script>alert(1)</script></body></html>",
        ))),
    }
    .unwrap()
}

fn transport() -> UpstreamTransport {
    UpstreamTransport::new(TransportConfig {
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(5),
        ..TransportConfig::default()
    })
    .unwrap()
}

fn context(cache_dir: &TempDir, recorder: AccessRecorder) -> Arc<MirrorContext> {
    let spiders = vec!["Googlebot".to_string(), "BadBot".to_string()];
    let good = vec!["Googlebot".to_string()];
    Arc::new(
        MirrorContext::new(CacheStore::new(cache_dir.path()), transport(), recorder)
            .with_spiders(&spiders, &good)
            .with_inject_js("/__mirror/inject.js", "console.log('mirror');"),
    )
}

fn site_config(upstream: &str) -> SiteConfig {
    let mut config = SiteConfig::new("mirror.test", upstream);
    config.finds = vec!["origin".to_string()];
    config.replaces = vec!["mirror".to_string()];
    config
}

fn inbound(path: &str, user_agent: &str) -> InboundRequest {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_str(user_agent).unwrap());
    headers.insert(HOST, HeaderValue::from_static("www.mirror.test"));
    InboundRequest::new(
        Method::GET,
        path.parse().unwrap(),
        headers,
        Bytes::new(),
        "www.mirror.test".to_string(),
    )
}

async fn body_string(response: Response<ProxyBody>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send HTTP request with custom Host header (for mirror testing)
async fn http_get_with_host(
    port: u16,
    path: &str,
    host: Option<&str>,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let host_line = host.map(|h| format!("Host: {}\r\n", h)).unwrap_or_default();
    let request = format!(
        "GET {} HTTP/1.1\r\n{}User-Agent: {}\r\nConnection: close\r\n\r\n",
        path, host_line, BROWSER
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Send authenticated HTTP GET request (for admin API testing)
async fn http_get_with_auth(
    port: u16,
    path: &str,
    token: Option<&str>,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let auth_line = token
        .map(|t| format!("Authorization: Bearer {}\r\n", t))
        .unwrap_or_default();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n{}Connection: close\r\n\r\n",
        path, port, auth_line
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

#[tokio::test]
async fn test_first_fetch_rewrites_and_caches() {
    let upstream = MockUpstream::start().await;
    let cache_dir = TempDir::new().unwrap();
    let ctx = context(&cache_dir, AccessRecorder::disabled());
    let registry = SiteRegistry::new();
    let site = make_site(site_config(&upstream.url()), ctx, &registry).unwrap();

    let first = site.route(&inbound("/page.html", BROWSER)).await;
    assert_eq!(first.status(), StatusCode::OK);
    let body = body_string(first).await;
    assert!(body.contains("Hello mirror"), "body: {body}");
    assert!(body.contains("href=\"http://www.mirror.test/about\""), "body: {body}");
    assert!(body.contains("src=\"/__mirror/inject.js\""));
    assert!(!body.contains("alert(1)"));
    assert!(!body.contains(&upstream.addr.to_string()));
    assert_eq!(upstream.hits(), 1);

    assert!(body.contains("<div style=\"display:none\">"), "body: {body}");

    // Served from disk without touching upstream, decoy replayed unchanged
    let second = site.route(&inbound("/page.html", BROWSER)).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(body_string(second).await, body);
    assert_eq!(upstream.hits(), 1);

    upstream.stop();
}

#[tokio::test]
async fn test_cache_disabled_always_fetches() {
    let upstream = MockUpstream::start().await;
    let cache_dir = TempDir::new().unwrap();
    let ctx = context(&cache_dir, AccessRecorder::disabled());
    let registry = SiteRegistry::new();
    let mut config = site_config(&upstream.url());
    config.cache_enable = false;
    let site = make_site(config, ctx, &registry).unwrap();

    site.route(&inbound("/page.html", BROWSER)).await;
    site.route(&inbound("/page.html", BROWSER)).await;
    assert_eq!(upstream.hits(), 2);

    upstream.stop();
}

#[tokio::test]
async fn test_crawler_gate() {
    let upstream = MockUpstream::start().await;
    let cache_dir = TempDir::new().unwrap();
    let ctx = context(&cache_dir, AccessRecorder::disabled());
    let registry = SiteRegistry::new();
    let site = make_site(site_config(&upstream.url()), ctx, &registry).unwrap();

    let blocked = site.route(&inbound("/page.html", BADBOT)).await;
    assert_eq!(blocked.status(), StatusCode::NOT_FOUND);
    assert!(blocked.headers().contains_key(X_MIRROR_ERROR));
    assert_eq!(body_string(blocked).await, PAGE_NOT_FOUND);
    assert_eq!(upstream.hits(), 0);

    let allowed = site.route(&inbound("/page.html", GOOGLEBOT)).await;
    assert_eq!(allowed.status(), StatusCode::OK);
    let body = body_string(allowed).await;
    assert!(body.contains("Hello mirror"));
    // Crawlers never get the injected script
    assert!(!body.contains("/__mirror/inject.js"));
    assert_eq!(upstream.hits(), 1);

    upstream.stop();
}

#[tokio::test]
async fn test_crawler_visits_are_recorded() {
    let upstream = MockUpstream::start().await;
    let cache_dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let sink: Arc<dyn RecordSink> = db.clone();
    let ctx = context(&cache_dir, AccessRecorder::spawn(sink, 16));
    let registry = SiteRegistry::new();
    let site = make_site(site_config(&upstream.url()), Arc::clone(&ctx), &registry).unwrap();

    site.route(&inbound("/page.html", GOOGLEBOT)).await;
    site.route(&inbound("/page.html", GOOGLEBOT)).await;
    site.route(&inbound("/page.html", BROWSER)).await;
    ctx.recorder.close(Duration::from_secs(5)).await;

    let filter = RecordFilter {
        domain: Some("www.mirror.test".to_string()),
        ..RecordFilter::default()
    };
    assert_eq!(db.count_records(&filter).unwrap(), 2);
    let records = db.list_records(&filter, 1, 10).unwrap();
    assert_eq!(records[0].spider, "googlebot");
    assert_eq!(records[0].path, "/page.html");

    upstream.stop();
}

#[tokio::test]
async fn test_stale_copy_served_when_upstream_fails() {
    let upstream = MockUpstream::start().await;
    let cache_dir = TempDir::new().unwrap();
    let ctx = context(&cache_dir, AccessRecorder::disabled());
    let registry = SiteRegistry::new();
    let mut config = site_config(&upstream.url());
    // Every cached entry is immediately stale
    config.cache_time = 0;
    let site = make_site(config, ctx, &registry).unwrap();

    let fresh = site.route(&inbound("/page.html", BROWSER)).await;
    assert_eq!(fresh.status(), StatusCode::OK);
    assert_eq!(upstream.hits(), 1);

    upstream.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stale = site.route(&inbound("/page.html", BROWSER)).await;
    assert_eq!(stale.status(), StatusCode::OK);
    assert!(body_string(stale).await.contains("Hello mirror"));

    let uncached = site.route(&inbound("/never-fetched.html", BROWSER)).await;
    assert_eq!(uncached.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_string(uncached).await, UPSTREAM_FAILED);
}

#[tokio::test]
async fn test_redirect_is_rehomed() {
    let upstream = MockUpstream::start().await;
    let cache_dir = TempDir::new().unwrap();
    let ctx = context(&cache_dir, AccessRecorder::disabled());
    let registry = SiteRegistry::new();
    let site = make_site(site_config(&upstream.url()), ctx, &registry).unwrap();

    let response = site.route(&inbound("/redirect", BROWSER)).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers().get(LOCATION).unwrap(),
        "http://www.mirror.test/landing?x=1"
    );

    upstream.stop();
}

#[tokio::test]
async fn test_client_errors_are_replaced_and_cached() {
    let upstream = MockUpstream::start().await;
    let cache_dir = TempDir::new().unwrap();
    let ctx = context(&cache_dir, AccessRecorder::disabled());
    let registry = SiteRegistry::new();
    let site = make_site(site_config(&upstream.url()), ctx, &registry).unwrap();

    let first = site.route(&inbound("/missing", BROWSER)).await;
    assert_eq!(first.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_string(first).await, PAGE_NOT_FOUND);

    let second = site.route(&inbound("/missing", BROWSER)).await;
    assert_eq!(second.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_string(second).await, PAGE_NOT_FOUND);
    assert_eq!(upstream.hits(), 1);

    // Server errors pass through untouched and are not cached
    let error = site.route(&inbound("/error", BROWSER)).await;
    assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_string(error).await, "boom");
    site.route(&inbound("/error", BROWSER)).await;
    assert_eq!(upstream.hits(), 3);

    upstream.stop();
}

#[tokio::test]
async fn test_stylesheet_hosts_are_rewritten() {
    let upstream = MockUpstream::start().await;
    let cache_dir = TempDir::new().unwrap();
    let ctx = context(&cache_dir, AccessRecorder::disabled());
    let registry = SiteRegistry::new();
    let site = make_site(site_config(&upstream.url()), ctx, &registry).unwrap();

    let response = site.route(&inbound("/style.css", BROWSER)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_string(response).await,
        "body{background:url(http://www.mirror.test/bg.png)}"
    );

    upstream.stop();
}

#[tokio::test]
async fn test_mirror_server_end_to_end() {
    let upstream = MockUpstream::start().await;
    let cache_dir = TempDir::new().unwrap();
    let ctx = context(&cache_dir, AccessRecorder::disabled());
    let registry = Arc::new(SiteRegistry::new());
    make_site(site_config(&upstream.url()), Arc::clone(&ctx), &registry).unwrap();

    let port = 31801;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = MirrorServer::new(
        format!("127.0.0.1:{}", port).parse().unwrap(),
        Arc::clone(&registry),
        Arc::clone(&ctx),
        shutdown_rx,
    );
    let handle = tokio::spawn(server.run());
    assert!(wait_for_port(port, Duration::from_secs(5)).await, "mirror server did not start");

    let page = http_get_with_host(port, "/page.html", Some("www.mirror.test")).await.unwrap();
    assert!(page.starts_with("HTTP/1.1 200"), "response: {page}");
    assert!(page.to_ascii_lowercase().contains("x-request-id:"));
    assert!(page.contains("Hello mirror"));

    let unknown = http_get_with_host(port, "/", Some("nobody.example")).await.unwrap();
    assert!(unknown.starts_with("HTTP/1.1 404"), "response: {unknown}");

    let no_host = http_get_with_host(port, "/", None).await.unwrap();
    assert!(no_host.starts_with("HTTP/1.1 400"), "response: {no_host}");

    let script = http_get_with_host(port, "/__mirror/inject.js", Some("www.mirror.test"))
        .await
        .unwrap();
    assert!(script.starts_with("HTTP/1.1 200"));
    assert!(script.contains("text/javascript;charset=utf-8"));
    assert!(script.ends_with("console.log('mirror');"));

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    upstream.stop();
}

#[tokio::test]
async fn test_admin_api_auth() {
    let cache_dir = TempDir::new().unwrap();
    let ctx = context(&cache_dir, AccessRecorder::disabled());
    let db = Arc::new(Database::open_in_memory().unwrap());
    let registry = Arc::new(SiteRegistry::new());
    let state = Arc::new(AdminState {
        registry: Arc::clone(&registry),
        ctx,
        db: Arc::clone(&db),
    });
    db.add_one(&SiteConfig::new("a.test", "http://a.example/")).unwrap();

    let port = 31802;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = AdminServer::new(
        format!("127.0.0.1:{}", port).parse().unwrap(),
        state,
        shutdown_rx,
        "secret-token".to_string(),
    );
    let handle = tokio::spawn(server.run());
    assert!(wait_for_port(port, Duration::from_secs(5)).await, "admin server did not start");

    let health = http_get_with_auth(port, "/health", None).await.unwrap();
    assert!(health.starts_with("HTTP/1.1 200"));
    assert!(health.ends_with("ok"));

    let version = http_get_with_auth(port, "/version", None).await.unwrap();
    assert!(version.contains("\"name\":\"mirrorgate\""));

    let denied = http_get_with_auth(port, "/sites", None).await.unwrap();
    assert!(denied.starts_with("HTTP/1.1 401"), "response: {denied}");

    let wrong = http_get_with_auth(port, "/sites", Some("nope")).await.unwrap();
    assert!(wrong.starts_with("HTTP/1.1 401"));

    let sites = http_get_with_auth(port, "/sites", Some("secret-token")).await.unwrap();
    assert!(sites.starts_with("HTTP/1.1 200"), "response: {sites}");
    assert!(sites.contains("\"count\":1"));
    assert!(sites.contains("a.test"));

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}
