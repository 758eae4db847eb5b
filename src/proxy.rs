use crate::context::MirrorContext;
use crate::error::{error_response, full_body, MirrorErrorCode, ProxyBody};
use crate::registry::SiteRegistry;
use crate::request::{resolve_host, InboundRequest};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// The public mirror server
pub struct MirrorServer {
    bind_addr: SocketAddr,
    registry: Arc<SiteRegistry>,
    ctx: Arc<MirrorContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MirrorServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<SiteRegistry>,
        ctx: Arc<MirrorContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            ctx,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Mirror server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let ctx = Arc::clone(&self.ctx);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, registry, ctx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Mirror server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    registry: Arc<SiteRegistry>,
    ctx: Arc<MirrorContext>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, registry, ctx).await }
    });

    // A dropped connection drops the in-flight service future, which aborts
    // the upstream fetch with it
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

pub async fn handle_request(
    req: Request<Incoming>,
    registry: Arc<SiteRegistry>,
    ctx: Arc<MirrorContext>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if req.uri().path() == ctx.inject_js_path {
        return Ok(inject_js_response(&ctx));
    }

    let Some(host) = resolve_host(req.uri(), req.headers()) else {
        return Ok(error_response(
            MirrorErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        ));
    };

    debug!(host, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let site = match registry.query_site(&host) {
        Ok(site) => site,
        Err(e) => {
            debug!(host, error = %e, "No site for host");
            return Ok(error_response(MirrorErrorCode::UnknownHost, "Unknown or unconfigured host"));
        }
    };

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(host, request_id, error = %e, "Failed to read request body");
            return Ok(error_response(MirrorErrorCode::BadRequest, "Failed to read request body"));
        }
    };

    let inbound = InboundRequest::new(parts.method, parts.uri, parts.headers, body, host);
    let mut response = site.route(&inbound).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    debug!(
        host = %inbound.host,
        path = inbound.path(),
        status = response.status().as_u16(),
        request_id,
        "Request served"
    );
    Ok(response)
}

fn inject_js_response(ctx: &MirrorContext) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(ctx.inject_js.clone()));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/javascript;charset=utf-8"),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(ctx.inject_js.len()));
    response
}
