use crate::context::MirrorContext;
use crate::db::{Database, RecordFilter};
use crate::registry::SiteRegistry;
use crate::site::{make_site, normalize_domain, Site, SiteConfig};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the mirror
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 1000;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_error(status: StatusCode, message: impl std::fmt::Display) -> Response<Full<Bytes>> {
    json_response(status, serde_json::json!({ "error": message.to_string() }).to_string())
}

fn internal_error(context: &str, e: anyhow::Error) -> Response<Full<Bytes>> {
    error!(error = %format!("{:#}", e), "{}", context);
    json_error(StatusCode::INTERNAL_SERVER_ERROR, context)
}

/// Everything the admin API manipulates
pub struct AdminState {
    pub registry: Arc<SiteRegistry>,
    pub ctx: Arc<MirrorContext>,
    pub db: Arc<Database>,
}

/// Admin API for site management, cache purges and access records
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        state: Arc<AdminState>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let auth_token = Arc::clone(&self.auth_token);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let auth_token = Arc::clone(&auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    state: Arc<AdminState>,
    auth_token: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, state, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<hyper::body::Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<AdminState>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    debug!(%method, %path, "Admin API request");

    // Health check and version for the admin API itself (no auth required)
    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version_info.to_string()));
        }
        _ => {}
    }

    if !check_auth(&req, &auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let body = req.into_body().collect().await?.to_bytes();
    Ok(dispatch(&state, &method, &path, &query, &body))
}

/// Route an authenticated admin request
pub fn dispatch(
    state: &AdminState,
    method: &Method,
    path: &str,
    query: &str,
    body: &[u8],
) -> Response<Full<Bytes>> {
    let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    match (method, path) {
        // List site configs: GET /sites?page=&limit=
        (&Method::GET, "/sites") => list_sites(state, &params),

        // Create or update a site: POST /sites
        (&Method::POST, "/sites") => match serde_json::from_slice::<SiteConfig>(body) {
            Ok(config) => save_site(state, config),
            Err(e) => json_error(StatusCode::BAD_REQUEST, format!("invalid site config: {e}")),
        },

        // Bulk import: POST /sites/import
        (&Method::POST, "/sites/import") => match serde_json::from_slice::<Vec<SiteConfig>>(body) {
            Ok(configs) => import_sites(state, configs),
            Err(e) => json_error(StatusCode::BAD_REQUEST, format!("invalid site list: {e}")),
        },

        // Bulk delete: POST /sites/delete {"domains": [...]}
        (&Method::POST, "/sites/delete") => match serde_json::from_slice::<DomainList>(body) {
            Ok(list) => delete_sites(state, &list.domains),
            Err(e) => json_error(StatusCode::BAD_REQUEST, format!("invalid domain list: {e}")),
        },

        (&Method::GET, path) if path.starts_with("/sites/") => {
            let domain = normalize_domain(path.trim_start_matches("/sites/"));
            match state.db.get_one(&domain) {
                Ok(Some(config)) => json_response(StatusCode::OK, to_json(&config)),
                Ok(None) => json_error(StatusCode::NOT_FOUND, "site not found"),
                Err(e) => internal_error("Failed to load site", e),
            }
        }

        (&Method::DELETE, path) if path.starts_with("/sites/") => {
            let domain = normalize_domain(path.trim_start_matches("/sites/"));
            if domain.is_empty() {
                return json_error(StatusCode::BAD_REQUEST, "missing domain");
            }
            match state.db.delete_one(&domain) {
                Ok(deleted) => {
                    let registered = unregister(state, &domain);
                    if deleted || registered {
                        json_response(StatusCode::OK, serde_json::json!({ "deleted": domain }).to_string())
                    } else {
                        json_error(StatusCode::NOT_FOUND, "site not found")
                    }
                }
                Err(e) => internal_error("Failed to delete site", e),
            }
        }

        // Purge cache: POST /cache/purge {"domain": optional}
        (&Method::POST, "/cache/purge") => {
            let mut request: PurgeRequest = if body.is_empty() {
                PurgeRequest::default()
            } else {
                match serde_json::from_slice(body) {
                    Ok(request) => request,
                    Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("invalid purge request: {e}")),
                }
            };
            request.domain = request.domain.as_deref().map(normalize_domain);
            let result = match &request.domain {
                Some(domain) => state.ctx.cache.purge_domain(domain),
                None => state.ctx.cache.purge_all(),
            };
            match result {
                Ok(()) => {
                    info!(domain = request.domain.as_deref().unwrap_or("*"), "Cache purged");
                    json_response(StatusCode::OK, serde_json::json!({ "purged": request.domain }).to_string())
                }
                Err(e) => json_error(StatusCode::BAD_REQUEST, e),
            }
        }

        // Forbidden word replacement in index titles: POST /forbidden-words
        (&Method::POST, "/forbidden-words") => match serde_json::from_slice::<ForbiddenWordRequest>(body) {
            Ok(request) => replace_forbidden_word(state, &request),
            Err(e) => json_error(StatusCode::BAD_REQUEST, format!("invalid request: {e}")),
        },

        // Access records: GET /records?domain=&start=&end=&page=&limit=
        (&Method::GET, "/records") => {
            let filter = RecordFilter {
                domain: params.get("domain").cloned().filter(|d| !d.is_empty()),
                start: params.get("start").and_then(|v| v.parse().ok()),
                end: params.get("end").and_then(|v| v.parse().ok()),
            };
            let (page, limit) = paging(&params);
            let records = state.db.list_records(&filter, page, limit);
            let count = state.db.count_records(&filter);
            match (records, count) {
                (Ok(records), Ok(count)) => json_response(
                    StatusCode::OK,
                    serde_json::json!({ "records": records, "count": count }).to_string(),
                ),
                (Err(e), _) | (_, Err(e)) => internal_error("Failed to list records", e),
            }
        }

        // Delete access records: DELETE /records?start=&end=
        (&Method::DELETE, "/records") => {
            let start = params.get("start").and_then(|v| v.parse::<i64>().ok());
            let end = params.get("end").and_then(|v| v.parse::<i64>().ok());
            let (Some(start), Some(end)) = (start, end) else {
                return json_error(StatusCode::BAD_REQUEST, "start and end are required");
            };
            match state.db.delete_records_in_range(start, end) {
                Ok(deleted) => {
                    info!(start, end, deleted, "Access records deleted");
                    json_response(StatusCode::OK, serde_json::json!({ "deleted": deleted }).to_string())
                }
                Err(e) => internal_error("Failed to delete records", e),
            }
        }

        (&Method::GET, "/stats") => {
            let transport = state.ctx.transport.stats();
            let stats = serde_json::json!({
                "sites": state.registry.len(),
                "egress_addresses": state.ctx.transport.egress_count(),
                "upstream_requests": transport.get_total_requests(),
                "upstream_failures": transport.get_failed_requests(),
                "records_accepted": state.ctx.recorder.accepted(),
                "records_dropped": state.ctx.recorder.dropped(),
                "records_written": state.ctx.recorder.written(),
            });
            json_response(StatusCode::OK, stats.to_string())
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}

#[derive(Debug, Deserialize)]
struct DomainList {
    domains: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PurgeRequest {
    domain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ForbiddenWordRequest {
    word: String,
    #[serde(default)]
    replacement: String,
    separator: String,
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn paging(params: &HashMap<String, String>) -> (u32, u32) {
    let page = params
        .get("page")
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|p| *p > 0)
        .unwrap_or(1);
    let limit = params
        .get("limit")
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|l| *l > 0)
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .min(MAX_PAGE_SIZE);
    (page, limit)
}

fn list_sites(state: &AdminState, params: &HashMap<String, String>) -> Response<Full<Bytes>> {
    let (page, limit) = paging(params);
    match (state.db.get_by_page(page, limit), state.db.count()) {
        (Ok(sites), Ok(count)) => json_response(
            StatusCode::OK,
            serde_json::json!({ "sites": sites, "count": count }).to_string(),
        ),
        (Err(e), _) | (_, Err(e)) => internal_error("Failed to list sites", e),
    }
}

/// Remove a domain from the registry and drop its cache. Returns whether it was registered.
fn unregister(state: &AdminState, domain: &str) -> bool {
    let registered = state.registry.delete(domain).is_some();
    if let Err(e) = state.ctx.cache.purge_domain(domain) {
        warn!(domain, error = %e, "Failed to purge cache for removed site");
    }
    if registered {
        info!(domain, "Site removed");
    }
    registered
}

fn save_site(state: &AdminState, mut config: SiteConfig) -> Response<Full<Bytes>> {
    config.domain = normalize_domain(&config.domain);
    // Compile before persisting so a bad config changes nothing
    if let Err(e) = Site::build(config.clone(), Arc::clone(&state.ctx)) {
        return json_error(StatusCode::BAD_REQUEST, e);
    }

    if config.id > 0 {
        let renamed: Vec<String> = state
            .registry
            .domains()
            .into_iter()
            .filter(|domain| {
                state
                    .registry
                    .get(domain)
                    .is_some_and(|site| site.config().id == config.id && site.domain() != config.domain)
            })
            .collect();
        match state.db.update_by_id(&config) {
            Ok(true) => {}
            Ok(false) => return json_error(StatusCode::NOT_FOUND, "site not found"),
            Err(e) => return internal_error("Failed to update site", e),
        }
        for domain in renamed {
            unregister(state, &domain);
        }
    } else {
        match state.db.add_one(&config) {
            Ok(id) => config.id = id,
            Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("{:#}", e)),
        }
    }

    match make_site(config, Arc::clone(&state.ctx), &state.registry) {
        Ok(site) => json_response(StatusCode::OK, to_json(site.config())),
        Err(e) => json_error(StatusCode::BAD_REQUEST, e),
    }
}

fn import_sites(state: &AdminState, mut configs: Vec<SiteConfig>) -> Response<Full<Bytes>> {
    for config in &mut configs {
        config.domain = normalize_domain(&config.domain);
    }
    let errors: Vec<String> = configs
        .iter()
        .filter_map(|config| {
            Site::build(config.clone(), Arc::clone(&state.ctx))
                .err()
                .map(|e| format!("{}: {}", config.domain, e))
        })
        .collect();
    if !errors.is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "invalid site configs", "details": errors }).to_string(),
        );
    }

    if let Err(e) = state.db.add_multi(&configs) {
        return internal_error("Failed to import sites", e);
    }

    let mut imported = 0;
    for config in configs {
        let stored = match state.db.get_one(&config.domain) {
            Ok(Some(stored)) => stored,
            Ok(None) => config,
            Err(e) => return internal_error("Failed to reload imported site", e),
        };
        match make_site(stored, Arc::clone(&state.ctx), &state.registry) {
            Ok(_) => imported += 1,
            Err(e) => warn!(error = %e, "Imported site failed to compile"),
        }
    }
    info!(imported, "Sites imported");
    json_response(StatusCode::OK, serde_json::json!({ "imported": imported }).to_string())
}

fn delete_sites(state: &AdminState, domains: &[String]) -> Response<Full<Bytes>> {
    let domains: Vec<String> = domains.iter().map(|d| normalize_domain(d)).collect();
    match state.db.multi_delete(&domains) {
        Ok(deleted) => {
            for domain in &domains {
                unregister(state, domain);
            }
            json_response(StatusCode::OK, serde_json::json!({ "deleted": deleted }).to_string())
        }
        Err(e) => internal_error("Failed to delete sites", e),
    }
}

fn replace_forbidden_word(state: &AdminState, request: &ForbiddenWordRequest) -> Response<Full<Bytes>> {
    let changed = match state
        .db
        .forbidden_word_replace(&request.word, &request.replacement, &request.separator)
    {
        Ok(changed) => changed,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("{:#}", e)),
    };

    // Live sites are never patched in place; each affected one is rebuilt and swapped
    for entry in &changed {
        let Some((domain, _)) = entry.split_once("##") else {
            continue;
        };
        match state.db.get_one(domain) {
            Ok(Some(config)) => {
                if let Err(e) = make_site(config, Arc::clone(&state.ctx), &state.registry) {
                    warn!(domain, error = %e, "Failed to rebuild site after title change");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(domain, error = %format!("{:#}", e), "Failed to reload site"),
        }
    }

    json_response(StatusCode::OK, serde_json::json!({ "changed": changed }).to_string())
}
