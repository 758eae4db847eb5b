use mirrorgate::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use mirrorgate::cache::CacheStore;
use mirrorgate::config::Config;
use mirrorgate::context::MirrorContext;
use mirrorgate::db::Database;
use mirrorgate::proxy::MirrorServer;
use mirrorgate::recorder::{AccessRecorder, RecordSink};
use mirrorgate::registry::SiteRegistry;
use mirrorgate::site::sync_sites;
use mirrorgate::transport::{public_source_ips, UpstreamTransport};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mirrorgate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    if let Some(parent) = Path::new(&config.server.database).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("Failed to create database directory '{}': {}", parent.display(), e)
            })?;
        }
    }
    let db = Arc::new(Database::open(&config.server.database)?);
    info!(path = %config.server.database, "Database opened");

    let assets = config.mirror.load_assets()?;

    let source_ips = if config.mirror.source_ips.is_empty() {
        public_source_ips()
    } else {
        config.mirror.source_ips.clone()
    };
    if source_ips.is_empty() {
        info!("No public source addresses, using the default route for upstream requests");
    } else {
        info!(addresses = ?source_ips, "Upstream source addresses");
    }
    let transport = UpstreamTransport::new(config.mirror.transport_config(source_ips))?;

    let sink: Arc<dyn RecordSink> = db.clone();
    let recorder = AccessRecorder::spawn(sink, config.mirror.record_queue_size);

    let ctx = Arc::new(
        MirrorContext::new(CacheStore::new(&config.mirror.cache_path), transport, recorder)
            .with_scheme(config.mirror.scheme.clone())
            .with_spiders(&config.mirror.spiders, &config.mirror.good_spiders)
            .with_keywords(assets.keywords)
            .with_friend_links(assets.friend_links)
            .with_inject_js(config.mirror.inject_js_path.clone(), assets.inject_js)
            .with_global_replace(config.mirror.global_rules())
            .with_converter(assets.converter),
    );

    // Compile every persisted site
    let registry = Arc::new(SiteRegistry::new());
    let loaded = sync_sites(db.get_all()?, &ctx, &registry);
    info!(sites = loaded.registered, failed = loaded.failed.len(), "Sites loaded");

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mirror_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;
    let mirror_server = MirrorServer::new(
        mirror_addr,
        Arc::clone(&registry),
        Arc::clone(&ctx),
        shutdown_rx.clone(),
    );
    let mirror_handle = tokio::spawn(async move {
        if let Err(e) = mirror_server.run().await {
            error!(error = %e, "Mirror server error");
        }
    });

    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_state = Arc::new(AdminState {
        registry: Arc::clone(&registry),
        ctx: Arc::clone(&ctx),
        db: Arc::clone(&db),
    });
    let admin_server = AdminServer::new(admin_addr, admin_state, shutdown_rx.clone(), admin_token);
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or site reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading sites from the database...");
                    match db.get_all() {
                        Ok(configs) => {
                            let result = sync_sites(configs, &ctx, &registry);
                            info!(
                                registered = result.registered,
                                removed = result.removed.len(),
                                failed = result.failed.len(),
                                "Sites reloaded"
                            );
                            if !result.removed.is_empty() {
                                info!(sites = ?result.removed, "Sites removed");
                            }
                        }
                        Err(e) => {
                            error!(error = %format!("{:#}", e), "Failed to reload sites");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = mirror_handle.await;
        let _ = admin_handle.await;
    })
    .await
    .is_err()
    {
        warn!("Servers did not stop in time");
    }

    ctx.recorder.close(SHUTDOWN_TIMEOUT).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting mirror server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        database = %config.server.database,
        "Server configuration"
    );
    info!(
        cache_path = %config.mirror.cache_path,
        scheme = %config.mirror.scheme,
        spiders = config.mirror.spiders.len(),
        good_spiders = config.mirror.good_spiders.len(),
        global_replace = config.mirror.global_replace.len(),
        "Mirror settings"
    );
    info!(
        connect_timeout_secs = config.mirror.connect_timeout_secs,
        keepalive_secs = config.mirror.keepalive_secs,
        request_timeout_secs = config.mirror.request_timeout_secs,
        record_queue_size = config.mirror.record_queue_size,
        "Upstream settings"
    );
}
