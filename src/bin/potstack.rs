//! PotStack host entry point.
//!
//! Startup order matters: the façade comes up first, the loader waits on
//! the internal health endpoint before materialising anything, and the
//! keeper starts reconciling only after the loader finishes. Shutdown is
//! signal-driven with a bounded drain.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use potstack::config::Config;
use potstack::https::{CertManager, HttpsState};
use potstack::keeper::SandboxManager;
use potstack::loader::{Loader, LoaderConfig};
use potstack::router::DynamicRouter;
use potstack::server::{self, ServerState};
use potstack::store::SqliteStore;
use potstack::INTERNAL_PORT;

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> potstack::Result<()> {
    let config = Config::from_env();

    init_directories(&config)?;
    init_logging(&config);

    info!("starting PotStack");
    if config.token.is_none() {
        warn!("POTSTACK_TOKEN not set: every endpoint is open, do not expose this host");
    }

    // HTTPS config cell + watcher.
    let https_state = HttpsState::init(&config.https_config())?;

    // Shutdown fan-out.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    https_state.spawn_watcher(shutdown_rx.clone());

    // Store. Unavailable storage is fatal at startup.
    let store = Arc::new(SqliteStore::open(&config.repo_dir())?);

    // Certificate manager.
    let certs = CertManager::new(
        &config.certs_dir(),
        &config.cert_file(),
        &config.key_file(),
        Arc::clone(&https_state),
    );

    // Routing core and façade state.
    let dynamic_router = Arc::new(DynamicRouter::new(&config.repo_dir()));
    let state = Arc::new(ServerState {
        config: config.clone(),
        router: Arc::clone(&dynamic_router),
        users: store.clone(),
        repos: store.clone(),
        certs: certs.clone(),
    });

    // TLS: HTTP mode yields no config, HTTPS performs issuance if needed.
    let tls = match certs.setup().await {
        Ok(tls) => tls,
        Err(e) => {
            warn!(error = %e, "TLS setup failed, falling back to HTTP");
            None
        }
    };
    if tls.is_some() {
        certs.spawn_cert_watcher(shutdown_rx.clone());
        certs.spawn_renewal_checker(shutdown_rx.clone());
    }

    // Listeners. A bind failure on any of the three is fatal.
    let business_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let admin_addr = SocketAddr::from(([0, 0, 0, 0], config.admin_port));
    let internal_addr = SocketAddr::from(([127, 0, 0, 1], INTERNAL_PORT));

    let (srv_err_tx, mut srv_err_rx) = tokio::sync::mpsc::channel::<potstack::Error>(3);

    spawn_listener(
        server::business_app(state.clone()),
        business_addr,
        tls.clone(),
        shutdown_rx.clone(),
        srv_err_tx.clone(),
    );
    spawn_listener(
        server::admin_app(state.clone()),
        admin_addr,
        tls.clone(),
        shutdown_rx.clone(),
        srv_err_tx.clone(),
    );
    // The internal listener is always plaintext.
    spawn_listener(
        server::internal_app(state.clone()),
        internal_addr,
        None,
        shutdown_rx.clone(),
        srv_err_tx.clone(),
    );

    // Keeper and loader, wired to each other through narrow capabilities.
    let keeper = SandboxManager::new(&config.repo_dir());
    let loader = Arc::new(Loader::new(
        LoaderConfig {
            service_url: server::internal_url(),
            base_bundle: Loader::ensure_base_bundle(&config.data_dir),
        },
        &config.repo_dir(),
        store.clone(),
        store.clone(),
    ));

    {
        let loader = Arc::clone(&loader);
        let keeper = keeper.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = loader.initialize().await {
                error!(error = %e, "loader initialisation failed");
                return;
            }
            keeper.set_pot_provider(loader.clone());
            loader.set_update_sink(Arc::new(keeper.clone()));
            keeper.run(shutdown_rx).await;
        });
    }

    // Wait for a signal or a fatal listener error.
    tokio::select! {
        _ = shutdown_signal() => info!("shutdown signal received"),
        Some(e) = srv_err_rx.recv() => error!(error = %e, "listener failed"),
    }

    let _ = shutdown_tx.send(true);
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    info!("PotStack exit");
    Ok(())
}

fn spawn_listener(
    app: axum::Router,
    addr: SocketAddr,
    tls: Option<Arc<rustls::ServerConfig>>,
    shutdown: tokio::sync::watch::Receiver<bool>,
    errors: tokio::sync::mpsc::Sender<potstack::Error>,
) {
    tokio::spawn(async move {
        let result = match tls {
            Some(tls) => server::serve_tls(addr, app, tls, shutdown).await,
            None => server::serve_plain(addr, app, shutdown).await,
        };
        if let Err(e) = result {
            let _ = errors.send(e).await;
        }
    });
}

fn init_directories(config: &Config) -> potstack::Result<()> {
    std::fs::create_dir_all(config.repo_dir())?;
    std::fs::create_dir_all(config.certs_dir())?;
    if let Some(log_dir) = config.log_file().parent() {
        std::fs::create_dir_all(log_dir)?;
    }
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let file_layer = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.log_file())
        .ok()
        .map(|file| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
        });

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    match file_layer {
        Some(layer) => registry.with(layer).init(),
        None => registry.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
