//! Webfleet control service binary.
//!
//! Wires the durable store, the infrastructure adapters, the background
//! worker, and the HTTP API together, then runs until SIGTERM/SIGINT with
//! a bounded graceful drain.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use webfleet_control::api::{self, AppState};
use webfleet_control::probes::CertPoller;
use webfleet_control::{
    Destroyer, DomainManager, Provisioner, SiteService, StaticProvisioner, WebfleetConfig, Worker,
};
use webfleet_infra::{
    AppDbOps, ArchiveOps, CaddyEdgeOps, CloudflaredIngressFile, ContainerOps, DnsResolve,
    DockerClient, DockerContainerOps, DockerTlsConfig, EdgeConfigOps, MariaDbAdminOps,
    SystemDnsResolver, TunnelConfigOps, ZipExtractor,
};
use webfleet_state::{MySqlStore, StateStore};

/// How long in-flight requests get to finish on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("webfleet_control=info".parse()?),
        )
        .init();

    let cfg = WebfleetConfig::load()?;
    info!(
        api_port = cfg.api_port,
        base_domain = %cfg.base_domain,
        docker_host = %cfg.docker_host,
        "configuration loaded"
    );

    // Durable state.
    let store: Arc<dyn StateStore> = Arc::new(MySqlStore::new(&cfg.control_dsn).await?);
    info!("connected to control database");

    // Infrastructure adapters.
    let tls = DockerTlsConfig::from_dir(&cfg.docker_cert_dir)?;
    let docker = DockerClient::new(&cfg.docker_host, &tls)?;
    let containers: Arc<dyn ContainerOps> = Arc::new(DockerContainerOps::new(docker));
    info!("container daemon client ready");

    let edge: Arc<dyn EdgeConfigOps> = Arc::new(CaddyEdgeOps::new(
        Arc::clone(&containers),
        cfg.edge_container.clone(),
        cfg.edge_conf_dir.clone(),
        cfg.edge_cert_dir.clone(),
    ));
    let app_db: Arc<dyn AppDbOps> = Arc::new(MariaDbAdminOps::new(&cfg.wp_dsn).await?);
    let dns: Arc<dyn DnsResolve> = Arc::new(SystemDnsResolver::new());
    let archive: Arc<dyn ArchiveOps> = Arc::new(ZipExtractor::new());
    let tunnel: Arc<dyn TunnelConfigOps> = Arc::new(CloudflaredIngressFile::new(
        cfg.tunnel_config_path.clone(),
        cfg.tunnel_service_target.clone(),
    ));

    // Orchestrators.
    let provisioner = Arc::new(Provisioner::new(
        Arc::clone(&containers),
        Arc::clone(&edge),
        Arc::clone(&app_db),
        cfg.clone(),
    ));
    let destroyer = Arc::new(Destroyer::new(
        Arc::clone(&containers),
        Arc::clone(&edge),
        Arc::clone(&app_db),
        cfg.clone(),
    ));
    let static_provisioner = Arc::new(StaticProvisioner::new(
        Arc::clone(&containers),
        Arc::clone(&edge),
        Arc::clone(&archive),
        cfg.clone(),
    ));
    let domains = Arc::new(DomainManager::new(
        Arc::clone(&store),
        Arc::clone(&containers),
        Arc::clone(&edge),
        Arc::clone(&app_db),
        dns,
        tunnel,
        cfg.clone(),
    ));
    let service = Arc::new(SiteService::new(
        Arc::clone(&store),
        Arc::clone(&edge),
        cfg.clone(),
    ));

    // Background worker.
    let cancel = CancellationToken::new();
    let worker = Worker::new(
        Arc::clone(&store),
        provisioner,
        destroyer,
        static_provisioner,
        cfg.poll_interval(),
        cfg.stuck_job_timeout(),
    );
    let worker_cancel = cancel.clone();
    let worker_task = tokio::spawn(async move { worker.run(worker_cancel).await });
    info!("worker started");

    // HTTP API.
    let state = AppState {
        service,
        domains,
        cert: Arc::new(CertPoller::new(Arc::clone(&edge))),
        api_key: cfg.api_key.clone(),
        staging_dir: cfg.staging_dir.clone(),
    };
    let app = api::router(state);

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), cfg.api_port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "API listening");

    let shutdown = cancel.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown.cancelled().await;
    });

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    // Runs until the token fires, then drains in-flight requests.
    if let Err(e) = server.await {
        error!(error = %e, "server error");
    }

    // The worker finishes its current tick before observing the token.
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, worker_task).await;
    info!("stopped cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
