use mesh_sidecar::admin_listener::AdminListener;
use mesh_sidecar::config::ProxyConfig;
use mesh_sidecar::generation::GenerationStore;
use mesh_sidecar::listener::Listener;
use mesh_sidecar::mesh::MeshConfig;
use mesh_sidecar::router::Direction;
use mesh_sidecar::service::ServiceSettings;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("starting mesh sidecar");

    if let Err(e) = run().await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ProxyConfig::from_env_validated()?;
    info!(
        "config: inbound={}, outbound={}, admin={}, mesh={}, timeout={}ms, no_route={:?}",
        config.inbound_addr,
        config.outbound_addr,
        config.admin_addr,
        config.mesh_config_path.display(),
        config.request_timeout.as_millis(),
        config.no_route_policy
    );

    let mesh = MeshConfig::from_file(&config.mesh_config_path)?;
    let store = Arc::new(GenerationStore::new(&mesh)?);
    let settings = ServiceSettings::from(&config);

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let inbound = Listener::bind(
        &config.inbound_addr,
        Direction::Inbound,
        Arc::clone(&store),
        settings,
    )
    .await?;
    let outbound = Listener::bind(
        &config.outbound_addr,
        Direction::Outbound,
        Arc::clone(&store),
        settings,
    )
    .await?;
    let admin = AdminListener::bind(&config.admin_addr, Arc::clone(&store)).await?;
    info!(
        "listening: inbound={}, outbound={}, admin={} (/health, /metrics, /generation)",
        inbound.local_addr(),
        outbound.local_addr(),
        admin.local_addr()
    );

    let mut inbound_task = spawn_listener("inbound", inbound.serve(shutdown_tx.subscribe()));
    let mut outbound_task = spawn_listener("outbound", outbound.serve(shutdown_tx.subscribe()));
    let mut admin_task = spawn_listener("admin", admin.serve(shutdown_tx.subscribe()));

    let reload_task = tokio::spawn(reload_on_hangup(
        Arc::clone(&store),
        config.mesh_config_path.clone(),
    ));

    let mut inbound_finished = false;
    let mut outbound_finished = false;
    let mut admin_finished = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, initiating graceful shutdown");
        }
        res = &mut inbound_task => {
            inbound_finished = true;
            report("inbound", res);
        }
        res = &mut outbound_task => {
            outbound_finished = true;
            report("outbound", res);
        }
        res = &mut admin_task => {
            admin_finished = true;
            report("admin", res);
        }
    }

    let _ = shutdown_tx.send(());
    reload_task.abort();

    if !inbound_finished {
        report("inbound", inbound_task.await);
    }
    if !outbound_finished {
        report("outbound", outbound_task.await);
    }
    if !admin_finished {
        report("admin", admin_task.await);
    }

    info!("shutdown complete");
    Ok(())
}

fn spawn_listener<F>(name: &'static str, serve: F) -> JoinHandle<()>
where
    F: Future<Output = mesh_sidecar::error::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = serve.await {
            error!("{} listener error: {}", name, e);
        }
    })
}

fn report(name: &str, res: Result<(), JoinError>) {
    match res {
        Ok(()) => info!("{} task completed", name),
        Err(err) => error!("{} task join error: {}", name, err),
    }
}

/// Rebuilds the active generation from disk on every SIGHUP.
#[cfg(unix)]
async fn reload_on_hangup(store: Arc<GenerationStore>, path: PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("cannot listen for SIGHUP, configuration reload disabled: {}", e);
            return;
        }
    };

    while hangup.recv().await.is_some() {
        info!(path = %path.display(), "received SIGHUP, reloading mesh configuration");
        if let Err(e) = store.reload_from_file(&path) {
            error!("reload failed: {}", e);
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_store: Arc<GenerationStore>, _path: PathBuf) {}
