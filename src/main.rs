use std::collections::HashMap;
use std::sync::Arc;

use rollgate::app::App;
use rollgate::config::Config;
use rollgate::ports::PortPool;
use rollgate::process::OsLauncher;
use rollgate::proxy::ProxyServer;
use rollgate::rpc::RpcServer;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rollgate=info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "rollgate.yaml".to_string());
    let config = Config::load(&config_path)?;
    info!(path = %config_path, apps = config.apps.len(), "Configuration loaded");

    let ports = Arc::new(PortPool::new(config.port_range.from, config.port_range.to));
    let launcher = Arc::new(OsLauncher);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut apps: HashMap<String, Arc<App>> = HashMap::new();
    for app_config in config.apps {
        let name = app_config.name.clone();
        let app = App::new(app_config, Arc::clone(&ports), launcher.clone());
        apps.insert(name, app);
    }
    let apps = Arc::new(apps);

    let mut tasks = Vec::new();

    for app in apps.values() {
        if let Err(e) = app.start_new_instance() {
            error!(app = %app.name(), error = %e, "Failed to start initial instance");
        }

        tasks.push(tokio::spawn(
            Arc::clone(app).run_reconcile(shutdown_rx.clone()),
        ));

        let proxy = ProxyServer::new(Arc::clone(app), shutdown_rx.clone());
        let name = app.name().to_string();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = proxy.run().await {
                error!(app = %name, error = %e, "Proxy server failed");
            }
        }));
    }

    let rpc = RpcServer::new(
        Arc::clone(&apps),
        config.rpc.bind_addr(),
        shutdown_rx.clone(),
    );
    tasks.push(tokio::spawn(async move {
        if let Err(e) = rpc.run().await {
            error!(error = %e, "Control API failed");
        }
    }));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Ask every running instance to drain before the reconcile loops stop.
    for app in apps.values() {
        if let Err(e) = app.stop_instances(None, false) {
            warn!(app = %app.name(), error = %e, "No instances to stop");
        }
    }

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }

    info!("Shutdown complete");
    Ok(())
}
