//! Portal runtime server entry point

use portal_runtime::api::ApiServer;
use portal_runtime::core::{Config, Logger};
use portal_runtime::runtime::{
    handlers, HotReloadResolver, LibraryHost, LoaderDispatch, PluginRuntime,
    RemoteRegistryScanner,
};
use portal_runtime::runtime::scanner::HttpSource;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let _logger = Logger::init(&config.logging)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Portal runtime starting");

    // Module host for native plugin libraries; shadow copies for hot reload
    // land in a scratch directory under the system temp dir.
    let scratch_dir = std::env::temp_dir().join("portal-runtime-modules");
    let host = Arc::new(LibraryHost::new(&scratch_dir)?);

    let resolver = Arc::new(HotReloadResolver::new(
        config.plugins.enable_hot_reload,
        &config.plugins.server_root,
    ));
    if config.plugins.enable_hot_reload {
        tracing::info!(
            server_root = %config.plugins.server_root.display(),
            "Hot reload enabled for project-owned modules"
        );
    }

    let dispatch = Arc::new(LoaderDispatch::new(
        host,
        resolver,
        Duration::from_secs(config.plugins.load_timeout_secs),
        config.plugins.plugin_dir.join(".portal-data"),
    ));
    handlers::register_builtin(&dispatch);

    let runtime = Arc::new(PluginRuntime::new(dispatch));
    runtime.discover(&config.plugins.plugin_dir).await?;

    // Keep the watcher alive for the lifetime of the server.
    let _watcher = if config.plugins.watch_plugin_dir {
        Some(runtime.spawn_plugin_dir_watcher(config.plugins.plugin_dir.clone())?)
    } else {
        None
    };

    let scanner = if config.remote.endpoints.is_empty() {
        None
    } else {
        let source = Arc::new(HttpSource::new(Duration::from_secs(
            config.remote.request_timeout_secs,
        ))?);
        let scanner = Arc::new(RemoteRegistryScanner::new(
            source,
            config.remote.endpoints.clone(),
            Duration::from_secs(config.remote.poll_interval_secs),
        ));

        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        Arc::clone(&scanner).start(tx);

        let event_runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                event_runtime.apply_watch_event(event).await;
            }
        });
        Some(scanner)
    };

    let server = ApiServer::new(&config, Arc::clone(&runtime));
    server.serve().await?;

    if let Some(scanner) = scanner {
        scanner.stop();
    }
    runtime.shutdown().await;

    Ok(())
}
