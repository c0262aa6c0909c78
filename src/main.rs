use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use toolbar_kit::bridge::{self, CapabilityBridge};
use toolbar_kit::config::Config;
use toolbar_kit::exec::ProcessEngine;
use toolbar_kit::plugins::{JsonPluginStore, PluginRuntime};
use toolbar_kit::toolbar::{ToolbarService, ToolbarStore};

fn print_help() {
    println!(
        "\
toolbar-kit v{}

Backend for a configurable desktop toolbar. Speaks line-delimited JSON with
the toolbar UI on stdin/stdout; logs go to stderr.

USAGE:
    toolbar-kit [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/toolbar.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, toolbar_kit=debug,warn)

EXAMPLES:
    toolbar-kit                             # uses config/toolbar.toml
    toolbar-kit ~/.config/toolbar.toml      # custom config path
    RUST_LOG=debug toolbar-kit              # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("toolbar-kit v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // stdout carries the host protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("toolbar_kit=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/toolbar.toml".to_string());

    info!("toolbar-kit v{}", env!("CARGO_PKG_VERSION"));
    info!("Loading configuration from {config_path}");
    let config = Config::load_or_default(&config_path)?;

    let elevation = config.execution.elevation.resolve()?;
    info!("Elevation: {elevation:?}");
    info!("Execution timeout: {}s", config.execution.timeout().as_secs());
    let engine = ProcessEngine::new(elevation, config.execution.timeout());

    let store = Arc::new(JsonPluginStore::new(&config.plugins.registry_file));
    let runtime = Arc::new(PluginRuntime::new(engine.clone()).with_store(store));

    if config.plugins.enabled {
        // A broken plugin directory costs the plugins, not the toolbar
        match runtime.discover(&config.plugins.directory).await {
            Ok(report) => {
                for failure in &report.failures {
                    warn!("Skipped {}: {}", failure.path.display(), failure.reason);
                }
            }
            Err(e) => error!("Plugin discovery failed: {e}"),
        }
        let restored = runtime.restore().await;
        if !restored.loaded.is_empty() {
            info!("Restored {} plugin(s) from the plugin list", restored.loaded.len());
        }
    } else {
        info!("Plugins disabled in configuration");
    }
    info!("Plugins: {} loaded", runtime.len().await);

    let toolbar = Arc::new(
        ToolbarService::open(ToolbarStore::new(&config.toolbar.config_path)).await,
    );
    let bridge = Arc::new(CapabilityBridge::new(engine, runtime.clone()));

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    tokio::select! {
        result = bridge::serve(bridge, toolbar, stdin, stdout) => {
            match result {
                Ok(()) => info!("Host closed the connection, exiting"),
                Err(e) => error!("Host transport error: {e:#}"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
        }
    }

    runtime.shutdown_all().await;
    Ok(())
}
