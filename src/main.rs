use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};

use oasis::commands;
use oasis::config;
use oasis::error::Result;
use oasis::logging;
use oasis::proxy::ProxyServer;
use oasis::state::AppState;
use oasis::web;

#[derive(Parser, Debug)]
#[command(name = "oasis-host")]
#[command(about = "Runs plugin executables as isolated processes behind one HTTP listener", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Scan this directory for plugin executables, overriding the configuration
    #[arg(short, long, value_name = "DIR", global = true)]
    plugin_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the plugin host (default)
    Run,
    /// Check configuration and launch each plugin once
    Check {
        /// Only list the candidates, do not start them
        #[arg(long)]
        no_launch: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Load configuration first; it decides how logging is set up
    let loaded = match &args.config {
        Some(path) => config::load_from_path(path).await,
        None => config::load_from_env_or_file().await,
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return Err(e);
        }
    };

    if let Some(dir) = args.plugin_dir {
        config.plugins.directory = Some(dir);
        config.plugins.entries.clear();
        config::validate(&config)?;
    }
    if args.json_logs {
        config.logging.json = true;
    }

    // Initialize tracing
    let _log_guard = logging::init(&config.logging, args.debug);
    match &args.config {
        Some(path) => info!("Configuration loaded successfully from {}", path.display()),
        None => info!("Configuration loaded successfully"),
    }

    // Handle commands
    if let Some(Command::Check { no_launch }) = args.command {
        return commands::run_config_check(config, !no_launch).await;
    }

    info!("Starting Oasis plugin host");
    match (&config.plugins.directory, config.plugins.entries.len()) {
        (Some(dir), _) => info!("Plugins are discovered in {}", dir.display()),
        (None, count) => info!("{} plugin(s) configured", count),
    }

    // Initialize application state
    let (state, _shutdown_rx) = AppState::new(config);

    // Binding is the only fatal startup error, so do it before any plugin runs
    let (addr, server) = ProxyServer::new(state.clone()).bind()?;
    info!("Plugin host listening on {}", addr);
    info!(
        "POST {} to reload plugins",
        state.config.listener.reload_path
    );

    // Initial load uses the same path as every later reload
    match state.reload.reload().await {
        Ok(report) if report.is_complete() => {
            info!(
                "Loaded {} plugin(s) with {} route(s)",
                report.started.len(),
                report.routes
            );
        }
        Ok(report) => {
            warn!(
                "Loaded {} plugin(s) with {} route(s); {} failed to start",
                report.started.len(),
                report.routes,
                report.failed.len()
            );
        }
        Err(e) => {
            error!("Initial plugin load failed: {}", e);
        }
    }

    let proxy_handle = tokio::spawn(server);

    // Start admin API if enabled
    let admin_handle = if state.config.admin.enabled {
        let admin_state = state.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = web::start_server(admin_state).await {
                error!("Admin API error: {}", e);
            }
        }))
    } else {
        None
    };

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down Oasis plugin host");

    // Graceful shutdown with timeout
    let shutdown_timeout = tokio::time::timeout(tokio::time::Duration::from_secs(30), async {
        // Signal shutdown to all components and stop every plugin
        state.shutdown().await;

        // Wait for tasks to complete
        if let Some(admin_handle) = admin_handle {
            let _ = tokio::join!(proxy_handle, admin_handle);
        } else {
            let _ = proxy_handle.await;
        }
    })
    .await;

    match shutdown_timeout {
        Ok(_) => {
            info!("Graceful shutdown completed");
        }
        Err(_) => {
            error!("Shutdown timeout exceeded, forcing exit");
            // Force exit after timeout
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
