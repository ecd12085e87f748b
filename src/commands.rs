use crate::config::Config;
use crate::error::{ConfigError, HostError, Result};
use crate::plugin::{Launcher, LauncherOptions, PluginSource};
use tracing::{error, info, warn};

/// Validate the configuration and, unless `launch` is false, start every
/// plugin once to show the routes it registers.
pub async fn run_config_check(config: Config, launch: bool) -> Result<()> {
    info!("Checking configuration...");

    // Validate configuration
    crate::config::validate(&config)?;
    info!("✓ Configuration is valid");

    let source = PluginSource::from_config(&config.plugins);
    let candidates = source.enumerate().await?;
    info!("Found {} plugin candidate(s)", candidates.len());

    if !launch {
        for candidate in &candidates {
            info!("  {} ({})", candidate.name, candidate.path.display());
        }
        return Ok(());
    }

    let launcher = Launcher::new(LauncherOptions::from_config(&config));
    let mut all_ok = true;

    for candidate in candidates {
        info!("\nChecking plugin: {}", candidate.name);
        info!("  Path: {}", candidate.path.display());
        if let Some(prefix) = &candidate.mount_prefix {
            info!("  Mount prefix: {}", prefix);
        }

        match launcher.start(candidate).await {
            Ok(descriptor) => {
                info!("  ✓ Handshake and route retrieval passed");
                if descriptor.routes().is_empty() {
                    warn!("  ! No routes registered");
                }
                for route in descriptor.routes() {
                    info!(
                        "    {:<7} {:<30} {:?} -> {}",
                        route.method.as_deref().unwrap_or("*"),
                        route.pattern,
                        route.kind,
                        route.handler_id
                    );
                }
                launcher.stop(&descriptor).await;
            }
            Err(e) => {
                error!("  ✗ {}", e);
                all_ok = false;
            }
        }
    }

    if all_ok {
        info!("\n✓ All checks passed");
        Ok(())
    } else {
        Err(HostError::Config(ConfigError::Validation(
            "One or more plugins failed checks".to_string(),
        )))
    }
}
