use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::Path;

use super::schema::Config;
use crate::error::{ConfigError, Result};

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("oasis.toml"))
        .merge(Json::file("oasis.json"))
        .merge(Yaml::file("oasis.yaml"))
        .merge(Yaml::file("oasis.yml"))
        // OASIS_LISTENER__PORT=9000 style overrides
        .merge(Env::prefixed("OASIS_").split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let base = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: Config = base
        .merge(Env::prefixed("OASIS_").split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

fn finish(config: Config) -> Result<Config> {
    let config = apply_env_substitutions(config)?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.admin.enabled
        && config.admin.port == config.listener.port
        && config.admin.host == config.listener.host
    {
        return Err(
            ConfigError::Validation("Listener and admin ports must be different".into()).into(),
        );
    }

    if !config.listener.reload_path.starts_with('/') {
        return Err(ConfigError::Validation(format!(
            "Reload path '{}' must start with '/'",
            config.listener.reload_path
        ))
        .into());
    }

    if config.listener.dispatch_timeout_ms == 0 || config.plugins.handshake_timeout_ms == 0 {
        return Err(ConfigError::Validation("Timeouts must be greater than 0".into()).into());
    }

    let handshake = &config.handshake;
    if handshake.magic_cookie_key.is_empty()
        || handshake.magic_cookie_key.contains('|')
        || handshake.magic_cookie_value.contains('|')
    {
        return Err(ConfigError::Validation(
            "Magic cookie key must be non-empty and neither key nor value may contain '|'".into(),
        )
        .into());
    }

    let plugins = &config.plugins;
    if plugins.directory.is_some() && !plugins.entries.is_empty() {
        return Err(ConfigError::Validation(
            "Configure either plugins.directory or plugins.entries, not both".into(),
        )
        .into());
    }

    let mut seen = std::collections::HashSet::new();
    for entry in &plugins.entries {
        if entry.name.is_empty() {
            return Err(ConfigError::Validation("Plugin entry with empty name".into()).into());
        }
        if !seen.insert(entry.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Duplicate plugin entry name '{}'",
                entry.name
            ))
            .into());
        }
        if let Some(prefix) = &entry.prefix {
            if !prefix.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "Plugin '{}' prefix '{}' must start with '/'",
                    entry.name, prefix
                ))
                .into());
            }
        }
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    if let Some(dir) = &config.plugins.directory {
        config.plugins.directory = Some(substitute_env_vars(&dir.to_string_lossy())?.into());
    }

    for entry in &mut config.plugins.entries {
        entry.path = substitute_env_vars(&entry.path.to_string_lossy())?.into();
        for arg in &mut entry.args {
            *arg = substitute_env_vars(arg)?;
        }
        for value in entry.env.values_mut() {
            *value = substitute_env_vars(value)?;
        }
    }

    config.handshake.magic_cookie_value = substitute_env_vars(&config.handshake.magic_cookie_value)?;

    Ok(config)
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        // ${VAR:-default}
        let (name, default) = match var_name.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (var_name, None),
        };
        match (std::env::var(name), default) {
            (Ok(value), _) => result = result.replace(&cap[0], &value),
            (Err(_), Some(default)) => result = result.replace(&cap[0], default),
            (Err(_), None) => {
                return Err(ConfigError::EnvVar(format!(
                    "Environment variable '{}' not found",
                    name
                ))
                .into())
            }
        }
    }

    Ok(result)
}
