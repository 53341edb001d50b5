#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::cooldown::DEFAULT_UPDATE_COOLDOWN;
use crate::jobs::DEFAULT_JOB_RETENTION;
use crate::ratelimit::{DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 5051;
/// Listening on all interfaces by default so the phone on the couch can reach
/// a laptop-hosted instance.
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_DOWNLOAD_ROOT: &str = "downloads";
pub const DEFAULT_WWW_ROOT: &str = "www";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub download_root: PathBuf,
    pub www_root: PathBuf,
    pub port: u16,
    pub host: String,
    pub auth: AuthConfig,
    pub limits: LimitConfig,
}

/// Credential expectations for HTTP basic auth. Comparison is plain equality.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub required: bool,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy)]
pub struct LimitConfig {
    pub rate_limit: usize,
    pub rate_window: Duration,
    pub job_retention: Duration,
    pub update_cooldown: Duration,
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    resolve_runtime_config(RuntimeOverrides::default())
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub download_root: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let download_root = overrides
        .download_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("DOWNLOAD_ROOT", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_DOWNLOAD_ROOT.to_string());
    let www_root = overrides
        .www_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("WWW_ROOT", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_WWW_ROOT.to_string());
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("TUBEDROP_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        })
        .or_else(|| lookup_value("TUBEDROP_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let auth = build_auth_config(file_vars, &env_lookup)?;
    let limits = build_limit_config(file_vars, &env_lookup);

    Ok(RuntimeConfig {
        download_root: PathBuf::from(download_root),
        www_root: PathBuf::from(www_root),
        port,
        host,
        auth,
        limits,
    })
}

fn build_auth_config(
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Result<AuthConfig> {
    let required = lookup_value("TUBEDROP_AUTH", file_vars, env_lookup)
        .map(|value| parse_switch(&value))
        .unwrap_or(false);
    let username = lookup_value("TUBEDROP_USERNAME", file_vars, env_lookup).unwrap_or_default();
    let password = lookup_value("TUBEDROP_PASSWORD", file_vars, env_lookup).unwrap_or_default();

    if required && (username.is_empty() || password.is_empty()) {
        return Err(anyhow!(
            "TUBEDROP_AUTH is enabled but TUBEDROP_USERNAME/TUBEDROP_PASSWORD are not set"
        ));
    }

    Ok(AuthConfig {
        required,
        username,
        password,
    })
}

fn build_limit_config(
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> LimitConfig {
    // Malformed numbers fall back to the defaults rather than refusing to
    // boot; the values only tune admission behaviour.
    let rate_limit = lookup_value("TUBEDROP_RATE_LIMIT", file_vars, env_lookup)
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(DEFAULT_RATE_LIMIT);
    let rate_window = lookup_duration_secs("TUBEDROP_RATE_WINDOW", file_vars, env_lookup)
        .unwrap_or(DEFAULT_RATE_WINDOW);
    let job_retention = lookup_duration_secs("TUBEDROP_JOB_RETENTION", file_vars, env_lookup)
        .unwrap_or(DEFAULT_JOB_RETENTION);
    let update_cooldown = lookup_duration_secs("TUBEDROP_UPDATE_COOLDOWN", file_vars, env_lookup)
        .unwrap_or(DEFAULT_UPDATE_COOLDOWN);

    LimitConfig {
        rate_limit,
        rate_window,
        job_retention,
        update_cooldown,
    }
}

fn lookup_duration_secs(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<Duration> {
    lookup_value(key, file_vars, env_lookup)
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn parse_switch(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
