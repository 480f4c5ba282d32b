#![forbid(unsafe_code)]

//! Runtime configuration for the songfetch server.
//!
//! Values are resolved in order: explicit overrides (CLI flags), process
//! environment variables, the `.env` file, then built-in defaults. Every key
//! has a default so the server runs out of the box in a fresh checkout.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DOWNLOAD_ROOT: &str = "downloads";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_COOKIES_FILE: &str = "cookies.txt";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub download_root: PathBuf,
    pub port: u16,
    pub host: String,
    pub cookies_file: PathBuf,
    pub ytdlp_bin: PathBuf,
}

/// Values supplied on the command line that take precedence over both the
/// environment and the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub download_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub cookies_file: Option<PathBuf>,
    pub ytdlp_bin: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn load_runtime_settings() -> Result<RuntimeSettings> {
    resolve_runtime_settings(RuntimeOverrides::default())
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_settings(&file_vars, env_var_string, overrides)
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let download_root = overrides
        .download_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("DOWNLOAD_ROOT", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_DOWNLOAD_ROOT.to_string());
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("SONGFETCH_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        })
        .or_else(|| lookup_value("SONGFETCH_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let cookies_file = overrides
        .cookies_file
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("COOKIES_FILE", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_COOKIES_FILE.to_string());
    let ytdlp_bin = overrides
        .ytdlp_bin
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("YTDLP_BIN", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_YTDLP_BIN.to_string());

    Ok(RuntimeSettings {
        download_root: PathBuf::from(download_root),
        port,
        host,
        cookies_file: PathBuf::from(cookies_file),
        ytdlp_bin: PathBuf::from(ytdlp_bin),
    })
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
