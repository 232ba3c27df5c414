//! Configuration loading from `.env` files.

use std::{env, fs, path::Path, str::FromStr, time::Duration};

use anyhow::{anyhow, Context, Result};

pub const DEFAULT_BIND_HTTP: &str = "127.0.0.1:7777";
pub const DEFAULT_BIND_WS: &str = "127.0.0.1:8080";
pub const DEFAULT_RELAY: &str = "ws://127.0.0.1:8080";

/// Every key this crate reads with the value written to a fresh env file.
pub const DEFAULTS: [(&str, &str); 11] = [
    ("BIND_HTTP", DEFAULT_BIND_HTTP),
    ("BIND_WS", DEFAULT_BIND_WS),
    ("VERIFY_SIG", "0"),
    ("RELAYS", DEFAULT_RELAY),
    ("BOOTSTRAP_RELAY", DEFAULT_RELAY),
    ("TOR_SOCKS", ""),
    ("IDENTIFIER", "addr"),
    ("TTL", "600"),
    ("ENDPOINT_PORT", "8080"),
    ("TIMEOUT_SECS", "15"),
    ("SECRET_KEY", ""),
];

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// HTTP bind address of the relay, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// WebSocket bind address of the relay.
    pub bind_ws: String,
    /// Enable Schnorr signature verification on ingest.
    pub verify_sig: bool,
    /// Relays the publisher submits to. Quote the value in the env file when
    /// it contains spaces.
    pub relays: Vec<String>,
    /// Relay the resolver asks first.
    pub bootstrap_relay: String,
    /// Optional Tor SOCKS proxy (host:port) for outgoing relay connections.
    pub tor_socks: Option<String>,
    /// `d` tag of the directory record.
    pub identifier: String,
    pub ttl: u64,
    /// Port advertised with every discovered address.
    pub endpoint_port: u16,
    pub timeout: Duration,
    /// Hex secret key of this identity.
    pub secret_key: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file. Absent keys fall back to
    /// their defaults; present but unparsable values are errors.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let relays = csv_strings(var_or("RELAYS", DEFAULT_RELAY));
        Ok(Self {
            bind_http: var_or("BIND_HTTP", DEFAULT_BIND_HTTP),
            bind_ws: var_or("BIND_WS", DEFAULT_BIND_WS),
            verify_sig: var_or("VERIFY_SIG", "0") == "1",
            relays,
            bootstrap_relay: var_or("BOOTSTRAP_RELAY", DEFAULT_RELAY),
            tor_socks: non_empty("TOR_SOCKS"),
            identifier: var_or("IDENTIFIER", "addr"),
            ttl: parse_var("TTL", 600)?,
            endpoint_port: parse_var("ENDPOINT_PORT", 8080)?,
            timeout: Duration::from_secs(parse_var("TIMEOUT_SECS", 15)?),
            secret_key: non_empty("SECRET_KEY"),
        })
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn parse_var<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{key}={raw:?}: {e}")),
        None => Ok(default),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Create a default `.env` file if one is not already present at `path`.
pub fn ensure_env_file(path: &str) -> Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let content: String = DEFAULTS
        .iter()
        .map(|(key, value)| format!("{key}={value}\n"))
        .collect();
    fs::write(env_path, content).with_context(|| format!("writing {path}"))?;
    Ok(())
}

/// Set `key=value` in the env file, replacing an existing line or appending.
pub fn write_env_var(path: &str, key: &str, value: &str) -> Result<()> {
    let content = fs::read_to_string(path).unwrap_or_default();
    let prefix = format!("{key}=");
    let mut new_content = String::new();
    let mut replaced = false;
    for line in content.lines() {
        if line.starts_with(&prefix) {
            new_content.push_str(&format!("{key}={value}\n"));
            replaced = true;
        } else {
            new_content.push_str(line);
            new_content.push('\n');
        }
    }
    if !replaced {
        new_content.push_str(&format!("{key}={value}\n"));
    }
    fs::write(path, new_content)?;
    env::set_var(key, value);
    Ok(())
}
