//! `mc-proxy` configuration loading (SPEC_FULL.md §6, `[AMBIENT]`).
//!
//! TOML is the sole config source, loaded and validated by hand exactly as
//! `forwarder::config` does: a `Raw*` mirror of the file shape with
//! `Option` everywhere, defaults filled in where the table names one, and
//! a flat `ConfigError` enum for everything that can go wrong.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level `mc-proxy` configuration (§6's configuration table).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub schema_version: u32,
    pub proxy_port: u16,
    pub command_prefix: String,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub modules: ModulesConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub version: String,
    pub motd: Option<String>,
}

/// Upstream authentication material (§6). Only the offline/username form is
/// implemented (§1 Non-goal: no Microsoft/Mojang OAuth); the remaining
/// fields are parsed and carried so a real `AuthProvider` can be plugged in
/// without another config pass.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub username: String,
    pub password: Option<String>,
    pub access_token: Option<String>,
    pub client_token: Option<String>,
    pub session: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModulesConfig {
    /// Resolved to an absolute path; scanned at startup for `*.toml`
    /// manifests naming a registered module factory (§9 "Module plug-in
    /// ABI").
    pub dir: PathBuf,
    /// Module names to load after import.
    pub load: Vec<String>,
    /// `name -> opaque`, surfaced to each module as `module.config`.
    pub config: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    proxy_port: Option<u16>,
    command_prefix: Option<String>,
    server: Option<RawServerConfig>,
    auth: Option<RawAuthConfig>,
    modules: Option<RawModulesConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    address: Option<String>,
    port: Option<u16>,
    version: Option<String>,
    motd: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    username: Option<String>,
    password: Option<String>,
    access_token: Option<String>,
    client_token: Option<String>,
    session: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawModulesConfig {
    dir: Option<String>,
    load: Option<Vec<String>>,
    config: Option<HashMap<String, serde_json::Value>>,
}

/// Load config from the default path `/etc/mc-proxy/config.toml`.
pub fn load_config() -> Result<ProxyConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/mc-proxy/config.toml"))
}

pub fn load_config_from_path(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<ProxyConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let raw_server = raw
        .server
        .ok_or_else(|| ConfigError::MissingField("server".to_owned()))?;
    let address = raw_server
        .address
        .ok_or_else(|| ConfigError::MissingField("server.address".to_owned()))?;
    let server = ServerConfig {
        address,
        port: raw_server.port.unwrap_or(25565),
        version: raw_server.version.unwrap_or_else(|| "1.16.1".to_owned()),
        motd: raw_server.motd,
    };

    let raw_auth = raw
        .auth
        .ok_or_else(|| ConfigError::MissingField("auth".to_owned()))?;
    let username = raw_auth
        .username
        .ok_or_else(|| ConfigError::MissingField("auth.username".to_owned()))?;
    // `password`/`access_token`+`client_token` are mutually exclusive ways
    // of authenticating beyond offline mode; reject a config that names
    // more than one so main.rs never has to guess which one wins.
    let exclusive_present = [
        raw_auth.password.is_some(),
        raw_auth.access_token.is_some() || raw_auth.client_token.is_some(),
        raw_auth.session.is_some(),
    ]
    .iter()
    .filter(|present| **present)
    .count();
    if exclusive_present > 1 {
        return Err(ConfigError::InvalidValue(
            "auth: password, access_token/client_token, and session are mutually exclusive".into(),
        ));
    }
    let auth = AuthConfig {
        username,
        password: raw_auth.password,
        access_token: raw_auth.access_token,
        client_token: raw_auth.client_token,
        session: raw_auth.session,
    };

    let raw_modules = raw.modules.unwrap_or(RawModulesConfig {
        dir: None,
        load: None,
        config: None,
    });
    let dir = raw_modules.dir.unwrap_or_else(|| "./modules".to_owned());
    let dir = std::path::absolute(&dir).map_err(|e| {
        ConfigError::InvalidValue(format!("modules.dir '{dir}' could not be resolved: {e}"))
    })?;
    let modules = ModulesConfig {
        dir,
        load: raw_modules.load.unwrap_or_else(|| vec!["core".to_owned()]),
        config: raw_modules.config.unwrap_or_default(),
    };

    Ok(ProxyConfig {
        schema_version,
        proxy_port: raw.proxy_port.unwrap_or(25565),
        command_prefix: raw.command_prefix.unwrap_or_else(|| "/p:".to_owned()),
        server,
        auth,
        modules,
    })
}

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "Parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}
