//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Node configuration. File: ~/.config/p2pnet/config.toml or /etc/p2pnet/config.toml.
/// Env overrides: P2PNET_RENDEZVOUS, P2PNET_LISTEN_HOST, P2PNET_LISTEN_PORT,
/// P2PNET_BOOTSTRAP_PEERS, P2PNET_IDENTITY_KEY, P2PNET_RELAY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Peer group name; also the directory key and the RPC tag suffix.
    pub rendezvous: String,
    /// Listen host (default 0.0.0.0).
    pub listen_host: String,
    /// Listen TCP port (default 4001; 0 picks one).
    pub listen_port: u16,
    /// Full peer addresses (`.../p2p/<id>`) recorded at startup.
    pub bootstrap_peers: Vec<String>,
    /// Hex ed25519 secret key (32 bytes). A fresh identity is generated when absent.
    pub identity_key: Option<String>,
    pub relay_enabled: bool,
    /// mDNS on the local segment.
    pub local_discovery: bool,
    pub poll_interval_secs: u64,
    /// Directory lookup period after announce; 0 looks up once.
    pub directory_poll_secs: u64,
    pub dial_timeout_secs: u64,
    pub call_timeout_secs: u64,
    pub rpc_namespace: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rendezvous: "meetme".into(),
            listen_host: "0.0.0.0".into(),
            listen_port: 4001,
            bootstrap_peers: Vec::new(),
            identity_key: None,
            relay_enabled: false,
            local_discovery: true,
            poll_interval_secs: 3,
            directory_poll_secs: 30,
            dial_timeout_secs: 10,
            call_timeout_secs: 30,
            rpc_namespace: p2pnet_core::protocol::DEFAULT_RPC_NAMESPACE.into(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Result<Config> {
    let mut c = load_file()?.unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok())?;
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(s) = var("P2PNET_RENDEZVOUS") {
        c.rendezvous = s;
    }
    if let Some(s) = var("P2PNET_LISTEN_HOST") {
        c.listen_host = s;
    }
    if let Some(s) = var("P2PNET_LISTEN_PORT") {
        c.listen_port = parse_env("P2PNET_LISTEN_PORT", &s)?;
    }
    if let Some(s) = var("P2PNET_BOOTSTRAP_PEERS") {
        c.bootstrap_peers = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(s) = var("P2PNET_IDENTITY_KEY") {
        c.identity_key = Some(s);
    }
    if let Some(s) = var("P2PNET_RELAY") {
        c.relay_enabled = match s.trim() {
            "1" | "true" => true,
            "0" | "false" => false,
            other => {
                return Err(Error::Config(format!(
                    "P2PNET_RELAY: expected true/false/1/0, got {other:?}"
                )))
            }
        };
    }
    Ok(())
}

fn parse_env(key: &str, value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{key}: {e}")))
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/p2pnet/config.toml"));
    }
    out.push(PathBuf::from("/etc/p2pnet/config.toml"));
    out
}

/// The first existing file wins; a file that exists but does not parse is an error.
fn load_file() -> Result<Option<Config>> {
    for p in config_paths() {
        if p.exists() {
            let s = std::fs::read_to_string(&p)
                .map_err(|e| Error::Config(format!("{}: {e}", p.display())))?;
            let c = toml::from_str::<Config>(&s)
                .map_err(|e| Error::Config(format!("{}: {e}", p.display())))?;
            return Ok(Some(c));
        }
    }
    Ok(None)
}
