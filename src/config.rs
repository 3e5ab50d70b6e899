use anyhow::{Context, Result, anyhow};
use rand::{Rng, distributions::Alphanumeric};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ALLOWLIST_FILE: &str = "whiteip.json";
pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";
pub const DEFAULT_TARGET_HOST: &str = "127.0.0.1";
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(30);
const ENROLL_TOKEN_LEN: usize = 16;

/// Fully resolved server configuration. Built once before the listener
/// starts and never mutated afterwards.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_ip: String,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub allowlist_file: PathBuf,
    pub page_file: Option<PathBuf>,
    pub enroll_path: String,
    pub dump: bool,
    pub reload_interval: Duration,
}

/// Optional TOML config file. Every key mirrors a command-line flag.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub listen_ip: Option<String>,
    pub listen_port: Option<u16>,
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
    pub allowlist_file: Option<PathBuf>,
    pub page_file: Option<PathBuf>,
    pub enroll_path: Option<String>,
    pub dump: Option<bool>,
    pub reload_interval_secs: Option<u64>,
}

/// Values supplied on the command line; these take precedence over the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub listen_port: Option<u16>,
    pub target_port: Option<u16>,
    pub allowlist_file: Option<PathBuf>,
    pub page_file: Option<PathBuf>,
    pub enroll_path: Option<String>,
    pub dump: bool,
}

pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
}

impl ProxyConfig {
    /// Merges the config file with command-line overrides. Both ports are
    /// required; a missing enrollment path is replaced by a random one.
    pub fn resolve(file: FileConfig, cli: Overrides) -> Result<Self> {
        let listen_port = cli
            .listen_port
            .or(file.listen_port)
            .ok_or_else(|| anyhow!("Exposed port is required (--from or listen_port)"))?;
        let target_port = cli
            .target_port
            .or(file.target_port)
            .ok_or_else(|| anyhow!("Target port is required (--to or target_port)"))?;

        let enroll_path = match cli.enroll_path.or(file.enroll_path) {
            Some(path) if !path.trim().is_empty() => normalize_enroll_path(path.trim()),
            _ => random_enroll_path(),
        };

        Ok(Self {
            listen_ip: file
                .listen_ip
                .unwrap_or_else(|| DEFAULT_LISTEN_IP.to_string()),
            listen_port,
            target_host: file
                .target_host
                .unwrap_or_else(|| DEFAULT_TARGET_HOST.to_string()),
            target_port,
            allowlist_file: cli
                .allowlist_file
                .or(file.allowlist_file)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ALLOWLIST_FILE)),
            page_file: cli.page_file.or(file.page_file),
            enroll_path,
            dump: cli.dump || file.dump.unwrap_or(false),
            reload_interval: file
                .reload_interval_secs
                .filter(|secs| *secs > 0)
                .map_or(DEFAULT_RELOAD_INTERVAL, Duration::from_secs),
        })
    }

    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_ip, self.listen_port)
    }

    #[must_use]
    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

fn normalize_enroll_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Generates `/auth/<token>` so the enrollment URL cannot be guessed from
/// the source alone.
#[must_use]
pub fn random_enroll_path() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ENROLL_TOKEN_LEN)
        .map(char::from)
        .collect();
    format!("/auth/{token}")
}
