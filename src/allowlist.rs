use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, interval_at},
};
use tracing::{debug, info, warn};

use crate::security::{entry_matches, is_valid_entry};

/// On-disk shape of the allow-list file: `{"ips": ["1.2.3.4", ...]}`.
/// A bare JSON array is accepted on load as well. Any other object, such
/// as one with a misspelt key, is a parse error.
#[derive(Deserialize)]
#[serde(untagged)]
enum AllowListDocument {
    Wrapped(WrappedDocument),
    Bare(Vec<String>),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WrappedDocument {
    ips: Vec<String>,
}

#[derive(Serialize)]
struct AllowListOut<'a> {
    ips: &'a [String],
}

/// Client IP allow-list backed by a JSON file.
///
/// Readers always see a complete list: every update builds a new `Vec` and
/// swaps it in whole. Loads and appends are serialised so an enrollment is
/// never lost to a concurrent reload or another enrollment.
#[derive(Clone)]
pub struct AllowList {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    ips: ArcSwap<Vec<String>>,
    write_lock: Mutex<()>,
}

impl AllowList {
    /// Creates an empty store bound to `path` without touching the file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.into(),
                ips: ArcSwap::from_pointee(Vec::new()),
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// Creates the store and performs the initial load. A missing or
    /// malformed file is logged and leaves the list empty.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let list = Self::new(path);
        list.reload().await;
        list
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Current list snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<String>> {
        self.inner.ips.load_full()
    }

    /// Reads and parses the backing file, replacing the in-memory list on
    /// success. On failure the previous list is kept.
    pub async fn load(&self) -> Result<usize> {
        let _guard = self.inner.write_lock.lock().await;
        let ips = read_file(&self.inner.path).await?;
        let count = ips.len();
        self.inner.ips.store(Arc::new(ips));
        Ok(count)
    }

    /// [`load`](Self::load), logging instead of returning the failure.
    pub async fn reload(&self) {
        match self.load().await {
            Ok(count) => debug!(
                path = %self.inner.path.display(),
                entries = count,
                "Allow-list loaded"
            ),
            Err(e) => warn!(
                path = %self.inner.path.display(),
                error = %format!("{e:#}"),
                "Failed to load allow-list, keeping previous entries"
            ),
        }
    }

    /// Membership test. An empty list allows every address.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ips = self.inner.ips.load();
        ips.is_empty() || ips.iter().any(|entry| entry_matches(entry, ip))
    }

    /// Adds `ip` and rewrites the whole file. The in-memory list only
    /// changes once the file has been written successfully; an address that
    /// is already listed is not duplicated.
    pub async fn append_and_persist(&self, ip: IpAddr) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        let current = self.inner.ips.load_full();

        let mut next = current.as_ref().clone();
        let listed = next
            .iter()
            .any(|entry| entry.trim().parse::<IpAddr>().is_ok_and(|e| e == ip));
        if !listed {
            next.push(ip.to_string());
        }

        write_file(&self.inner.path, &next)
            .await
            .with_context(|| format!("Failed to persist {ip} to allow-list"))?;
        self.inner.ips.store(Arc::new(next));
        info!(client_ip = %ip, path = %self.inner.path.display(), "Allow-list updated");
        Ok(())
    }

    /// Reloads the file every `period` until the returned task is aborted.
    pub fn spawn_reload(&self, period: Duration) -> JoinHandle<()> {
        let list = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                list.reload().await;
            }
        })
    }
}

async fn read_file(path: &Path) -> Result<Vec<String>> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read allow-list file {}", path.display()))?;
    let document: AllowListDocument = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse {} as an allow-list", path.display()))?;
    let ips = match document {
        AllowListDocument::Wrapped(WrappedDocument { ips }) | AllowListDocument::Bare(ips) => ips,
    };
    for entry in ips.iter().filter(|entry| !is_valid_entry(entry)) {
        warn!(
            path = %path.display(),
            entry = %entry,
            "Ignoring invalid IP address or CIDR in allow-list"
        );
    }
    Ok(ips)
}

/// Writes to a sibling temp file and renames it over `path`, so readers of
/// the file never observe a partial document.
async fn write_file(path: &Path, ips: &[String]) -> Result<()> {
    let body = serde_json::to_vec_pretty(&AllowListOut { ips })
        .context("Failed to serialize allow-list")?;

    let mut tmp_name = path.file_name().map(OsString::from).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    tokio::fs::write(&tmp_path, &body)
        .await
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e).with_context(|| format!("Failed to replace {}", path.display()));
    }
    Ok(())
}
