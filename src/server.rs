use anyhow::{Context, Result, anyhow};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::{TcpListener, TcpStream, lookup_host};
use tracing::{error, info, warn};

use crate::allowlist::AllowList;
use crate::auth::AuthHandler;
use crate::config::ProxyConfig;
use crate::page::StaticPage;
use crate::proxy::{Gate, handle_connection};

/// Pause after a failed accept, so running out of file descriptors does not
/// turn the loop into a busy spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Source of inbound connections for the accept loop.
trait Acceptor {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        Self::accept(self).await
    }
}

/// Binds the listening port and serves connections.
pub async fn start_server(config: ProxyConfig) -> Result<()> {
    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;
    serve(listener, config).await
}

/// Runs the gate on an already bound listener.
pub async fn serve(listener: TcpListener, config: ProxyConfig) -> Result<()> {
    let target = resolve_target(&config.target_addr()).await?;

    let allowlist = AllowList::open(&config.allowlist_file).await;
    let reload_task = allowlist.spawn_reload(config.reload_interval);
    let page = StaticPage::load(config.page_file.as_deref());

    let gate = Arc::new(Gate {
        auth: AuthHandler::new(allowlist.clone(), page, config.enroll_path.clone()),
        allowlist,
        target,
        dump: config.dump,
    });

    info!(
        listen_addr = %listener.local_addr().context("Failed to get listener local address")?,
        target_addr = %target,
        allowlist_file = %gate.allowlist.path().display(),
        allowlist_entries = gate.allowlist.snapshot().len(),
        enroll_path = %config.enroll_path,
        dump = config.dump,
        "Relay listening"
    );

    accept_loop(&listener, &gate).await;
    reload_task.abort();
    Ok(())
}

/// Accept errors (EMFILE, ECONNABORTED, ...) only affect the connection
/// being accepted; the loop logs them and keeps serving.
async fn accept_loop<A: Acceptor>(listener: &A, gate: &Arc<Gate>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let gate = Arc::clone(gate);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, &gate).await {
                        error!(client_addr = %peer, error = %format!("{e:#}"), "Connection failed");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept TCP connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn resolve_target(addr: &str) -> Result<SocketAddr> {
    lookup_host(addr)
        .await
        .with_context(|| format!("Cannot resolve target address {addr}"))?
        .next()
        .ok_or_else(|| anyhow!("Target address {addr} resolved to nothing"))
}
