use anyhow::{Context, Result};
use socket2::{SockRef, TcpKeepalive};
use std::{fmt, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::allowlist::AllowList;
use crate::auth::AuthHandler;
use crate::security::client_ip;

pub const BUFFER_SIZE: usize = 500 * 1024;
pub const CLIENT_KEEPALIVE: Duration = Duration::from_secs(60);
pub const TARGET_KEEPALIVE: Duration = Duration::from_secs(60 * 60);

/// Per-server state handed to every connection handler.
#[derive(Clone)]
pub struct Gate {
    pub allowlist: AllowList,
    pub auth: AuthHandler,
    pub target: SocketAddr,
    pub dump: bool,
}

#[derive(Clone, Copy, Debug)]
pub enum Direction {
    ClientToTarget,
    TargetToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ClientToTarget => "client->target",
            Self::TargetToClient => "target->client",
        })
    }
}

/// Classifies an accepted connection once and hands it to the relay or to
/// the unauthenticated HTTP path.
#[tracing::instrument(skip(stream, gate), fields(client_ip = %client_ip(peer)))]
pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, gate: &Gate) -> Result<()> {
    let ip = client_ip(peer);
    set_keepalive(&stream, CLIENT_KEEPALIVE);

    if gate.allowlist.contains(ip) {
        debug!("Client allowed, relaying to target");
        relay(stream, gate.target, gate.dump).await
    } else {
        debug!("Client not on allow-list");
        gate.auth.handle(stream, ip).await
    }
}

/// Dials `target_addr` and copies bytes both ways until either side closes
/// or fails. Both sockets are closed when this returns.
#[tracing::instrument(skip(client, dump))]
pub async fn relay(client: TcpStream, target_addr: SocketAddr, dump: bool) -> Result<()> {
    debug!("Attempting to connect to target server");
    let target = TcpStream::connect(target_addr)
        .await
        .with_context(|| format!("Failed to connect to target {target_addr}"))?;
    set_keepalive(&target, TARGET_KEEPALIVE);
    info!("Connected to target server");

    let (client_reader, client_writer) = client.into_split();
    let (target_reader, target_writer) = target.into_split();

    let mut directions = JoinSet::new();
    directions.spawn(copy_direction(
        client_reader,
        target_writer,
        Direction::ClientToTarget,
        dump,
    ));
    directions.spawn(copy_direction(
        target_reader,
        client_writer,
        Direction::TargetToClient,
        dump,
    ));

    // Whichever direction ends first tears down the session: aborting the
    // other drops its halves, and with them the last handles on both sockets.
    let first = directions.join_next().await;
    directions.abort_all();
    while directions.join_next().await.is_some() {}

    info!("Proxy connection closed");
    match first {
        Some(Ok(result)) => result.map(|_| ()),
        Some(Err(e)) => Err(e).context("Relay task failed"),
        None => Ok(()),
    }
}

async fn copy_direction(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    direction: Direction,
    dump: bool,
) -> Result<u64> {
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                debug!(%direction, bytes = total, "Connection closed");
                break;
            }
            Ok(n) => {
                let data = &buffer[..n];
                if dump {
                    info!(target: "dump", %direction, bytes = n, data = %data.escape_ascii(), "Raw data");
                }
                if let Err(e) = writer.write_all(data).await {
                    debug!(%direction, error = %e, bytes = n, "Failed to write");
                    return Err(e).with_context(|| format!("Failed to forward {direction} data"));
                }
                total += n as u64;
            }
            Err(e) => {
                error!(%direction, error = %e, "Failed to read");
                break;
            }
        }
    }
    Ok(total)
}

fn set_keepalive(stream: &TcpStream, idle: Duration) {
    let keepalive = TcpKeepalive::new().with_time(idle);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "Failed to enable TCP keep-alive");
    }
}
