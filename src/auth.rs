use anyhow::{Context, Result};
use std::{net::IpAddr, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::allowlist::AllowList;
use crate::http::{
    RequestKind, build_response, classify, enroll_failure_body, enroll_success_body,
};
use crate::page::StaticPage;

/// Bytes read from an unlisted client before classifying its request.
pub const PREFIX_LEN: usize = 100;
pub const READ_DEADLINE: Duration = Duration::from_secs(3);

/// Everything the unauthenticated path needs, shared by all connections.
#[derive(Clone)]
pub struct AuthHandler {
    allowlist: AllowList,
    page: StaticPage,
    enroll_path: String,
    deadline: Duration,
}

impl AuthHandler {
    #[must_use]
    pub fn new(allowlist: AllowList, page: StaticPage, enroll_path: impl Into<String>) -> Self {
        Self {
            allowlist,
            page,
            enroll_path: enroll_path.into(),
            deadline: READ_DEADLINE,
        }
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Serves at most one HTTP exchange to a client that is not on the
    /// allow-list, then closes. Slow, silent or non-HTTP clients get no reply.
    #[tracing::instrument(skip(self, stream))]
    pub async fn handle<S>(&self, mut stream: S, client_ip: IpAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let prefix = match timeout(self.deadline, read_request_prefix(&mut stream)).await {
            Ok(Ok(Some(prefix))) => prefix,
            Ok(Ok(None)) => {
                debug!("Client closed before sending a request line");
                return Ok(());
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Failed to read request prefix");
                return Ok(());
            }
            Err(_) => {
                debug!(deadline_ms = self.deadline.as_millis(), "Request prefix read timed out");
                return Ok(());
            }
        };

        let body = match classify(&prefix, &self.enroll_path) {
            RequestKind::Enroll => match self.allowlist.append_and_persist(client_ip).await {
                Ok(()) => {
                    self.allowlist.reload().await;
                    info!("Client enrolled");
                    enroll_success_body(client_ip).into_bytes()
                }
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "Enrollment failed");
                    enroll_failure_body(client_ip).into_bytes()
                }
            },
            RequestKind::Page => {
                info!("Filtered client, responding with static page");
                self.page.body().to_vec()
            }
            RequestKind::Unknown => {
                debug!("Filtered client sent a non-GET request, closing");
                return Ok(());
            }
        };

        stream
            .write_all(&build_response(&body))
            .await
            .context("Failed to write HTTP response")?;
        stream.flush().await.context("Failed to flush HTTP response")?;
        let _ = stream.shutdown().await;
        Ok(())
    }
}

/// Reads until the first line ends, `PREFIX_LEN` bytes have arrived, or
/// the bytes so far can no longer start a `GET` line. Returns `None` on EOF
/// before any of those.
async fn read_request_prefix<S>(stream: &mut S) -> std::io::Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = [0u8; PREFIX_LEN];
    let mut filled = 0;
    loop {
        let n = stream.read(&mut buffer[filled..]).await?;
        if n == 0 {
            return Ok(None);
        }
        filled += n;
        let prefix = &buffer[..filled];
        if filled == PREFIX_LEN || prefix.contains(&b'\n') || !could_be_get(prefix) {
            return Ok(Some(prefix.to_vec()));
        }
    }
}

fn could_be_get(prefix: &[u8]) -> bool {
    let len = prefix.len().min(4);
    prefix[..len] == b"GET "[..len]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_test::io::Builder;

    const ENROLL: &str = "/auth/letmein";
    const PAGE: &[u8] = b"<html>nothing to see</html>";

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    async fn handler_with(dir: &tempfile::TempDir, ips: &str) -> (AuthHandler, AllowList) {
        let path = dir.path().join("whiteip.json");
        fs::write(&path, ips).unwrap();
        let allowlist = AllowList::open(&path).await;
        let handler = AuthHandler::new(allowlist.clone(), StaticPage::from_bytes(PAGE), ENROLL);
        (handler, allowlist)
    }

    mod responses {
        use super::*;

        #[tokio::test]
        async fn serves_static_page_to_other_gets() {
            let dir = tempfile::tempdir().unwrap();
            let (handler, _) = handler_with(&dir, r#"{"ips": ["10.0.0.1"]}"#).await;

            let stream = Builder::new()
                .read(b"GET /somepath HTTP/1.1\r\n\r\n")
                .write(&build_response(PAGE))
                .build();
            handler.handle(stream, localhost()).await.unwrap();
        }

        #[tokio::test]
        async fn enrolls_on_secret_path() {
            let dir = tempfile::tempdir().unwrap();
            let (handler, allowlist) = handler_with(&dir, r#"{"ips": ["10.0.0.1"]}"#).await;

            let stream = Builder::new()
                .read(b"GET /auth/letmein HTTP/1.1\r\nHost: relay\r\n\r\n")
                .write(&build_response(b"SUCCESS 127.0.0.1"))
                .build();
            handler.handle(stream, localhost()).await.unwrap();

            assert!(allowlist.contains(localhost()));
            let on_disk = fs::read_to_string(dir.path().join("whiteip.json")).unwrap();
            assert!(on_disk.contains("\"127.0.0.1\""));
        }

        #[tokio::test]
        async fn reports_failed_enrollment() {
            let dir = tempfile::tempdir().unwrap();
            let allowlist = AllowList::new(dir.path().join("missing-dir").join("whiteip.json"));
            let handler = AuthHandler::new(allowlist.clone(), StaticPage::from_bytes(PAGE), ENROLL);

            let stream = Builder::new()
                .read(b"GET /auth/letmein HTTP/1.1\r\n")
                .write(&build_response(b"FAILED 127.0.0.1"))
                .build();
            handler.handle(stream, localhost()).await.unwrap();

            assert!(allowlist.snapshot().is_empty());
        }

        #[tokio::test]
        async fn assembles_request_line_across_reads() {
            let dir = tempfile::tempdir().unwrap();
            let (handler, _) = handler_with(&dir, r#"{"ips": ["10.0.0.1"]}"#).await;

            let stream = Builder::new()
                .read(b"GE")
                .read(b"T /index.html HT")
                .read(b"TP/1.1\r\n")
                .write(&build_response(PAGE))
                .build();
            handler.handle(stream, localhost()).await.unwrap();
        }

        #[tokio::test]
        async fn classifies_once_prefix_len_bytes_arrive() {
            let dir = tempfile::tempdir().unwrap();
            let (handler, _) = handler_with(&dir, r#"{"ips": ["10.0.0.1"]}"#).await;

            let mut request = b"GET /".to_vec();
            request.resize(PREFIX_LEN, b'a');
            let stream = Builder::new()
                .read(&request)
                .write(&build_response(PAGE))
                .build();
            handler.handle(stream, localhost()).await.unwrap();
        }
    }

    mod silent_close {
        use super::*;

        #[tokio::test]
        async fn ignores_non_get_requests() {
            let dir = tempfile::tempdir().unwrap();
            let (handler, allowlist) = handler_with(&dir, r#"{"ips": ["10.0.0.1"]}"#).await;

            let stream = Builder::new()
                .read(b"POST /auth/letmein HTTP/1.1\r\n\r\n")
                .build();
            handler.handle(stream, localhost()).await.unwrap();
            assert!(!allowlist.contains(localhost()));
        }

        #[tokio::test]
        async fn ignores_binary_protocols_without_waiting_for_newline() {
            let dir = tempfile::tempdir().unwrap();
            let (handler, _) = handler_with(&dir, r#"{"ips": ["10.0.0.1"]}"#).await;

            let stream = Builder::new().read(b"\x16\x03\x01").build();
            handler.handle(stream, localhost()).await.unwrap();
        }

        #[tokio::test]
        async fn ignores_truncated_request_line() {
            let dir = tempfile::tempdir().unwrap();
            let (handler, _) = handler_with(&dir, r#"{"ips": ["10.0.0.1"]}"#).await;

            let stream = Builder::new().read(b"GET /auth/let").build();
            handler.handle(stream, localhost()).await.unwrap();
        }

        /// Connects, sends `request`, then waits for the handler to close
        /// the connection once its short deadline passes.
        async fn assert_closed_after_deadline(request: &[u8]) {
            let dir = tempfile::tempdir().unwrap();
            let (handler, _) = handler_with(&dir, r#"{"ips": ["10.0.0.1"]}"#).await;
            let handler = handler.with_deadline(Duration::from_millis(100));

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let server = tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                handler.handle(stream, localhost()).await
            });

            let mut client = TcpStream::connect(addr).await.unwrap();
            if !request.is_empty() {
                client.write_all(request).await.unwrap();
            }

            let mut reply = Vec::new();
            let read = timeout(Duration::from_secs(2), client.read_to_end(&mut reply)).await;
            assert!(read.is_ok(), "connection was not closed after the deadline");
            assert!(reply.is_empty());
            timeout(Duration::from_secs(2), server)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }

        #[tokio::test]
        async fn closes_partial_request_after_deadline() {
            assert_closed_after_deadline(b"GET /somepa").await;
        }

        #[tokio::test]
        async fn closes_silent_client_after_deadline() {
            assert_closed_after_deadline(b"").await;
        }
    }
}
