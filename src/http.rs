use std::net::IpAddr;

const GET_PREFIX: &[u8] = b"GET ";

/// What an unlisted client asked for, judged from the first bytes it sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// `GET <enroll path>...`
    Enroll,
    /// Any other `GET` request.
    Page,
    /// Not a recognisable `GET` request line.
    Unknown,
}

/// Classifies a raw request prefix. Only the method and the start of the
/// path are inspected; nothing else of the request is parsed.
#[must_use]
pub fn classify(prefix: &[u8], enroll_path: &str) -> RequestKind {
    let Some(target) = prefix.strip_prefix(GET_PREFIX) else {
        return RequestKind::Unknown;
    };
    if !enroll_path.is_empty() && target.starts_with(enroll_path.as_bytes()) {
        RequestKind::Enroll
    } else {
        RequestKind::Page
    }
}

/// Builds a complete `200 OK` response around `body`. The connection is
/// closed after the write, so no keep-alive headers are sent.
#[must_use]
pub fn build_response(body: &[u8]) -> Vec<u8> {
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let mut response = Vec::with_capacity(head.len() + body.len());
    response.extend_from_slice(head.as_bytes());
    response.extend_from_slice(body);
    response
}

#[must_use]
pub fn enroll_success_body(ip: IpAddr) -> String {
    format!("SUCCESS {ip}")
}

#[must_use]
pub fn enroll_failure_body(ip: IpAddr) -> String {
    format!("FAILED {ip}")
}
