use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};

/// Returns the client IP of a peer address as it is stored in the allow-list.
/// IPv4-mapped IPv6 peers (`[::ffff:1.2.3.4]:port` on a dual-stack listener)
/// are reported as plain IPv4 and bracketed literals lose their brackets.
#[must_use]
pub fn client_ip(peer: SocketAddr) -> IpAddr {
    match peer.ip() {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 @ IpAddr::V4(_) => v4,
    }
}

/// Checks a single allow-list entry against a client IP.
/// An entry may be a single address or a CIDR block; anything else never
/// matches.
#[must_use]
pub fn entry_matches(entry: &str, ip: IpAddr) -> bool {
    let entry = entry.trim();
    if let Ok(allowed_ip) = entry.parse::<IpAddr>() {
        allowed_ip == ip
    } else if let Ok(allowed_net) = entry.parse::<IpNet>() {
        allowed_net.contains(&ip)
    } else {
        false
    }
}

#[must_use]
pub fn is_valid_entry(entry: &str) -> bool {
    let entry = entry.trim();
    entry.parse::<IpAddr>().is_ok() || entry.parse::<IpNet>().is_ok()
}
