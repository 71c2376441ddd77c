//! Failed-authentication rate limiting, keyed by client IP.
//!
//! Every failed auth blocks the source IP for a fixed window; requests from
//! a blocked IP short-circuit with 429 until the window expires. A cleanup
//! pass evicts expired entries so the map cannot grow unbounded.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use tracing::warn;

/// How long an IP stays blocked after a failed authentication.
pub const BLOCK_PERIOD: Duration = Duration::from_secs(15);

pub struct RateLimiter {
    blocked: RwLock<HashMap<IpAddr, Instant>>,
    block_period: Duration,
}

impl RateLimiter {
    pub fn new(block_period: Duration) -> Self {
        Self {
            blocked: RwLock::new(HashMap::new()),
            block_period,
        }
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        match self.blocked.read() {
            Ok(map) => map
                .get(&ip)
                .is_some_and(|until| Instant::now() < *until),
            Err(_) => false,
        }
    }

    pub fn block(&self, ip: IpAddr) {
        if let Ok(mut map) = self.blocked.write() {
            map.insert(ip, Instant::now() + self.block_period);
        }
    }

    /// Drop expired entries. Called periodically from a background task.
    pub fn cleanup(&self) {
        if let Ok(mut map) = self.blocked.write() {
            let now = Instant::now();
            map.retain(|_, until| now < *until);
        }
    }

    pub fn log_failure(&self, ip: IpAddr, reason: &str, blocked: bool) {
        if blocked {
            warn!(ip = %ip, reason, "auth blocked");
        } else {
            warn!(ip = %ip, reason, "auth failed");
        }
    }
}

/// Derive the real client IP from the first trustworthy header, falling back
/// to the peer address.
///
/// Precedence: CF-Connecting-IP, True-Client-IP, X-Real-IP, first hop of
/// X-Forwarded-For, then the socket peer.
pub fn real_ip(headers: &HeaderMap, peer: IpAddr) -> IpAddr {
    for name in ["CF-Connecting-IP", "True-Client-IP", "X-Real-IP"] {
        if let Some(ip) = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_ip)
        {
            return ip;
        }
    }

    // X-Forwarded-For may hold a chain: client, proxy1, proxy2, ...
    if let Some(ip) = headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(parse_ip)
    {
        return ip;
    }

    peer
}

/// Parse an IP, tolerating an attached port.
fn parse_ip(s: &str) -> Option<IpAddr> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Some(ip);
    }
    s.parse::<std::net::SocketAddr>().ok().map(|sa| sa.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn block_and_expire() {
        let rl = RateLimiter::new(Duration::from_millis(30));
        let addr = ip("203.0.113.9");
        assert!(!rl.is_blocked(addr));
        rl.block(addr);
        assert!(rl.is_blocked(addr));
        std::thread::sleep(Duration::from_millis(60));
        assert!(!rl.is_blocked(addr));
    }

    #[test]
    fn cleanup_evicts_expired_entries() {
        let rl = RateLimiter::new(Duration::from_millis(10));
        rl.block(ip("203.0.113.1"));
        rl.block(ip("203.0.113.2"));
        std::thread::sleep(Duration::from_millis(30));
        rl.cleanup();
        assert!(rl.blocked.read().unwrap().is_empty());
    }

    #[test]
    fn header_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", "198.51.100.7, 10.0.0.1".parse().unwrap());
        headers.insert("CF-Connecting-IP", "192.0.2.44".parse().unwrap());
        let got = real_ip(&headers, ip("127.0.0.1"));
        assert_eq!(got, ip("192.0.2.44"));
    }

    #[test]
    fn forwarded_for_uses_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", "198.51.100.7, 10.0.0.1".parse().unwrap());
        assert_eq!(real_ip(&headers, ip("127.0.0.1")), ip("198.51.100.7"));
    }

    #[test]
    fn falls_back_to_peer() {
        let headers = HeaderMap::new();
        assert_eq!(real_ip(&headers, ip("10.1.2.3")), ip("10.1.2.3"));
    }

    #[test]
    fn invalid_header_values_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Real-IP", "not-an-ip".parse().unwrap());
        assert_eq!(real_ip(&headers, ip("10.1.2.3")), ip("10.1.2.3"));
    }

    #[test]
    fn parse_ip_strips_port() {
        assert_eq!(parse_ip("192.0.2.1:8080"), Some(ip("192.0.2.1")));
        assert_eq!(parse_ip("[2001:db8::1]:443"), Some(ip("2001:db8::1")));
        assert_eq!(parse_ip(""), None);
    }
}
