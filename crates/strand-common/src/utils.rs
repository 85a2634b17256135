//! Utility functions for Strand

use if_addrs::IfAddr;

/// Get the local IP address
///
/// Returns the first non-loopback IPv4 address found,
/// or "127.0.0.1" as fallback.
///
/// # Examples
///
/// ```
/// use strand_common::local_ip;
///
/// let ip = local_ip();
/// assert!(!ip.is_empty());
/// ```
pub fn local_ip() -> String {
    if_addrs::get_if_addrs()
        .ok()
        .and_then(|addrs| {
            addrs
                .into_iter()
                .find(|iface| !iface.is_loopback() && matches!(iface.addr, IfAddr::V4(_)))
                .and_then(|iface| match iface.addr {
                    IfAddr::V4(addr) => Some(addr.ip.to_string()),
                    _ => None,
                })
        })
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Current wall-clock time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Parse a peer definition of the form `id@host:port`
///
/// # Examples
///
/// ```
/// use strand_common::parse_peer;
///
/// assert_eq!(
///     parse_peer("2@10.0.0.2:9220"),
///     Some((2, "10.0.0.2".to_string(), 9220))
/// );
/// assert_eq!(parse_peer("10.0.0.2:9220"), None);
/// ```
pub fn parse_peer(s: &str) -> Option<(u32, String, u16)> {
    let (id, addr) = s.trim().split_once('@')?;
    let (host, port) = addr.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((id.parse().ok()?, host.to_string(), port.parse().ok()?))
}

/// Plural suffix helper for log messages
pub fn plural(n: u64) -> &'static str {
    if n == 1 { "" } else { "s" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_local_ip() {
        let ip = local_ip();
        assert!(ip.parse::<std::net::Ipv4Addr>().is_ok());
    }

    #[test]
    fn test_parse_peer() {
        assert_eq!(
            parse_peer("0@localhost:9220"),
            Some((0, "localhost".to_string(), 9220))
        );
        assert_eq!(parse_peer("x@localhost:9220"), None);
        assert_eq!(parse_peer("1@:9220"), None);
        assert_eq!(parse_peer("1@localhost"), None);
        assert_eq!(parse_peer("1@localhost:99999"), None);
    }

    #[test]
    fn test_plural() {
        assert_eq!(plural(0), "s");
        assert_eq!(plural(1), "");
        assert_eq!(plural(2), "s");
    }

    proptest! {
        #[test]
        fn parse_peer_accepts_formatted(id in 0u32..64, port in 1u16..) {
            let s = format!("{}@node{}.local:{}", id, id, port);
            prop_assert_eq!(parse_peer(&s), Some((id, format!("node{}.local", id), port)));
        }
    }
}
