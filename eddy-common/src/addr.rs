//! Peer address parsing and canonicalization.
//!
//! Peer addresses travel in configs and route tables as `<host>:<port>:<family>` ASCII, where
//! family is 2 (IPv4) or 10 (IPv6). Because IPv6 literals contain colons themselves, parsing
//! splits on the *last two* separators.

use std::net::{IpAddr, SocketAddr};

use crate::error::{EddyError, EddyResult};

/// Numeric family value used on the wire and in address strings for IPv4.
pub const FAMILY_IPV4: i32 = 2;
/// Numeric family value used on the wire and in address strings for IPv6.
pub const FAMILY_IPV6: i32 = 10;

/// Parses `<host>:<port>:<family>` into a socket address.
///
/// # Errors
///
/// Returns `EddyError::InvalidConfig` when separators are missing, and `EddyError::Protocol`
/// when port, family, or host do not parse or the family contradicts the host literal.
pub fn parse_addr(spec: &str) -> EddyResult<SocketAddr> {
    let Some((rest, family_str)) = spec.rsplit_once(':') else {
        return Err(EddyError::InvalidConfig(
            "address must have <host>:<port>:<family> form",
        ));
    };
    let Some((host_str, port_str)) = rest.rsplit_once(':') else {
        return Err(EddyError::InvalidConfig(
            "address must have <host>:<port>:<family> form",
        ));
    };

    let family = family_str
        .parse::<i32>()
        .map_err(|error| EddyError::Protocol(format!("bad address family {family_str}: {error}")))?;
    let port = port_str
        .parse::<u16>()
        .map_err(|error| EddyError::Protocol(format!("bad port {port_str}: {error}")))?;

    // IPv6 literals may be wrapped in brackets in configs copied from URL-ish sources.
    let host_trimmed = host_str.trim_start_matches('[').trim_end_matches(']');
    let ip = host_trimmed
        .parse::<IpAddr>()
        .map_err(|error| EddyError::Protocol(format!("bad host {host_str}: {error}")))?;

    let ip = canonicalize_ip(ip);
    match (family, &ip) {
        (FAMILY_IPV4, IpAddr::V4(_)) | (FAMILY_IPV6, IpAddr::V6(_)) => Ok(SocketAddr::new(ip, port)),
        (FAMILY_IPV4 | FAMILY_IPV6, _) => Err(EddyError::Protocol(format!(
            "family {family} does not match host {host_str}"
        ))),
        _ => Err(EddyError::Protocol(format!("unknown address family {family}"))),
    }
}

/// Renders a socket address back into the `<host>:<port>:<family>` form.
#[must_use]
pub fn format_addr(addr: &SocketAddr) -> String {
    let family = if addr.is_ipv4() { FAMILY_IPV4 } else { FAMILY_IPV6 };
    format!("{}:{}:{}", addr.ip(), addr.port(), family)
}

/// Rewrites an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) to plain `AF_INET` form.
///
/// Accepted sockets on a dual-stack listener come back mapped; route tables and reconnect
/// bookkeeping key on the canonical IPv4 form.
#[must_use]
pub fn canonicalize(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(canonicalize_ip(addr.ip()), addr.port())
}

fn canonicalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::{canonicalize, format_addr, parse_addr};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::net::SocketAddr;

    #[rstest]
    fn parses_ipv4_spec() {
        let addr = parse_addr("127.0.0.1:1025:2").expect("ipv4 spec must parse");
        assert_that!(addr, eq("127.0.0.1:1025".parse::<SocketAddr>().unwrap()));
    }

    #[rstest]
    fn parses_ipv6_spec_with_embedded_colons() {
        let addr = parse_addr("2001:db8::1:1025:10").expect("ipv6 spec must parse");
        assert_that!(addr.port(), eq(1025));
        assert_that!(addr.is_ipv6(), eq(true));
    }

    #[rstest]
    fn rejects_family_host_mismatch() {
        let result = parse_addr("127.0.0.1:1025:10");
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn rejects_missing_family() {
        let result = parse_addr("127.0.0.1:1025");
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn unmaps_ipv4_in_ipv6() {
        let mapped: SocketAddr = "[::ffff:10.0.0.7]:2025".parse().unwrap();
        let canonical = canonicalize(mapped);
        assert_that!(canonical.is_ipv4(), eq(true));
        assert_that!(format_addr(&canonical), eq("10.0.0.7:2025:2"));
    }

    #[rstest]
    fn roundtrips_through_format() {
        let addr = parse_addr("192.168.1.3:20000:2").expect("spec must parse");
        assert_that!(format_addr(&addr), eq("192.168.1.3:20000:2"));
    }
}
