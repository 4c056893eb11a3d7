//! Address classification: is an IP literal inside a private, reserved,
//! loopback, link-local, multicast or documentation range.
//!
//! Classification is pure and synchronous. Hostnames are never resolved here;
//! see [`super::rebinding`] for that.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IPv4 ranges that must never be reached on behalf of a remote caller.
const IPV4_RESERVED: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 8),      // "this" network
    (Ipv4Addr::new(10, 0, 0, 0), 8),     // RFC 1918
    (Ipv4Addr::new(100, 64, 0, 0), 10),  // carrier-grade NAT
    (Ipv4Addr::new(127, 0, 0, 0), 8),    // loopback
    (Ipv4Addr::new(169, 254, 0, 0), 16), // link-local, cloud metadata
    (Ipv4Addr::new(172, 16, 0, 0), 12),  // RFC 1918
    (Ipv4Addr::new(192, 0, 0, 0), 24),   // IETF protocol assignments
    (Ipv4Addr::new(192, 0, 2, 0), 24),   // TEST-NET-1
    (Ipv4Addr::new(192, 88, 99, 0), 24), // 6to4 relay anycast
    (Ipv4Addr::new(192, 168, 0, 0), 16), // RFC 1918
    (Ipv4Addr::new(198, 18, 0, 0), 15),  // benchmarking
    (Ipv4Addr::new(198, 51, 100, 0), 24), // TEST-NET-2
    (Ipv4Addr::new(203, 0, 113, 0), 24), // TEST-NET-3
    (Ipv4Addr::new(224, 0, 0, 0), 4),    // multicast
    (Ipv4Addr::new(240, 0, 0, 0), 4),    // reserved, includes broadcast
];

/// IPv6 ranges checked explicitly. `::` and `::1` are handled separately.
const IPV6_RESERVED: &[(Ipv6Addr, u8)] = &[
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),  // unique local
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10), // link-local
    (Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0), 8),  // multicast
    (Ipv6Addr::new(0x2001, 0x0db8, 0, 0, 0, 0, 0, 0), 32), // documentation
    (Ipv6Addr::new(0x2001, 0x0010, 0, 0, 0, 0, 0, 0), 28), // ORCHID
];

/// Classify a textual IP literal.
///
/// Accepts bare literals (`10.0.0.1`, `::1`), bracketed IPv6 (`[::1]`) and
/// zone-suffixed IPv6 (`fe80::1%eth0`). Text that is not an IP literal
/// returns `false`; callers that hold a hostname must resolve it first.
#[must_use]
pub fn is_reserved_or_internal(literal: &str) -> bool {
    parse_ip_literal(literal).is_some_and(is_reserved_ip)
}

/// Parse an IP literal, stripping brackets and any IPv6 zone identifier.
#[must_use]
pub fn parse_ip_literal(literal: &str) -> Option<IpAddr> {
    let trimmed = literal.trim();
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    let without_zone = unbracketed
        .split_once('%')
        .map_or(unbracketed, |(addr, _zone)| addr);
    without_zone.parse::<IpAddr>().ok()
}

/// Classify a parsed address.
#[must_use]
pub fn is_reserved_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_reserved_ipv4(v4),
        IpAddr::V6(v6) => is_reserved_ipv6(v6),
    }
}

/// Check an IPv4 address against [`IPV4_RESERVED`].
#[must_use]
pub fn is_reserved_ipv4(addr: Ipv4Addr) -> bool {
    let bits = u32::from(addr);
    IPV4_RESERVED.iter().any(|(network, prefix)| {
        let mask = prefix_mask_v4(*prefix);
        bits & mask == u32::from(*network) & mask
    })
}

/// Check an IPv6 address, recursing into IPv4 for embedded forms.
#[must_use]
pub fn is_reserved_ipv6(addr: Ipv6Addr) -> bool {
    if addr.is_unspecified() || addr.is_loopback() {
        return true;
    }

    if let Some(embedded) = embedded_ipv4(addr) {
        return is_reserved_ipv4(embedded);
    }

    let bits = u128::from(addr);
    IPV6_RESERVED.iter().any(|(network, prefix)| {
        let mask = prefix_mask_v6(*prefix);
        bits & mask == u128::from(*network) & mask
    })
}

fn prefix_mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn prefix_mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

/// Extract an IPv4 address tunnelled inside an IPv6 one.
///
/// Covers IPv4-mapped (`::ffff:a.b.c.d`), the deprecated IPv4-compatible form
/// (`::a.b.c.d`), NAT64 (`64:ff9b::a.b.c.d`) and 6to4 (`2002:aabb:ccdd::`).
#[allow(clippy::cast_possible_truncation)] // Extracting u8 octets from u16 IPv6 segments is intentional
fn embedded_ipv4(addr: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(mapped) = addr.to_ipv4_mapped() {
        return Some(mapped);
    }

    let s = addr.segments();
    let tail = Ipv4Addr::new(
        (s[6] >> 8) as u8,
        s[6] as u8,
        (s[7] >> 8) as u8,
        s[7] as u8,
    );

    // :: and ::1 were handled by the caller
    if s[..6].iter().all(|seg| *seg == 0) {
        return Some(tail);
    }

    if s[0] == 0x0064 && s[1] == 0xff9b && s[2..6].iter().all(|seg| *seg == 0) {
        return Some(tail);
    }

    if s[0] == 0x2002 {
        return Some(Ipv4Addr::new(
            (s[1] >> 8) as u8,
            s[1] as u8,
            (s[2] >> 8) as u8,
            s[2] as u8,
        ));
    }

    None
}
