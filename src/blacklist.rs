// src/blacklist.rs
//! CIDR-based peer address policy
//!
//! Matching rules:
//! - same-family subnets compare the top `prefix` bits
//! - an IPv4 address tested against an IPv6 subnet is promoted to its
//!   IPv4-mapped form (`::ffff:a.b.c.d`)
//! - an IPv4-mapped IPv6 address tested against an IPv4 subnet is stripped
//!   back to IPv4
//! - any other family combination never matches

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{RelayError, RelayResult};

/// A `(network, prefix_length)` subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: IpAddr,
    prefix: u8,
}

impl Subnet {
    /// Create a subnet, validating the prefix length for the family
    pub fn new(network: IpAddr, prefix: u8) -> RelayResult<Self> {
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(RelayError::Configuration(format!(
                "Prefix /{} too long for {}",
                prefix, network
            )));
        }
        Ok(Self { network, prefix })
    }

    /// Whether the address falls inside this subnet
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => v4_match(net, ip, self.prefix),
            (IpAddr::V6(net), IpAddr::V6(ip)) => v6_match(net, ip, self.prefix),
            (IpAddr::V6(net), IpAddr::V4(ip)) => v6_match(net, ip.to_ipv6_mapped(), self.prefix),
            (IpAddr::V4(net), IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
                Some(v4) => v4_match(net, v4, self.prefix),
                None => false,
            },
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

fn v4_match(net: Ipv4Addr, ip: Ipv4Addr, prefix: u8) -> bool {
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    };
    (u32::from(net) & mask) == (u32::from(ip) & mask)
}

fn v6_match(net: Ipv6Addr, ip: Ipv6Addr, prefix: u8) -> bool {
    let mask = if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix as u32)
    };
    (u128::from(net) & mask) == (u128::from(ip) & mask)
}

/// Ordered subnet list checked against client and peer addresses.
///
/// A fixed initial list is always merged in ahead of the configured
/// entries: `0.0.0.0/8`, `::/128`, `2001::/32` (Teredo), `2002::/16`
/// (6to4).
#[derive(Debug, Clone)]
pub struct Blacklist {
    subnets: Vec<Subnet>,
}

impl Blacklist {
    /// Build the blacklist from configured entries plus the fixed initial
    /// list
    pub fn new(configured: Vec<Subnet>) -> Self {
        let mut subnets = vec![
            Subnet {
                network: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
                prefix: 8,
            },
            Subnet {
                network: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                prefix: 128,
            },
            Subnet {
                network: IpAddr::V6(Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 0)),
                prefix: 32,
            },
            Subnet {
                network: IpAddr::V6(Ipv6Addr::new(0x2002, 0, 0, 0, 0, 0, 0, 0)),
                prefix: 16,
            },
        ];
        subnets.extend(configured);
        Self { subnets }
    }

    /// Whether any subnet matches the address
    pub fn matches(&self, addr: IpAddr) -> bool {
        self.subnets.iter().any(|s| s.contains(addr))
    }
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(s: &str, prefix: u8) -> Subnet {
        Subnet::new(s.parse().unwrap(), prefix).unwrap()
    }

    #[test]
    fn test_v4_prefix_match() {
        let net = subnet("10.0.0.0", 8);
        assert!(net.contains("10.1.2.3".parse().unwrap()));
        assert!(!net.contains("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_v6_prefix_match() {
        let net = subnet("2001:db8::", 32);
        assert!(net.contains("2001:db8:1::5".parse().unwrap()));
        assert!(!net.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn test_v4_address_against_v6_subnet_promotes() {
        // ::ffff:0:0/96 covers every IPv4-mapped address
        let net = subnet("::ffff:0:0", 96);
        assert!(net.contains("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn test_mapped_v6_address_against_v4_subnet_strips() {
        let net = subnet("192.0.2.0", 24);
        assert!(net.contains("::ffff:192.0.2.33".parse().unwrap()));
        assert!(!net.contains("::ffff:192.0.3.1".parse().unwrap()));
        // Non-mapped v6 never matches a v4 subnet
        assert!(!net.contains("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_zero_prefix_matches_everything_in_family() {
        let net = subnet("0.0.0.0", 0);
        assert!(net.contains("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_default_entries() {
        let bl = Blacklist::default();
        assert!(bl.matches("0.1.2.3".parse().unwrap()));
        assert!(bl.matches("::".parse().unwrap()));
        assert!(bl.matches("2001::1".parse().unwrap())); // Teredo
        assert!(bl.matches("2002::1".parse().unwrap())); // 6to4
        assert!(!bl.matches("::1".parse().unwrap()));
        assert!(!bl.matches("2001:db8::1".parse().unwrap()));
        assert!(!bl.matches("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_configured_entries_merge_with_defaults() {
        let bl = Blacklist::new(vec![subnet("198.51.100.0", 24)]);
        assert!(bl.matches("198.51.100.77".parse().unwrap()));
        assert!(bl.matches("0.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_prefix_validation() {
        assert!(Subnet::new("10.0.0.0".parse().unwrap(), 33).is_err());
        assert!(Subnet::new("::".parse().unwrap(), 128).is_ok());
    }
}
