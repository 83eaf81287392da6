//! Routable prefixes for the local router.
//!
//! Each prefix pairs a covered address range with the routing granularity,
//! entry lifetime and gossip capacity the table applies inside it. The set
//! is ordered most specific first, so matching stops at the tightest fit.

use std::net::Ipv6Addr;
use std::time::Duration;

use mycoria_addr::classify::{classify, continent_region, AddressType, Continent};
use mycoria_addr::geo::{country_marker_lookup, region_prefix};
use mycoria_addr::prefix::Prefix;

/// One routable prefix with its table policy.
#[derive(Clone, Copy, Debug)]
pub struct RoutablePrefix {
    /// The covered address range.
    pub base: Prefix,
    /// Width of the routing buckets inside this range, in bits.
    pub routing_bits: u8,
    /// Lifetime cap for gossip and discovered entries.
    pub entry_ttl: Duration,
    /// Gossip entries kept per routing bucket.
    pub entries_per_prefix: usize,
}

impl RoutablePrefix {
    /// The routing bucket of an address under this prefix.
    pub fn bucket_of(&self, ip: Ipv6Addr) -> Ipv6Addr {
        let bits = u128::from_be_bytes(ip.octets());
        let mask = if self.routing_bits == 0 {
            0
        } else {
            u128::MAX << (128 - self.routing_bits)
        };
        Ipv6Addr::from(bits & mask)
    }
}

const HOURS_3: Duration = Duration::from_secs(3 * 60 * 60);
const HOURS_24: Duration = Duration::from_secs(24 * 60 * 60);

/// Build the local router's routable-prefix set, most specific first:
/// the own country prefix (24 h, 1024 entries), the regional /16 (3 h, 64),
/// the continent /12 (3 h, 32) and the special-region space (3 h, 32).
pub fn build_routable_prefixes(local: Ipv6Addr) -> Vec<RoutablePrefix> {
    let mut prefixes = Vec::with_capacity(4);

    if classify(local) == AddressType::GeoMarked {
        if let Some(entry) = country_marker_lookup(local) {
            prefixes.push(RoutablePrefix {
                base: entry.prefix,
                routing_bits: entry.prefix.bits(),
                entry_ttl: HOURS_24,
                entries_per_prefix: 1024,
            });
        }
        if let Some((continent, region)) = continent_region(local) {
            prefixes.push(RoutablePrefix {
                base: region_prefix(continent, region),
                routing_bits: 16,
                entry_ttl: HOURS_3,
                entries_per_prefix: 64,
            });
            prefixes.push(RoutablePrefix {
                base: continent.prefix(),
                routing_bits: 12,
                entry_ttl: HOURS_3,
                entries_per_prefix: 32,
            });
        }
    }

    // Roaming, organization, anycast and experiment space.
    prefixes.push(RoutablePrefix {
        base: Continent::Special.prefix(),
        routing_bits: 16,
        entry_ttl: HOURS_3,
        entries_per_prefix: 32,
    });

    prefixes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_local_gets_four_prefixes() {
        // Inside the AT prefix.
        let local: Ipv6Addr = "fd1f:1234::1".parse().expect("ip");
        let prefixes = build_routable_prefixes(local);
        assert_eq!(prefixes.len(), 4);

        // Most specific first.
        assert_eq!(prefixes[0].base.bits(), 18);
        assert_eq!(prefixes[0].entries_per_prefix, 1024);
        assert_eq!(prefixes[1].base.bits(), 16);
        assert_eq!(prefixes[2].base.bits(), 12);
        assert_eq!(prefixes[3].base.bits(), 12);

        assert!(prefixes[0].base.contains(local));
        assert!(prefixes[1].base.contains(local));
        assert!(prefixes[2].base.contains(local));
        assert!(!prefixes[3].base.contains(local));
    }

    #[test]
    fn test_non_geo_local_still_routes_special_space() {
        let local: Ipv6Addr = "fd01::7".parse().expect("ip");
        let prefixes = build_routable_prefixes(local);
        assert_eq!(prefixes.len(), 1);
        assert!(prefixes[0].base.contains(local));
    }

    #[test]
    fn test_bucket_of() {
        let prefix = RoutablePrefix {
            base: Prefix::new("fd10::".parse().expect("ip"), 12),
            routing_bits: 12,
            entry_ttl: HOURS_3,
            entries_per_prefix: 32,
        };
        let a: Ipv6Addr = "fd1f:aaaa::1".parse().expect("ip");
        let b: Ipv6Addr = "fd1e:bbbb::2".parse().expect("ip");
        assert_eq!(prefix.bucket_of(a), "fd10::".parse::<Ipv6Addr>().expect("ip"));
        assert_eq!(prefix.bucket_of(a), prefix.bucket_of(b));
    }
}
