//! The static geo-marker prefix table.
//!
//! Each entry pins a country prefix inside its continent+region block. The
//! table is a `const` array sorted by base address; sortedness is asserted
//! by a test so lookups can binary-search it directly. It is the only global
//! in the address plane and is read-only.

use std::net::Ipv6Addr;

use crate::classify::{continent_region, Continent, Region};
use crate::prefix::{ip_bits, Prefix};

/// One geo-marked country prefix.
#[derive(Clone, Copy, Debug)]
pub struct GeoEntry {
    /// The advertised prefix, 16 to 20 bits wide.
    pub prefix: Prefix,
    /// Continent encoded in the prefix.
    pub continent: Continent,
    /// Region encoded in the prefix.
    pub region: Region,
    /// ISO 3166-1 alpha-2 country code.
    pub country: &'static str,
}

impl GeoEntry {
    /// Width of the country marker in bits (0..=4).
    pub const fn marker_bits(&self) -> u8 {
        self.prefix.bits() - 16
    }

    /// The country-marker value, taken from the top bits of address byte 2.
    pub const fn marker(&self) -> u8 {
        let bits = self.marker_bits();
        if bits == 0 {
            0
        } else {
            self.prefix.base().octets()[2] >> (8 - bits)
        }
    }
}

const fn entry(
    second: u16,
    third: u16,
    bits: u8,
    continent: Continent,
    region: Region,
    country: &'static str,
) -> GeoEntry {
    GeoEntry {
        prefix: Prefix::new(Ipv6Addr::new(second, third, 0, 0, 0, 0, 0, 0), bits),
        continent,
        region,
        country,
    }
}

/// The geo-marker table, sorted ascending by base address.
pub const GEO_TABLE: &[GeoEntry] = &[
    // Europe
    entry(0xfd10, 0x0000, 17, Continent::Europe, Region::North, "NO"),
    entry(0xfd10, 0x8000, 17, Continent::Europe, Region::North, "SE"),
    entry(0xfd12, 0x0000, 16, Continent::Europe, Region::NorthEast, "FI"),
    entry(0xfd14, 0x0000, 18, Continent::Europe, Region::East, "PL"),
    entry(0xfd14, 0x4000, 18, Continent::Europe, Region::East, "UA"),
    entry(0xfd14, 0x8000, 18, Continent::Europe, Region::East, "RO"),
    entry(0xfd14, 0xc000, 18, Continent::Europe, Region::East, "HU"),
    entry(0xfd18, 0x0000, 17, Continent::Europe, Region::South, "IT"),
    entry(0xfd18, 0x8000, 17, Continent::Europe, Region::South, "GR"),
    entry(0xfd1c, 0x0000, 18, Continent::Europe, Region::West, "FR"),
    entry(0xfd1c, 0x4000, 18, Continent::Europe, Region::West, "GB"),
    entry(0xfd1c, 0x8000, 18, Continent::Europe, Region::West, "IE"),
    entry(0xfd1c, 0xc000, 18, Continent::Europe, Region::West, "BE"),
    entry(0xfd1f, 0x0000, 18, Continent::Europe, Region::NorthNorthWest, "AT"),
    entry(0xfd1f, 0x4000, 18, Continent::Europe, Region::NorthNorthWest, "CH"),
    entry(0xfd1f, 0x8000, 18, Continent::Europe, Region::NorthNorthWest, "DE"),
    entry(0xfd1f, 0xc000, 18, Continent::Europe, Region::NorthNorthWest, "NL"),
    // North America
    entry(0xfd20, 0x0000, 17, Continent::NorthAmerica, Region::North, "CA"),
    entry(0xfd20, 0x8000, 17, Continent::NorthAmerica, Region::North, "GL"),
    entry(0xfd28, 0x0000, 16, Continent::NorthAmerica, Region::South, "US"),
    entry(0xfd2c, 0x0000, 17, Continent::NorthAmerica, Region::West, "MX"),
    entry(0xfd2c, 0x8000, 17, Continent::NorthAmerica, Region::West, "CU"),
    // South America
    entry(0xfd34, 0x0000, 16, Continent::SouthAmerica, Region::East, "BR"),
    entry(0xfd3c, 0x0000, 18, Continent::SouthAmerica, Region::West, "PE"),
    entry(0xfd3c, 0x4000, 18, Continent::SouthAmerica, Region::West, "CL"),
    entry(0xfd3c, 0x8000, 18, Continent::SouthAmerica, Region::West, "CO"),
    entry(0xfd3c, 0xc000, 18, Continent::SouthAmerica, Region::West, "EC"),
    // Africa
    entry(0xfd40, 0x0000, 18, Continent::Africa, Region::North, "EG"),
    entry(0xfd40, 0x4000, 18, Continent::Africa, Region::North, "MA"),
    entry(0xfd40, 0x8000, 18, Continent::Africa, Region::North, "DZ"),
    entry(0xfd40, 0xc000, 18, Continent::Africa, Region::North, "TN"),
    entry(0xfd44, 0x0000, 17, Continent::Africa, Region::East, "KE"),
    entry(0xfd44, 0x8000, 17, Continent::Africa, Region::East, "ET"),
    entry(0xfd48, 0x0000, 16, Continent::Africa, Region::South, "ZA"),
    entry(0xfd4c, 0x0000, 17, Continent::Africa, Region::West, "NG"),
    entry(0xfd4c, 0x8000, 17, Continent::Africa, Region::West, "GH"),
    // Asia
    entry(0xfd54, 0x0000, 18, Continent::Asia, Region::East, "CN"),
    entry(0xfd54, 0x4000, 18, Continent::Asia, Region::East, "JP"),
    entry(0xfd54, 0x8000, 18, Continent::Asia, Region::East, "KR"),
    entry(0xfd54, 0xc000, 18, Continent::Asia, Region::East, "TW"),
    entry(0xfd56, 0x0000, 18, Continent::Asia, Region::SouthEast, "SG"),
    entry(0xfd56, 0x4000, 18, Continent::Asia, Region::SouthEast, "TH"),
    entry(0xfd56, 0x8000, 18, Continent::Asia, Region::SouthEast, "VN"),
    entry(0xfd56, 0xc000, 18, Continent::Asia, Region::SouthEast, "ID"),
    entry(0xfd58, 0x0000, 17, Continent::Asia, Region::South, "IN"),
    entry(0xfd58, 0x8000, 17, Continent::Asia, Region::South, "LK"),
    entry(0xfd5c, 0x0000, 18, Continent::Asia, Region::West, "SA"),
    entry(0xfd5c, 0x4000, 18, Continent::Asia, Region::West, "AE"),
    entry(0xfd5c, 0x8000, 18, Continent::Asia, Region::West, "IL"),
    entry(0xfd5c, 0xc000, 18, Continent::Asia, Region::West, "TR"),
    // Oceania
    entry(0xfd60, 0x0000, 17, Continent::Oceania, Region::North, "FJ"),
    entry(0xfd60, 0x8000, 17, Continent::Oceania, Region::North, "PG"),
    entry(0xfd66, 0x0000, 16, Continent::Oceania, Region::SouthEast, "NZ"),
    entry(0xfd6c, 0x0000, 16, Continent::Oceania, Region::West, "AU"),
    // Antarctica
    entry(0xfd70, 0x0000, 16, Continent::Antarctica, Region::North, "AQ"),
];

/// The 16-bit prefix of a continent+region block.
pub fn region_prefix(continent: Continent, region: Region) -> Prefix {
    let second = 0xfd00 | (((continent as u16) << 4) | region as u16);
    Prefix::new(Ipv6Addr::new(second, 0, 0, 0, 0, 0, 0, 0), 16)
}

/// Look up the country marker of a geo-marked address.
///
/// The continent+region mask selects the table section for that block; the
/// section is then binary-searched for the largest base address at or below
/// `ip`, and the candidate is accepted only if its prefix contains `ip`.
pub fn country_marker_lookup(ip: Ipv6Addr) -> Option<&'static GeoEntry> {
    let (continent, region) = continent_region(ip)?;
    let block = region_prefix(continent, region);
    let block_base = ip_bits(block.base());
    let block_end = block_base + (1u128 << 112);

    let start = GEO_TABLE.partition_point(|e| ip_bits(e.prefix.base()) < block_base);
    let end = GEO_TABLE.partition_point(|e| ip_bits(e.prefix.base()) < block_end);
    let section = &GEO_TABLE[start..end];

    let addr = ip_bits(ip);
    let idx = section.partition_point(|e| ip_bits(e.prefix.base()) <= addr);
    if idx == 0 {
        return None;
    }
    let candidate = &section[idx - 1];
    candidate.prefix.contains(ip).then_some(candidate)
}

/// Look up a country entry by its ISO code.
pub fn country_prefix(country: &str) -> Option<&'static GeoEntry> {
    GEO_TABLE.iter().find(|e| e.country == country)
}
