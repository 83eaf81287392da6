//! Address-type classification.
//!
//! The second address byte partitions the space: bit 7 selects the privacy
//! half, bits 6..4 the continent, bits 3..0 the region. Continent 0 is the
//! "special" continent whose regions carry the non-geographic address types.

use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

use crate::prefix::{INTERNAL_PREFIX, Prefix};

/// Classification of an overlay address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    /// Not in `fd00::/8`.
    Invalid,
    /// The privacy half `fd80::/9`; not used for routing.
    Privacy,
    /// A geographically marked routing address.
    GeoMarked,
    /// Roaming routers without a stable location.
    Roaming,
    /// Organization-scoped address blocks.
    Organization,
    /// Anycast service addresses.
    Anycast,
    /// Experimental allocations.
    Experiment,
    /// The router-internal API endpoint space `fd00::/112`.
    Internal,
    /// Unassigned special-region space.
    Reserved,
}

impl AddressType {
    /// Minimum routing-prefix width for this address type, in bits.
    ///
    /// `None` means addresses of this type are not routed at all.
    pub fn routing_prefix_bits(&self) -> Option<u8> {
        match self {
            AddressType::GeoMarked => Some(12),
            AddressType::Roaming | AddressType::Experiment => Some(16),
            AddressType::Organization | AddressType::Anycast => Some(32),
            AddressType::Invalid
            | AddressType::Privacy
            | AddressType::Internal
            | AddressType::Reserved => None,
        }
    }

    /// Whether frames may be routed toward addresses of this type.
    pub fn is_routable(&self) -> bool {
        self.routing_prefix_bits().is_some()
    }
}

/// Continent codes in address byte 1, bits 6..4.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Continent {
    Special = 0,
    Europe = 1,
    NorthAmerica = 2,
    SouthAmerica = 3,
    Africa = 4,
    Asia = 5,
    Oceania = 6,
    Antarctica = 7,
}

impl Continent {
    /// Decode a 3-bit continent code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code & 0x07 {
            0 => Continent::Special,
            1 => Continent::Europe,
            2 => Continent::NorthAmerica,
            3 => Continent::SouthAmerica,
            4 => Continent::Africa,
            5 => Continent::Asia,
            6 => Continent::Oceania,
            7 => Continent::Antarctica,
            _ => return None,
        })
    }

    /// The 12-bit continent prefix `fdX0::/12`.
    pub const fn prefix(self) -> Prefix {
        let second = ((self as u8) << 4) as u16;
        Prefix::new(Ipv6Addr::new(0xfd00 | second, 0, 0, 0, 0, 0, 0, 0), 12)
    }
}

/// Region codes in address byte 1, bits 3..0: a fixed 16-point compass rose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Region {
    North = 0,
    NorthNorthEast = 1,
    NorthEast = 2,
    EastNorthEast = 3,
    East = 4,
    EastSouthEast = 5,
    SouthEast = 6,
    SouthSouthEast = 7,
    South = 8,
    SouthSouthWest = 9,
    SouthWest = 10,
    WestSouthWest = 11,
    West = 12,
    WestNorthWest = 13,
    NorthWest = 14,
    NorthNorthWest = 15,
}

impl Region {
    /// Decode a 4-bit region code.
    pub fn from_code(code: u8) -> Self {
        // All 16 values are valid; transmute-by-match keeps it checked.
        match code & 0x0F {
            0 => Region::North,
            1 => Region::NorthNorthEast,
            2 => Region::NorthEast,
            3 => Region::EastNorthEast,
            4 => Region::East,
            5 => Region::EastSouthEast,
            6 => Region::SouthEast,
            7 => Region::SouthSouthEast,
            8 => Region::South,
            9 => Region::SouthSouthWest,
            10 => Region::SouthWest,
            11 => Region::WestSouthWest,
            12 => Region::West,
            13 => Region::WestNorthWest,
            14 => Region::NorthWest,
            _ => Region::NorthNorthWest,
        }
    }
}

/// Regions of the special continent.
const SPECIAL_REGION_ROAMING: u8 = 1;
const SPECIAL_REGION_ORGANIZATION: u8 = 2;
const SPECIAL_REGION_ANYCAST: u8 = 3;
const SPECIAL_REGION_EXPERIMENT: u8 = 4;

/// Classify an address.
pub fn classify(ip: Ipv6Addr) -> AddressType {
    let octets = ip.octets();
    if octets[0] != 0xFD {
        return AddressType::Invalid;
    }
    if INTERNAL_PREFIX.contains(ip) {
        return AddressType::Internal;
    }
    if octets[1] & 0x80 != 0 {
        return AddressType::Privacy;
    }

    let continent = (octets[1] >> 4) & 0x07;
    if continent != 0 {
        return AddressType::GeoMarked;
    }

    match octets[1] & 0x0F {
        SPECIAL_REGION_ROAMING => AddressType::Roaming,
        SPECIAL_REGION_ORGANIZATION => AddressType::Organization,
        SPECIAL_REGION_ANYCAST => AddressType::Anycast,
        SPECIAL_REGION_EXPERIMENT => AddressType::Experiment,
        _ => AddressType::Reserved,
    }
}

/// Decode the continent and region markers of a geo-marked address.
pub fn continent_region(ip: Ipv6Addr) -> Option<(Continent, Region)> {
    if classify(ip) != AddressType::GeoMarked {
        return None;
    }
    let octets = ip.octets();
    let continent = Continent::from_code((octets[1] >> 4) & 0x07)?;
    let region = Region::from_code(octets[1] & 0x0F);
    Some((continent, region))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(second_u16: u16) -> Ipv6Addr {
        Ipv6Addr::new(second_u16, 0, 0, 0, 0, 0, 0, 1)
    }

    #[test]
    fn test_invalid_outside_fd00() {
        assert_eq!(classify(addr(0xfe80)), AddressType::Invalid);
        assert_eq!(classify(addr(0x2001)), AddressType::Invalid);
    }

    #[test]
    fn test_privacy_half() {
        assert_eq!(classify(addr(0xfd80)), AddressType::Privacy);
        assert_eq!(classify(addr(0xfdff)), AddressType::Privacy);
    }

    #[test]
    fn test_internal() {
        assert_eq!(
            classify(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0xb909)),
            AddressType::Internal
        );
        // Outside /112 but inside the reserved special region 0.
        assert_eq!(
            classify(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 1, 0)),
            AddressType::Reserved
        );
    }

    #[test]
    fn test_special_regions() {
        assert_eq!(classify(addr(0xfd01)), AddressType::Roaming);
        assert_eq!(classify(addr(0xfd02)), AddressType::Organization);
        assert_eq!(classify(addr(0xfd03)), AddressType::Anycast);
        assert_eq!(classify(addr(0xfd04)), AddressType::Experiment);
        assert_eq!(classify(addr(0xfd05)), AddressType::Reserved);
        assert_eq!(classify(addr(0xfd0f)), AddressType::Reserved);
    }

    #[test]
    fn test_geo_marked_fixtures() {
        // AT, continent Europe (1), region 15.
        assert_eq!(classify(addr(0xfd1f)), AddressType::GeoMarked);
        let (continent, region) = continent_region(addr(0xfd1f)).expect("geo marked");
        assert_eq!(continent, Continent::Europe);
        assert_eq!(region, Region::NorthNorthWest);

        // NZ, continent Oceania (6), region 6.
        let (continent, region) = continent_region(addr(0xfd66)).expect("geo marked");
        assert_eq!(continent, Continent::Oceania);
        assert_eq!(region, Region::SouthEast);
    }

    #[test]
    fn test_routing_prefix_bits() {
        assert_eq!(AddressType::GeoMarked.routing_prefix_bits(), Some(12));
        assert_eq!(AddressType::Roaming.routing_prefix_bits(), Some(16));
        assert_eq!(AddressType::Experiment.routing_prefix_bits(), Some(16));
        assert_eq!(AddressType::Organization.routing_prefix_bits(), Some(32));
        assert_eq!(AddressType::Anycast.routing_prefix_bits(), Some(32));
        assert_eq!(AddressType::Privacy.routing_prefix_bits(), None);
        assert_eq!(AddressType::Internal.routing_prefix_bits(), None);
    }

    #[test]
    fn test_continent_prefix() {
        let p = Continent::Europe.prefix();
        assert!(p.contains(addr(0xfd1f)));
        assert!(!p.contains(addr(0xfd20)));
        assert_eq!(p.bits(), 12);
    }
}
