//! The route store.
//!
//! A single vector sorted by `(destination, hop count, delay, relay ids)`;
//! lookups binary-search it, mutations re-sort only the affected
//! destination section. Peer routes sort ahead of any multi-hop route to
//! the same destination and are never expired or pruned.

use std::cmp::Ordering;
use std::net::Ipv6Addr;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use mycoria_addr::prefix::ip_bits;
use mycoria_switch::SwitchPath;

use crate::prefix::RoutablePrefix;
use crate::{Result, RouterError};

/// Where a route came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteSource {
    /// A directly connected peer; never expires, carries no path.
    Peer,
    /// Learned from gossip; subject to bucket capacity limits.
    Gossip,
    /// Discovered on demand; expires naturally.
    Discovered,
}

/// Minimum remaining lifetime granted to accepted non-peer entries.
const MIN_ENTRY_TTL_SECS: u64 = 10 * 60;

/// Entries expired longer than this are rejected outright.
const MAX_EXPIRED_SECS: u64 = 60 * 60;

/// Routes kept per destination.
const ROUTES_PER_DESTINATION: usize = 3;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One route in the table.
#[derive(Clone, Debug)]
pub struct RouteEntry {
    /// Destination router.
    pub dst: Ipv6Addr,
    /// The destination's routing bucket under its matched prefix.
    pub routing_prefix: Ipv6Addr,
    /// Directly connected router the frame leaves through.
    pub next_hop: Ipv6Addr,
    /// Switch path to the destination; absent for peer entries.
    pub path: Option<SwitchPath>,
    /// Provenance of this entry.
    pub source: RouteSource,
    /// Unix-seconds expiry; ignored for peer entries.
    pub expires_at: u64,
    /// The destination advertises itself as a dead end.
    pub is_stub: bool,
}

impl RouteEntry {
    /// A directly connected peer.
    pub fn peer(dst: Ipv6Addr) -> Self {
        Self {
            dst,
            routing_prefix: dst,
            next_hop: dst,
            path: None,
            source: RouteSource::Peer,
            expires_at: 0,
            is_stub: false,
        }
    }

    /// Hop transitions; peers count as zero so they sort first.
    pub fn hop_count(&self) -> u8 {
        self.path.as_ref().map(SwitchPath::total_hops).unwrap_or(0)
    }

    /// Summed path delay in milliseconds.
    pub fn delay(&self) -> u16 {
        self.path.as_ref().map(SwitchPath::total_delay).unwrap_or(0)
    }

    /// The intermediate relay routers of the path.
    fn relays(&self) -> &[mycoria_switch::Hop] {
        match &self.path {
            Some(path) if path.hops().len() > 2 => {
                let hops = path.hops();
                &hops[1..hops.len() - 1]
            }
            _ => &[],
        }
    }

    /// Whether the path (or destination) includes `router`.
    pub fn uses_router(&self, router: Ipv6Addr) -> bool {
        self.dst == router
            || self.next_hop == router
            || self
                .path
                .as_ref()
                .is_some_and(|path| path.contains_router(router))
    }

    fn expired(&self, now: u64) -> bool {
        self.source != RouteSource::Peer && self.expires_at < now
    }
}

fn route_cmp(a: &RouteEntry, b: &RouteEntry) -> Ordering {
    ip_bits(a.dst)
        .cmp(&ip_bits(b.dst))
        .then_with(|| a.hop_count().cmp(&b.hop_count()))
        .then_with(|| a.delay().cmp(&b.delay()))
        .then_with(|| {
            a.relays()
                .iter()
                .map(|h| ip_bits(h.router))
                .cmp(b.relays().iter().map(|h| ip_bits(h.router)))
        })
}

/// Whether two entries describe the same route: same destination, hop count
/// and relay routers. Peer entries compare equal to each other regardless
/// of path, which deliberately still lets a multi-homed peer hold several
/// entries (peer inserts never replace).
fn route_equals(a: &RouteEntry, b: &RouteEntry) -> bool {
    if a.dst != b.dst {
        return false;
    }
    if a.source == RouteSource::Peer && b.source == RouteSource::Peer {
        return true;
    }
    a.hop_count() == b.hop_count()
        && a.relays()
            .iter()
            .map(|h| h.router)
            .eq(b.relays().iter().map(|h| h.router))
}

struct TableInner {
    entries: Vec<RouteEntry>,
    prefixes: Vec<RoutablePrefix>,
}

/// The routing table. One writer or many readers at a time.
pub struct RoutingTable {
    inner: RwLock<TableInner>,
}

impl RoutingTable {
    pub fn new(prefixes: Vec<RoutablePrefix>) -> Self {
        Self {
            inner: RwLock::new(TableInner {
                entries: Vec::new(),
                prefixes,
            }),
        }
    }

    /// Insert or update a route.
    pub fn add_route(&self, mut entry: RouteEntry) -> Result<()> {
        let mut inner = self.write();
        let now = now_secs();

        // 1. The destination must fall under a configured prefix.
        let prefix = *inner
            .prefixes
            .iter()
            .find(|p| p.base.contains(entry.dst))
            .ok_or(RouterError::RouteUnroutable(entry.dst))?;

        if entry.source == RouteSource::Peer {
            // 3. Peer entries always insert, even as duplicates.
            entry.routing_prefix = prefix.bucket_of(entry.dst);
            inner.insert_sorted(entry);
            return Ok(());
        }

        // 2. Non-peer entries need a usable path and a future expiry.
        entry.routing_prefix = prefix.bucket_of(entry.dst);
        if entry.expires_at.saturating_add(MAX_EXPIRED_SECS) < now {
            return Err(RouterError::InvalidRoute(format!(
                "route to {} expired over an hour ago",
                entry.dst
            )));
        }
        match &entry.path {
            Some(path) if path.hops().len() >= 2 => {}
            _ => {
                return Err(RouterError::InvalidRoute(format!(
                    "route to {} needs a path of at least 2 hops",
                    entry.dst
                )))
            }
        }
        let ttl_cap = now + prefix.entry_ttl.as_secs();
        entry.expires_at = entry
            .expires_at
            .max(now + MIN_ENTRY_TTL_SECS)
            .min(ttl_cap);

        let section = inner.destination_section(entry.dst);
        if section.is_empty() {
            // 5. New destination: gossip routes respect the bucket cap.
            if entry.source == RouteSource::Gossip {
                let bucket = entry.routing_prefix;
                let in_bucket = inner
                    .entries
                    .iter()
                    .filter(|e| e.routing_prefix == bucket)
                    .count();
                if in_bucket > 2 * prefix.entries_per_prefix {
                    return Err(RouterError::BucketFull(entry.dst));
                }
            }
            inner.insert_sorted(entry);
            return Ok(());
        }

        // 4. Known destination: replace an equivalent route in place, fill
        // up to the per-destination cap, or displace a worse third.
        if let Some(offset) = inner.entries[section.clone()]
            .iter()
            .position(|e| route_equals(e, &entry))
        {
            let index = section.start + offset;
            inner.entries[index] = entry;
            inner.resort_section(section);
            return Ok(());
        }

        let non_peer = inner.entries[section.clone()]
            .iter()
            .filter(|e| e.source != RouteSource::Peer)
            .count();
        if non_peer < ROUTES_PER_DESTINATION {
            inner.insert_sorted(entry);
            return Ok(());
        }

        let third = section.start + section.len() - 1;
        if route_cmp(&entry, &inner.entries[third]) == Ordering::Less {
            inner.entries[third] = entry;
            inner.resort_section(section);
            Ok(())
        } else {
            Err(RouterError::InvalidRoute(format!(
                "route to {} is no better than the existing ones",
                entry.dst
            )))
        }
    }

    /// The best entry nearest to `dst` by address distance, if any.
    pub fn lookup_nearest(&self, dst: Ipv6Addr) -> Option<RouteEntry> {
        let inner = self.read();
        inner.nearest_index(dst).map(|i| inner.entries[i].clone())
    }

    /// As [`Self::lookup_nearest`], but walks outward past stub routers
    /// that are not the exact destination.
    pub fn lookup_nearest_route(&self, dst: Ipv6Addr) -> Option<RouteEntry> {
        let inner = self.read();
        let index = inner.nearest_index(dst)?;
        let entry = &inner.entries[index];
        if !entry.is_stub || entry.dst == dst {
            return Some(entry.clone());
        }

        for distance in 1..inner.entries.len() {
            for candidate in [index.checked_sub(distance), index.checked_add(distance)] {
                if let Some(i) = candidate.filter(|i| *i < inner.entries.len()) {
                    let entry = &inner.entries[i];
                    if !entry.is_stub || entry.dst == dst {
                        return Some(entry.clone());
                    }
                }
            }
        }
        None
    }

    /// Collect up to `max` candidate routes around `dst`, alternating the
    /// closer neighbor, skipping avoided routers and (optionally)
    /// duplicate next hops, and stopping past `max_distance`.
    pub fn lookup_possible_paths(
        &self,
        dst: Ipv6Addr,
        max: usize,
        max_distance: u128,
        distinct_next_hop: bool,
        avoid: &[Ipv6Addr],
    ) -> Vec<RouteEntry> {
        let inner = self.read();
        let mut results: Vec<RouteEntry> = Vec::with_capacity(max);
        if inner.entries.is_empty() || max == 0 {
            return results;
        }

        let target = ip_bits(dst);
        let start = inner
            .entries
            .partition_point(|e| ip_bits(e.dst) < target);
        let mut prev = start.checked_sub(1);
        let mut next = (start < inner.entries.len()).then_some(start);
        let mut chosen_hops: Vec<Ipv6Addr> = Vec::new();

        while results.len() < max {
            let prev_distance = prev.map(|i| ip_bits(inner.entries[i].dst).abs_diff(target));
            let next_distance = next.map(|i| ip_bits(inner.entries[i].dst).abs_diff(target));

            let take_prev = match (prev_distance, next_distance) {
                (Some(p), Some(n)) => p <= n,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };

            let (index, distance) = if take_prev {
                let i = prev.unwrap_or_default();
                prev = i.checked_sub(1);
                (i, prev_distance.unwrap_or_default())
            } else {
                let i = next.unwrap_or_default();
                next = (i + 1 < inner.entries.len()).then_some(i + 1);
                (i, next_distance.unwrap_or_default())
            };

            if distance > max_distance {
                break;
            }

            let entry = &inner.entries[index];
            if avoid.iter().any(|ip| entry.uses_router(*ip)) {
                continue;
            }
            if distinct_next_hop && chosen_hops.contains(&entry.next_hop) {
                continue;
            }
            chosen_hops.push(entry.next_hop);
            results.push(entry.clone());
        }

        results
    }

    /// Drop expired non-peer entries, then enforce the per-bucket gossip
    /// capacity. Discovered entries only ever expire naturally.
    pub fn clean(&self) {
        let mut inner = self.write();
        let now = now_secs();
        let before = inner.entries.len();
        inner.entries.retain(|e| !e.expired(now));

        // The vector is sorted by destination, so routing buckets are
        // contiguous runs.
        let caps: Vec<Option<usize>> = inner
            .entries
            .iter()
            .map(|e| {
                inner
                    .prefixes
                    .iter()
                    .find(|p| p.base.contains(e.dst))
                    .map(|p| p.entries_per_prefix)
            })
            .collect();
        let mut bucket: Option<Ipv6Addr> = None;
        let mut gossip_in_bucket = 0usize;
        let mut index = 0usize;
        let entries = &mut inner.entries;
        let mut kept: Vec<RouteEntry> = Vec::with_capacity(entries.len());
        for entry in entries.drain(..) {
            if bucket != Some(entry.routing_prefix) {
                bucket = Some(entry.routing_prefix);
                gossip_in_bucket = 0;
            }
            let keep = match entry.source {
                RouteSource::Gossip => {
                    let cap = caps[index].unwrap_or(usize::MAX);
                    gossip_in_bucket += 1;
                    gossip_in_bucket <= cap
                }
                _ => true,
            };
            if keep {
                kept.push(entry);
            }
            index += 1;
        }
        *entries = kept;

        let removed = before - inner.entries.len();
        if removed > 0 {
            tracing::debug!(removed, "routing table cleaned");
        }
    }

    /// Remove every route leaving through `next_hop`.
    pub fn remove_next_hop(&self, next_hop: Ipv6Addr) {
        let mut inner = self.write();
        inner.entries.retain(|e| e.next_hop != next_hop);
    }

    /// Remove routes that relied on a now-disconnected router, keeping
    /// entries for destinations that are still direct peers.
    pub fn remove_disconnected(&self, router: Ipv6Addr, peers: &[Ipv6Addr]) {
        let mut inner = self.write();
        inner
            .entries
            .retain(|e| peers.contains(&e.dst) || !e.uses_router(router));
    }

    /// All entries for one destination.
    pub fn routes_to(&self, dst: Ipv6Addr) -> Vec<RouteEntry> {
        let inner = self.read();
        let section = inner.destination_section(dst);
        inner.entries[section].to_vec()
    }

    /// Number of entries in the table.
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TableInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TableInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl TableInner {
    fn insert_sorted(&mut self, entry: RouteEntry) {
        let index = self
            .entries
            .partition_point(|e| route_cmp(e, &entry) == Ordering::Less);
        self.entries.insert(index, entry);
    }

    fn resort_section(&mut self, section: std::ops::Range<usize>) {
        self.entries[section].sort_by(route_cmp);
    }

    /// The contiguous index range of entries with this destination.
    fn destination_section(&self, dst: Ipv6Addr) -> std::ops::Range<usize> {
        let target = ip_bits(dst);
        let start = self.entries.partition_point(|e| ip_bits(e.dst) < target);
        let mut end = start;
        while end < self.entries.len() && self.entries[end].dst == dst {
            end += 1;
        }
        start..end
    }

    /// Index of the entry nearest to `dst`: the exact section's best entry
    /// when present, else the closer of the two neighbors.
    fn nearest_index(&self, dst: Ipv6Addr) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let target = ip_bits(dst);
        let index = self.entries.partition_point(|e| ip_bits(e.dst) < target);
        if index < self.entries.len() && self.entries[index].dst == dst {
            return Some(index);
        }

        let next = (index < self.entries.len())
            .then(|| (index, ip_bits(self.entries[index].dst).abs_diff(target)));
        let prev = index
            .checked_sub(1)
            .map(|i| (i, ip_bits(self.entries[i].dst).abs_diff(target)));
        match (prev, next) {
            (Some((pi, pd)), Some((ni, nd))) => Some(if nd <= pd { ni } else { pi }),
            (Some((pi, _)), None) => Some(pi),
            (None, Some((ni, _))) => Some(ni),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use mycoria_addr::prefix::Prefix;
    use mycoria_switch::{Hop, SwitchLabel};

    fn test_prefixes() -> Vec<RoutablePrefix> {
        vec![
            RoutablePrefix {
                base: Prefix::new("fd66::".parse().expect("ip"), 16),
                routing_bits: 16,
                entry_ttl: Duration::from_secs(3 * 60 * 60),
                entries_per_prefix: 5,
            },
            RoutablePrefix {
                base: Prefix::new("fd60::".parse().expect("ip"), 12),
                routing_bits: 12,
                entry_ttl: Duration::from_secs(3 * 60 * 60),
                entries_per_prefix: 32,
            },
        ]
    }

    fn addr(tail: u16) -> Ipv6Addr {
        Ipv6Addr::new(0xfd66, 0, 0, 0, 0, 0, 0, tail)
    }

    fn path_via(relay: Ipv6Addr, dst: Ipv6Addr, delay: u16) -> SwitchPath {
        SwitchPath::new(vec![
            Hop {
                router: addr(1),
                delay_ms: 0,
                forward_label: SwitchLabel::new(2).expect("label"),
                return_label: SwitchLabel::TERMINAL,
            },
            Hop {
                router: relay,
                delay_ms: delay,
                forward_label: SwitchLabel::new(3).expect("label"),
                return_label: SwitchLabel::new(4).expect("label"),
            },
            Hop {
                router: dst,
                delay_ms: delay,
                forward_label: SwitchLabel::TERMINAL,
                return_label: SwitchLabel::new(5).expect("label"),
            },
        ])
        .expect("path")
    }

    fn gossip(dst: Ipv6Addr, relay: Ipv6Addr, delay: u16) -> RouteEntry {
        RouteEntry {
            dst,
            routing_prefix: dst,
            next_hop: relay,
            path: Some(path_via(relay, dst, delay)),
            source: RouteSource::Gossip,
            expires_at: now_secs() + 1800,
            is_stub: false,
        }
    }

    #[test]
    fn test_unroutable_destination_rejected() {
        let table = RoutingTable::new(test_prefixes());
        let entry = RouteEntry::peer("fd20::1".parse().expect("ip"));
        assert!(matches!(
            table.add_route(entry),
            Err(RouterError::RouteUnroutable(_))
        ));
    }

    #[test]
    fn test_peer_routes_always_insert() {
        let table = RoutingTable::new(test_prefixes());
        // A multi-homed peer: two links, two entries.
        table.add_route(RouteEntry::peer(addr(9))).expect("add");
        table.add_route(RouteEntry::peer(addr(9))).expect("add");
        assert_eq!(table.routes_to(addr(9)).len(), 2);
    }

    #[test]
    fn test_gossip_requires_two_hops() {
        let table = RoutingTable::new(test_prefixes());
        let mut entry = gossip(addr(9), addr(5), 10);
        entry.path = None;
        assert!(table.add_route(entry).is_err());
    }

    #[test]
    fn test_stale_gossip_rejected() {
        let table = RoutingTable::new(test_prefixes());
        let mut entry = gossip(addr(9), addr(5), 10);
        entry.expires_at = now_secs().saturating_sub(2 * 60 * 60);
        assert!(table.add_route(entry).is_err());
    }

    #[test]
    fn test_expiry_raised_to_minimum() {
        let table = RoutingTable::new(test_prefixes());
        let mut entry = gossip(addr(9), addr(5), 10);
        entry.expires_at = now_secs() + 5;
        table.add_route(entry).expect("add");
        let stored = &table.routes_to(addr(9))[0];
        assert!(stored.expires_at >= now_secs() + MIN_ENTRY_TTL_SECS - 1);
    }

    #[test]
    fn test_destination_cap_keeps_best_three() {
        let table = RoutingTable::new(test_prefixes());
        for (relay, delay) in [(2u16, 40), (3, 20), (4, 30)] {
            table
                .add_route(gossip(addr(9), addr(relay), delay))
                .expect("add");
        }
        // Worse than all three: rejected.
        assert!(table.add_route(gossip(addr(9), addr(6), 90)).is_err());
        // Better than the third: displaces it.
        table.add_route(gossip(addr(9), addr(7), 10)).expect("add");
        let routes = table.routes_to(addr(9));
        assert_eq!(routes.len(), 3);
        assert!(routes.iter().all(|r| r.delay() <= 80));
        assert_eq!(routes[0].next_hop, addr(7));
    }

    #[test]
    fn test_equivalent_route_replaced_in_place() {
        let table = RoutingTable::new(test_prefixes());
        table.add_route(gossip(addr(9), addr(5), 50)).expect("add");
        // Same relays, fresher delay: replaces rather than duplicates.
        table.add_route(gossip(addr(9), addr(5), 10)).expect("add");
        let routes = table.routes_to(addr(9));
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].delay(), 20);
    }

    #[test]
    fn test_gossip_pruning_keeps_cap_and_peers() {
        let table = RoutingTable::new(test_prefixes());
        // Peers are exempt from pruning.
        table.add_route(RouteEntry::peer(addr(1000))).expect("add");
        for i in 0..100u16 {
            // Distinct destinations, one gossip route each; the bucket cap
            // for fd66::/16 is 5, the insert cap 2x that plus peers.
            let _ = table.add_route(gossip(addr(2000 + i), addr(5), 10 + i));
        }
        table.clean();
        let gossip_left = (0..100u16)
            .flat_map(|i| table.routes_to(addr(2000 + i)))
            .count();
        assert_eq!(gossip_left, 5);
        assert_eq!(table.routes_to(addr(1000)).len(), 1);
    }

    #[test]
    fn test_nearest_prefers_address_distance() {
        let table = RoutingTable::new(test_prefixes());
        for tail in [0x0000u16, 0x0080, 0x00FF] {
            table.add_route(RouteEntry::peer(addr(tail))).expect("add");
        }
        // 0x7F is distance 1 from 0x80 but 0x7F from 0x00.
        let nearest = table.lookup_nearest(addr(0x007F)).expect("nearest");
        assert_eq!(nearest.dst, addr(0x0080));
    }

    #[test]
    fn test_nearest_on_empty_table() {
        let table = RoutingTable::new(test_prefixes());
        assert!(table.lookup_nearest(addr(1)).is_none());
    }

    #[test]
    fn test_nearest_route_walks_past_stubs() {
        let table = RoutingTable::new(test_prefixes());
        let mut stub = RouteEntry::peer(addr(0x80));
        stub.is_stub = true;
        table.add_route(stub).expect("add");
        table.add_route(RouteEntry::peer(addr(0x10))).expect("add");

        // Exact destination: the stub itself is returned.
        assert_eq!(
            table.lookup_nearest_route(addr(0x80)).expect("route").dst,
            addr(0x80)
        );
        // Transit lookup near the stub walks to the non-stub neighbor.
        assert_eq!(
            table.lookup_nearest_route(addr(0x81)).expect("route").dst,
            addr(0x10)
        );
    }

    #[test]
    fn test_possible_paths_filters() {
        let table = RoutingTable::new(test_prefixes());
        table.add_route(gossip(addr(9), addr(5), 10)).expect("add");
        table.add_route(gossip(addr(10), addr(5), 10)).expect("add");
        table.add_route(gossip(addr(11), addr(6), 10)).expect("add");

        // Distinct next hops: the second route through addr(5) is skipped.
        let paths = table.lookup_possible_paths(addr(9), 3, u128::MAX, true, &[]);
        assert_eq!(paths.len(), 2);

        // Avoid the relay at addr(5) entirely.
        let paths = table.lookup_possible_paths(addr(9), 3, u128::MAX, false, &[addr(5)]);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].next_hop, addr(6));

        // Max results.
        let paths = table.lookup_possible_paths(addr(9), 1, u128::MAX, false, &[]);
        assert_eq!(paths.len(), 1);
    }

    #[test]
    fn test_remove_next_hop() {
        let table = RoutingTable::new(test_prefixes());
        table.add_route(gossip(addr(9), addr(5), 10)).expect("add");
        table.add_route(gossip(addr(10), addr(6), 10)).expect("add");
        table.remove_next_hop(addr(5));
        assert!(table.routes_to(addr(9)).is_empty());
        assert_eq!(table.routes_to(addr(10)).len(), 1);
    }

    #[test]
    fn test_remove_disconnected_spares_peers() {
        let table = RoutingTable::new(test_prefixes());
        table.add_route(RouteEntry::peer(addr(5))).expect("add");
        table.add_route(gossip(addr(9), addr(5), 10)).expect("add");
        table.remove_disconnected(addr(5), &[addr(5)]);
        assert_eq!(table.routes_to(addr(5)).len(), 1);
        assert!(table.routes_to(addr(9)).is_empty());
    }
}
