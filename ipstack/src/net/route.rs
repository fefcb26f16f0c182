//! IPv4 routing: a prefix-length-bucketed table with longest-prefix-match
//! lookup, fed by both statically configured routes and a distance-vector
//! protocol running over a dedicated Ethernet type.
//!
//! # Architecture
//!
//! Routes are stored in 33 buckets (one per prefix length, /0 through /32).
//! Lookup scans from /32 down to /0, checking only routes at each prefix
//! length — O(32) regardless of table size. Within a bucket, routes are
//! sorted by metric so the first match is the best one.
//!
//! Static and dynamic (distance-vector-learned) routes share one table;
//! [`RouteEntry::source`] distinguishes them so the DV protocol never
//! overwrites an operator-configured route.

use std::fmt;
use std::sync::Mutex;

use ipstack_types::{DevIndex, Ipv4Addr};

const MAX_ROUTES_PER_BUCKET: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteSource {
    Static,
    /// Learned from a distance-vector update; `neighbor` is who advertised
    /// it, so the route can be withdrawn if its next hop through that
    /// neighbor is no longer viable (this stack does not implement
    /// explicit withdrawal — stale dynamic routes are superseded by fresher
    /// updates or simply time out of relevance as neighbors stop
    /// advertising them).
    Dynamic,
}

#[derive(Clone, Copy)]
pub struct RouteEntry {
    pub prefix: Ipv4Addr,
    pub prefix_len: u8,
    /// `Ipv4Addr::UNSPECIFIED` means directly connected.
    pub gateway: Ipv4Addr,
    pub dev: DevIndex,
    pub metric: u32,
    pub source: RouteSource,
}

impl RouteEntry {
    #[inline]
    pub fn matches(&self, dst: Ipv4Addr) -> bool {
        if self.prefix_len == 0 {
            return true;
        }
        let mask = prefix_len_to_mask(self.prefix_len);
        (dst.to_u32_be() & mask) == (self.prefix.to_u32_be() & mask)
    }

    #[inline]
    pub fn next_hop(&self, dst: Ipv4Addr) -> Ipv4Addr {
        if self.gateway.is_unspecified() {
            dst
        } else {
            self.gateway
        }
    }
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} via {} dev {} metric {} ({:?})",
            self.prefix, self.prefix_len, self.gateway, self.dev, self.metric, self.source
        )
    }
}

struct RouteTableInner {
    buckets: Vec<Vec<RouteEntry>>,
}

/// Longest-prefix-match IPv4 routing table, holding static and
/// distance-vector-learned routes side by side.
pub struct RouteTable {
    inner: Mutex<RouteTableInner>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RouteTableInner {
                buckets: (0..=32).map(|_| Vec::new()).collect(),
            }),
        }
    }

    pub fn add_static(&self, prefix: Ipv4Addr, prefix_len: u8, gateway: Ipv4Addr, dev: DevIndex, metric: u32) {
        self.add(RouteEntry {
            prefix,
            prefix_len,
            gateway,
            dev,
            metric,
            source: RouteSource::Static,
        });
    }

    /// Insert or update a route. Static routes always win ties with a
    /// dynamic route for the same prefix — the distance-vector protocol
    /// must never silently override operator configuration.
    pub fn add(&self, entry: RouteEntry) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let bucket = &mut inner.buckets[entry.prefix_len as usize];

        if let Some(existing) = bucket
            .iter_mut()
            .find(|r| r.prefix == entry.prefix && r.dev == entry.dev)
        {
            if existing.source == RouteSource::Static && entry.source == RouteSource::Dynamic {
                return false;
            }
            existing.gateway = entry.gateway;
            existing.metric = entry.metric;
            existing.source = entry.source;
            bucket.sort_by_key(|r| r.metric);
            return false;
        }

        if bucket.len() >= MAX_ROUTES_PER_BUCKET {
            return false;
        }
        let pos = bucket.partition_point(|r| r.metric <= entry.metric);
        bucket.insert(pos, entry);
        true
    }

    /// Longest-prefix-match lookup: returns the outgoing device and next
    /// hop for `dst`, or `None` if no route matches (not even a default).
    pub fn lookup(&self, dst: Ipv4Addr) -> Option<(DevIndex, Ipv4Addr)> {
        let inner = self.inner.lock().unwrap();
        for prefix_len in (0..=32u8).rev() {
            for route in &inner.buckets[prefix_len as usize] {
                if route.matches(dst) {
                    return Some((route.dev, route.next_hop(dst)));
                }
            }
        }
        None
    }

    /// Snapshot every route, for the distance-vector broadcast to
    /// advertise and for diagnostics.
    pub fn all_routes(&self) -> Vec<RouteEntry> {
        let inner = self.inner.lock().unwrap();
        inner.buckets.iter().flatten().copied().collect()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

pub fn prefix_len_to_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::from_bytes([a, b, c, d])
    }

    #[test]
    fn longest_prefix_wins() {
        let table = RouteTable::new();
        table.add_static(ip(10, 0, 0, 0), 8, Ipv4Addr::UNSPECIFIED, DevIndex(0), 1);
        table.add_static(ip(10, 0, 1, 0), 24, Ipv4Addr::UNSPECIFIED, DevIndex(1), 1);

        let (dev, _) = table.lookup(ip(10, 0, 1, 5)).unwrap();
        assert_eq!(dev, DevIndex(1));
        let (dev, _) = table.lookup(ip(10, 0, 2, 5)).unwrap();
        assert_eq!(dev, DevIndex(0));
    }

    #[test]
    fn static_route_not_overwritten_by_dynamic() {
        let table = RouteTable::new();
        table.add_static(ip(10, 0, 0, 0), 24, Ipv4Addr::UNSPECIFIED, DevIndex(0), 1);
        table.add(RouteEntry {
            prefix: ip(10, 0, 0, 0),
            prefix_len: 24,
            gateway: ip(10, 0, 0, 254),
            dev: DevIndex(0),
            metric: 1,
            source: RouteSource::Dynamic,
        });
        let (_, next_hop) = table.lookup(ip(10, 0, 0, 5)).unwrap();
        assert_eq!(next_hop, ip(10, 0, 0, 5), "static connected route must survive");
    }

    #[test]
    fn no_match_without_default() {
        let table = RouteTable::new();
        assert!(table.lookup(ip(8, 8, 8, 8)).is_none());
    }
}
