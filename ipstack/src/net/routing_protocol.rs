//! Distance-vector routing updates, broadcast periodically over the custom
//! [`EtherType::RoutingUpdate`] ethertype.
//!
//! Every device periodically broadcasts its current view of the network
//! (subnet, netmask, hop count) to its neighbors. A received entry is
//! installed with hop count + 1 (one more hop through us) unless a cheaper
//! route already exists, and its next hop is the neighbor that advertised
//! it — not the destination itself, since a learned route is by definition
//! not directly connected. No split-horizon or poison-reverse — a neighbor
//! can and will hear its own route echoed back, consistent with keeping
//! this protocol deliberately simple; count-to-infinity in a partition is a
//! known, unaddressed consequence.

use std::sync::Arc;
use std::time::Duration;

use ipstack_types::{DevIndex, EtherType, Ipv4Addr, MacAddr};

use crate::net::device::DeviceRegistry;
use crate::net::frame::EthernetHeader;
use crate::net::route::{prefix_len_to_mask, RouteEntry, RouteSource, RouteTable};

// subnet(4) + mask(4) + hops(4), all network order, per the wire format.
const ENTRY_LEN: usize = 4 + 4 + 4;
const UPDATE_HEADER_LEN: usize = 4 + 4; // source IPv4 + entry count
const MAX_ENTRIES_PER_UPDATE: usize = 120; // keeps one update inside a single Ethernet frame

#[derive(Clone, Copy, Debug)]
pub struct DvEntry {
    pub prefix: Ipv4Addr,
    pub prefix_len: u8,
    pub hops: u32,
}

/// Serialize this host's routing view into a routing-update payload:
/// source IPv4, then entry count, then each entry's subnet/mask/hops, all
/// network order (spec §6). Caller passes its own address as `source_ip`
/// so the receiver knows which neighbor to route through.
pub fn encode_update(source_ip: Ipv4Addr, entries: &[DvEntry]) -> Vec<u8> {
    let n = entries.len().min(MAX_ENTRIES_PER_UPDATE);
    let mut out = Vec::with_capacity(UPDATE_HEADER_LEN + n * ENTRY_LEN);
    out.extend_from_slice(source_ip.as_bytes());
    out.extend_from_slice(&(n as u32).to_be_bytes());
    for entry in entries.iter().take(n) {
        out.extend_from_slice(entry.prefix.as_bytes());
        out.extend_from_slice(&prefix_len_to_mask(entry.prefix_len).to_be_bytes());
        out.extend_from_slice(&entry.hops.to_be_bytes());
    }
    out
}

/// Parse a routing-update payload back into its source and entries.
/// `None` if the header or entry count doesn't match what's actually
/// present — a malformed or truncated update is dropped wholesale rather
/// than partially applied.
pub fn decode_update(payload: &[u8]) -> Option<(Ipv4Addr, Vec<DvEntry>)> {
    if payload.len() < UPDATE_HEADER_LEN {
        return None;
    }
    let source_ip = Ipv4Addr::from_bytes(payload[0..4].try_into().unwrap());
    let count = u32::from_be_bytes(payload[4..8].try_into().unwrap()) as usize;
    if payload.len() != UPDATE_HEADER_LEN + count * ENTRY_LEN {
        return None;
    }
    let mut entries = Vec::with_capacity(count);
    let mut i = UPDATE_HEADER_LEN;
    for _ in 0..count {
        let prefix = Ipv4Addr::from_bytes(payload[i..i + 4].try_into().unwrap());
        let mask = u32::from_be_bytes(payload[i + 4..i + 8].try_into().unwrap());
        let hops = u32::from_be_bytes(payload[i + 8..i + 12].try_into().unwrap());
        entries.push(DvEntry {
            prefix,
            prefix_len: mask.leading_ones() as u8,
            hops,
        });
        i += ENTRY_LEN;
    }
    Some((source_ip, entries))
}

/// Merge a received update into the routing table: every entry gets one
/// more hop through the neighbor it arrived from, and that neighbor
/// becomes its next hop. Entries whose subnet is one of our own
/// directly-attached interfaces are dropped — we already have a direct
/// route to it and never want to learn a worse, indirect one.
pub fn apply_update(
    routes: &RouteTable,
    dev: DevIndex,
    source_ip: Ipv4Addr,
    entries: &[DvEntry],
    is_locally_attached: impl Fn(Ipv4Addr, u8) -> bool,
) {
    for entry in entries {
        if is_locally_attached(entry.prefix, entry.prefix_len) {
            continue;
        }
        let hops = entry.hops.saturating_add(1);
        routes.add(RouteEntry {
            prefix: entry.prefix,
            prefix_len: entry.prefix_len,
            gateway: source_ip,
            dev,
            metric: hops,
            source: RouteSource::Dynamic,
        });
    }
}

/// Spawn the background thread that periodically broadcasts this host's
/// route table to every registered device. Runs until the process exits —
/// there is no explicit stop handle; a full graceful shutdown is expected
/// to happen at process exit, not mid-run (this thread holds no resources
/// that need draining).
pub fn spawn_broadcaster(
    devices: Arc<DeviceRegistry>,
    routes: Arc<RouteTable>,
    our_ip_for: impl Fn(DevIndex) -> Option<Ipv4Addr> + Send + 'static,
    interval: Duration,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        std::thread::sleep(interval);
        let entries: Vec<DvEntry> = routes
            .all_routes()
            .into_iter()
            .map(|r| DvEntry {
                prefix: r.prefix,
                prefix_len: r.prefix_len,
                hops: r.metric,
            })
            .collect();
        if entries.is_empty() {
            continue;
        }
        for (dev_idx, mac) in devices.enumerate() {
            let Some(our_ip) = our_ip_for(dev_idx) else { continue };
            let payload = encode_update(our_ip, &entries);
            match EthernetHeader::build_frame(MacAddr::BROADCAST, mac, EtherType::RoutingUpdate, &payload) {
                Ok(frame) => {
                    if let Err(e) = devices.tx(dev_idx, &frame) {
                        log::warn!("routing: broadcast on dev{} failed: {}", dev_idx, e);
                    }
                }
                Err(e) => log::warn!("routing: update too large to broadcast on dev{}: {}", dev_idx, e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipstack_types::DevIndex;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::from_bytes([a, b, c, d])
    }

    #[test]
    fn update_round_trip() {
        let entries = vec![
            DvEntry { prefix: ip(10, 0, 0, 0), prefix_len: 24, hops: 1 },
            DvEntry { prefix: ip(192, 168, 1, 0), prefix_len: 24, hops: 3 },
        ];
        let source = ip(10, 0, 0, 1);
        let payload = encode_update(source, &entries);
        let (decoded_source, decoded) = decode_update(&payload).unwrap();
        assert_eq!(decoded_source, source);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].prefix, entries[0].prefix);
        assert_eq!(decoded[0].prefix_len, entries[0].prefix_len);
        assert_eq!(decoded[1].hops, 3);
    }

    #[test]
    fn truncated_update_is_rejected() {
        let entries = vec![DvEntry { prefix: ip(10, 0, 0, 0), prefix_len: 24, hops: 1 }];
        let mut payload = encode_update(ip(10, 0, 0, 1), &entries);
        payload.pop();
        assert!(decode_update(&payload).is_none());
    }

    #[test]
    fn applied_update_increments_hops_and_routes_via_the_neighbor() {
        let routes = RouteTable::new();
        let neighbor = ip(10, 0, 0, 2);
        let entries = vec![DvEntry { prefix: ip(172, 16, 0, 0), prefix_len: 16, hops: 2 }];
        apply_update(&routes, DevIndex(0), neighbor, &entries, |_, _| false);
        let all = routes.all_routes();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].metric, 3);
        assert_eq!(all[0].gateway, neighbor);
    }

    #[test]
    fn locally_attached_subnet_is_filtered_out() {
        let routes = RouteTable::new();
        let entries = vec![DvEntry { prefix: ip(10, 0, 0, 0), prefix_len: 24, hops: 1 }];
        apply_update(&routes, DevIndex(0), ip(10, 0, 0, 2), &entries, |_, _| true);
        assert!(routes.all_routes().is_empty());
    }
}
