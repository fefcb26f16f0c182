//! Address Resolution Protocol: IPv4-to-MAC resolution with coalesced
//! blocking queries.
//!
//! Unlike the rest of the link layer, ARP lookups are synchronous from a
//! caller's point of view: [`ArpTable::resolve`] blocks the calling thread
//! until a reply arrives, the query times out, or another thread's
//! in-flight query for the same address resolves first. Concurrent callers
//! resolving the same address share one request-reply round trip instead
//! of each sending their own — the per-IP [`Condvar`] is what lets a
//! "waiter" wake as soon as any caller's request completes.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ipstack_types::{DevIndex, MacAddr, NetError, NetResult, Ipv4Addr};

use crate::net::device::DeviceRegistry;
use crate::net::frame::{
    EthernetHeader, ARP_HEADER_LEN, ARP_HLEN_ETHERNET, ARP_HTYPE_ETHERNET, ARP_OPER_REPLY,
    ARP_OPER_REQUEST, ARP_PLEN_IPV4,
};
use ipstack_types::EtherType;

/// A parsed ARP packet (Ethernet/IPv4 only — other hardware/protocol
/// combinations are rejected during parsing).
#[derive(Clone, Copy, Debug)]
pub struct ArpPacket {
    pub operation: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < ARP_HEADER_LEN {
            return None;
        }
        let htype = u16::from_be_bytes([payload[0], payload[1]]);
        let ptype = u16::from_be_bytes([payload[2], payload[3]]);
        let hlen = payload[4];
        let plen = payload[5];
        if htype != ARP_HTYPE_ETHERNET || ptype != EtherType::Ipv4.as_u16() {
            return None;
        }
        if hlen != ARP_HLEN_ETHERNET || plen != ARP_PLEN_IPV4 {
            return None;
        }
        let operation = u16::from_be_bytes([payload[6], payload[7]]);
        let sender_mac = MacAddr(payload[8..14].try_into().unwrap());
        let sender_ip = Ipv4Addr::from_bytes(payload[14..18].try_into().unwrap());
        let target_mac = MacAddr(payload[18..24].try_into().unwrap());
        let target_ip = Ipv4Addr::from_bytes(payload[24..28].try_into().unwrap());
        Some(Self {
            operation,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= ARP_HEADER_LEN);
        out[0..2].copy_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
        out[2..4].copy_from_slice(&EtherType::Ipv4.as_u16().to_be_bytes());
        out[4] = ARP_HLEN_ETHERNET;
        out[5] = ARP_PLEN_IPV4;
        out[6..8].copy_from_slice(&self.operation.to_be_bytes());
        out[8..14].copy_from_slice(self.sender_mac.as_bytes());
        out[14..18].copy_from_slice(self.sender_ip.as_bytes());
        out[18..24].copy_from_slice(self.target_mac.as_bytes());
        out[24..28].copy_from_slice(self.target_ip.as_bytes());
    }
}

struct PendingQuery {
    result: Mutex<Option<MacAddr>>,
    condvar: Condvar,
}

/// IPv4-to-MAC resolution table with a request-coalescing blocking query
/// path.
///
/// A resolved entry never expires on its own within a run — this stack has
/// no ARP cache eviction policy (out of scope); entries are replaced
/// in-place when a fresher reply arrives for the same address.
pub struct ArpTable {
    cache: Mutex<HashMap<(DevIndex, Ipv4Addr), MacAddr>>,
    pending: Mutex<HashMap<(DevIndex, Ipv4Addr), Arc<PendingQuery>>>,
    timeout: Duration,
}

impl ArpTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Resolve `ip` on `dev` to a MAC address, blocking for up to the
    /// configured timeout if no cached entry exists.
    ///
    /// Concurrent callers for the same `(dev, ip)` coalesce onto a single
    /// outstanding request: only the first caller transmits an ARP
    /// request; later callers register as waiters and wake when that
    /// request resolves (or times out) rather than sending their own.
    pub fn resolve(
        &self,
        devices: &DeviceRegistry,
        dev: DevIndex,
        our_ip: Ipv4Addr,
        ip: Ipv4Addr,
    ) -> NetResult<MacAddr> {
        if let Some(mac) = self.cache.lock().unwrap().get(&(dev, ip)).copied() {
            return Ok(mac);
        }

        let (query, is_leader) = {
            let mut pending = self.pending.lock().unwrap();
            if let Some(existing) = pending.get(&(dev, ip)) {
                (existing.clone(), false)
            } else {
                let query = Arc::new(PendingQuery {
                    result: Mutex::new(None),
                    condvar: Condvar::new(),
                });
                pending.insert((dev, ip), query.clone());
                (query, true)
            }
        };

        if is_leader {
            let our_mac = devices
                .get(dev)
                .map(|d| d.mac())
                .ok_or(NetError::NoRoute)?;
            let req = ArpPacket {
                operation: ARP_OPER_REQUEST,
                sender_mac: our_mac,
                sender_ip: our_ip,
                target_mac: MacAddr::ZERO,
                target_ip: ip,
            };
            let mut payload = vec![0u8; ARP_HEADER_LEN];
            req.write(&mut payload);
            let frame = EthernetHeader::build_frame(MacAddr::BROADCAST, our_mac, EtherType::Arp, &payload)
                .expect("fixed-size ARP payload always fits a frame");
            log::debug!("arp: query {} on dev{}", ip, dev);
            if let Err(e) = devices.tx(dev, &frame) {
                self.pending.lock().unwrap().remove(&(dev, ip));
                log::warn!("arp: query {} on dev{} failed to send: {}", ip, dev, e);
                return Err(e);
            }
        }

        let deadline = Instant::now() + self.timeout;
        let mut guard = query.result.lock().unwrap();
        loop {
            if let Some(mac) = *guard {
                self.pending.lock().unwrap().remove(&(dev, ip));
                return Ok(mac);
            }
            let now = Instant::now();
            if now >= deadline {
                if is_leader {
                    self.pending.lock().unwrap().remove(&(dev, ip));
                }
                log::warn!("arp: query {} on dev{} timed out", ip, dev);
                return Err(NetError::ArpTimeout);
            }
            let (g, timed_out) = query
                .condvar
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = g;
            if timed_out.timed_out() {
                continue;
            }
        }
    }

    /// Handle a received ARP packet: satisfy any matching pending query,
    /// learn the sender's mapping, and reply to requests addressed to us.
    pub fn handle_rx(
        &self,
        devices: &DeviceRegistry,
        dev: DevIndex,
        our_mac: MacAddr,
        our_ip: Ipv4Addr,
        pkt: &ArpPacket,
    ) {
        self.cache
            .lock()
            .unwrap()
            .insert((dev, pkt.sender_ip), pkt.sender_mac);

        if let Some(query) = self.pending.lock().unwrap().get(&(dev, pkt.sender_ip)).cloned() {
            *query.result.lock().unwrap() = Some(pkt.sender_mac);
            query.condvar.notify_all();
        }

        if pkt.operation == ARP_OPER_REQUEST && pkt.target_ip == our_ip {
            let reply = ArpPacket {
                operation: ARP_OPER_REPLY,
                sender_mac: our_mac,
                sender_ip: our_ip,
                target_mac: pkt.sender_mac,
                target_ip: pkt.sender_ip,
            };
            let mut payload = vec![0u8; ARP_HEADER_LEN];
            reply.write(&mut payload);
            let frame = EthernetHeader::build_frame(pkt.sender_mac, our_mac, EtherType::Arp, &payload)
                .expect("fixed-size ARP payload always fits a frame");
            log::debug!("arp: replying to {} on dev{}", pkt.sender_ip, dev);
            let _ = devices.tx(dev, &frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::{NetDevice, PairedDevice};

    #[test]
    fn arp_packet_round_trip() {
        let pkt = ArpPacket {
            operation: ARP_OPER_REQUEST,
            sender_mac: MacAddr([1; 6]),
            sender_ip: Ipv4Addr::from_bytes([10, 0, 0, 1]),
            target_mac: MacAddr::ZERO,
            target_ip: Ipv4Addr::from_bytes([10, 0, 0, 2]),
        };
        let mut buf = [0u8; ARP_HEADER_LEN];
        pkt.write(&mut buf);
        let parsed = ArpPacket::parse(&buf).unwrap();
        assert_eq!(parsed.sender_ip, pkt.sender_ip);
        assert_eq!(parsed.operation, ARP_OPER_REQUEST);
    }

    #[test]
    fn resolve_times_out_with_no_reply() {
        let (dev_a, _dev_b) = PairedDevice::new_pair(MacAddr([1; 6]), MacAddr([2; 6]));
        let registry = DeviceRegistry::new();
        let idx = registry.register(dev_a);
        let table = ArpTable::new(Duration::from_millis(30));
        let result = table.resolve(
            &registry,
            idx,
            Ipv4Addr::from_bytes([10, 0, 0, 1]),
            Ipv4Addr::from_bytes([10, 0, 0, 9]),
        );
        assert_eq!(result, Err(NetError::ArpTimeout));
    }

    #[test]
    fn resolve_succeeds_after_reply_injected() {
        let (dev_a, dev_b) = PairedDevice::new_pair(MacAddr([1; 6]), MacAddr([2; 6]));
        let registry = Arc::new(DeviceRegistry::new());
        let idx = registry.register(dev_a.clone());
        let table = Arc::new(ArpTable::new(Duration::from_millis(500)));

        let our_ip = Ipv4Addr::from_bytes([10, 0, 0, 1]);
        let target_ip = Ipv4Addr::from_bytes([10, 0, 0, 2]);

        let t = {
            let table = table.clone();
            let registry = registry.clone();
            std::thread::spawn(move || table.resolve(&registry, idx, our_ip, target_ip))
        };

        // `dev_b` is the peer's side of the wire: read the request that
        // crossed over, then answer it exactly as a real host would.
        let frame = dev_b.recv(Duration::from_millis(200)).expect("request sent");
        let (_, off) = EthernetHeader::parse(&frame).unwrap();
        let req = ArpPacket::parse(&frame[off..]).unwrap();
        assert_eq!(req.operation, ARP_OPER_REQUEST);

        let reply = ArpPacket {
            operation: ARP_OPER_REPLY,
            sender_mac: MacAddr([2; 6]),
            sender_ip: target_ip,
            target_mac: MacAddr([1; 6]),
            target_ip: our_ip,
        };
        let mut payload = vec![0u8; ARP_HEADER_LEN];
        reply.write(&mut payload);
        dev_b
            .tx(&EthernetHeader::build_frame(MacAddr([1; 6]), MacAddr([2; 6]), EtherType::Arp, &payload).unwrap())
            .unwrap();

        let frame_in = dev_a.recv(Duration::from_millis(200)).expect("reply arrived");
        let (_, off2) = EthernetHeader::parse(&frame_in).unwrap();
        let reply_pkt = ArpPacket::parse(&frame_in[off2..]).unwrap();
        table.handle_rx(&registry, idx, MacAddr([1; 6]), our_ip, &reply_pkt);

        let resolved = t.join().unwrap().expect("resolve should succeed");
        assert_eq!(resolved, MacAddr([2; 6]));
    }

    #[test]
    fn concurrent_resolves_for_the_same_address_coalesce_onto_one_request() {
        let (dev_a, dev_b) = PairedDevice::new_pair(MacAddr([1; 6]), MacAddr([2; 6]));
        let registry = Arc::new(DeviceRegistry::new());
        let idx = registry.register(dev_a.clone());
        let table = Arc::new(ArpTable::new(Duration::from_millis(500)));

        let our_ip = Ipv4Addr::from_bytes([10, 0, 0, 1]);
        let target_ip = Ipv4Addr::from_bytes([10, 0, 0, 2]);

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let table = table.clone();
                let registry = registry.clone();
                std::thread::spawn(move || table.resolve(&registry, idx, our_ip, target_ip))
            })
            .collect();

        // Only the leader transmits; the first frame to cross must be the
        // request, and no second request follows it.
        let frame = dev_b.recv(Duration::from_millis(200)).expect("one request sent");
        let (_, off) = EthernetHeader::parse(&frame).unwrap();
        assert_eq!(ArpPacket::parse(&frame[off..]).unwrap().operation, ARP_OPER_REQUEST);
        assert!(
            dev_b.recv(Duration::from_millis(50)).is_none(),
            "waiters must not send their own requests"
        );

        let reply = ArpPacket {
            operation: ARP_OPER_REPLY,
            sender_mac: MacAddr([2; 6]),
            sender_ip: target_ip,
            target_mac: MacAddr([1; 6]),
            target_ip: our_ip,
        };
        let mut payload = vec![0u8; ARP_HEADER_LEN];
        reply.write(&mut payload);
        dev_b
            .tx(&EthernetHeader::build_frame(MacAddr([1; 6]), MacAddr([2; 6]), EtherType::Arp, &payload).unwrap())
            .unwrap();

        let frame_in = dev_a.recv(Duration::from_millis(200)).expect("reply arrived");
        let (_, off2) = EthernetHeader::parse(&frame_in).unwrap();
        let reply_pkt = ArpPacket::parse(&frame_in[off2..]).unwrap();
        table.handle_rx(&registry, idx, MacAddr([1; 6]), our_ip, &reply_pkt);

        for w in waiters {
            assert_eq!(w.join().unwrap().expect("every waiter resolves"), MacAddr([2; 6]));
        }
    }
}
