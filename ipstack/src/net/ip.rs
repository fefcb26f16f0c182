//! IPv4 send/receive: header construction, checksum, routing-driven
//! egress, and the receive-side forward-vs-deliver decision.
//!
//! Fragmentation/reassembly is out of scope — oversized datagrams are
//! rejected rather than split.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use ipstack_types::{DevIndex, IpProtocol, Ipv4Addr, NetError, NetResult};

use ipstack_support::BoundedQueue;

use crate::net::arp::ArpTable;
use crate::net::device::DeviceRegistry;
use crate::net::frame::{EthernetHeader, IPV4_HEADER_LEN};
use ipstack_types::EtherType;

#[derive(Clone, Copy, Debug)]
pub struct Ipv4Header {
    pub version_ihl: u8,
    pub total_len: u16,
    pub identification: u16,
    pub ttl: u8,
    pub protocol: IpProtocol,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    pub fn parse(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < IPV4_HEADER_LEN {
            return None;
        }
        let version_ihl = data[0];
        let version = version_ihl >> 4;
        let ihl = (version_ihl & 0x0f) as usize * 4;
        if version != 4 || ihl < IPV4_HEADER_LEN || data.len() < ihl {
            return None;
        }
        let total_len = u16::from_be_bytes([data[2], data[3]]);
        let identification = u16::from_be_bytes([data[4], data[5]]);
        let ttl = data[8];
        let protocol = IpProtocol::from_u8(data[9])?;
        let src = Ipv4Addr::from_bytes(data[12..16].try_into().unwrap());
        let dst = Ipv4Addr::from_bytes(data[16..20].try_into().unwrap());
        if checksum(&data[..ihl]) != 0 {
            return None;
        }
        Some((
            Self {
                version_ihl,
                total_len,
                identification,
                ttl,
                protocol,
                src,
                dst,
            },
            ihl,
        ))
    }

    /// Serialize the header (no options, `IHL = 5`) into `out[..20]` and
    /// patch in the checksum.
    pub fn write(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= IPV4_HEADER_LEN);
        out[0] = 0x45; // version 4, IHL 5
        out[1] = 0;
        out[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        out[4..6].copy_from_slice(&self.identification.to_be_bytes());
        out[6..8].copy_from_slice(&0u16.to_be_bytes()); // flags/fragment offset: no fragmentation
        out[8] = self.ttl;
        out[9] = self.protocol.as_u8();
        out[10..12].copy_from_slice(&0u16.to_be_bytes()); // checksum placeholder
        out[12..16].copy_from_slice(self.src.as_bytes());
        out[16..20].copy_from_slice(self.dst.as_bytes());
        let csum = checksum(&out[..IPV4_HEADER_LEN]);
        out[10..12].copy_from_slice(&csum.to_be_bytes());
    }
}

/// One's-complement checksum over an IPv4 header.
pub fn checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut i = 0;
    while i + 1 < header.len() {
        sum = sum.wrapping_add(u16::from_be_bytes([header[i], header[i + 1]]) as u32);
        i += 2;
    }
    if i < header.len() {
        sum = sum.wrapping_add((header[i] as u32) << 8);
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

const DEFAULT_TTL: u8 = 64;

struct QueuedDatagram {
    dev: DevIndex,
    next_hop: Ipv4Addr,
    frame_payload: Vec<u8>, // IP header + TCP segment, ready to wrap in Ethernet
}

/// IP egress: datagrams are queued per-process and drained by a dedicated
/// sender thread, so a caller blocked on a slow ARP resolution never stalls
/// an unrelated send. The queue is bounded — once full, `send` reports
/// backpressure rather than growing without limit.
pub struct IpLayer {
    devices: Arc<DeviceRegistry>,
    arp: Arc<ArpTable>,
    queue: Mutex<BoundedQueue<QueuedDatagram>>,
    next_id: AtomicU16,
}

impl IpLayer {
    pub fn new(devices: Arc<DeviceRegistry>, arp: Arc<ArpTable>, queue_cap: usize) -> Self {
        Self {
            devices,
            arp,
            queue: Mutex::new(BoundedQueue::new(queue_cap)),
            next_id: AtomicU16::new(1),
        }
    }

    /// Enqueue a TCP segment for delivery to `dst` with a fresh TTL.
    /// Performs the routing lookup immediately (so a missing route is
    /// reported synchronously) but defers ARP resolution and the actual
    /// transmit to the egress thread.
    pub fn send(
        &self,
        routes: &crate::net::route::RouteTable,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: IpProtocol,
        payload: &[u8],
    ) -> NetResult<()> {
        self.send_with_ttl(routes, src, dst, protocol, DEFAULT_TTL, payload)
    }

    /// Enqueue a datagram that is being forwarded rather than originated:
    /// `ttl` is whatever the caller already decremented, and the header
    /// checksum is recomputed over it (spec §4.4).
    pub fn forward(
        &self,
        routes: &crate::net::route::RouteTable,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: IpProtocol,
        ttl: u8,
        payload: &[u8],
    ) -> NetResult<()> {
        self.send_with_ttl(routes, src, dst, protocol, ttl, payload)
    }

    fn send_with_ttl(
        &self,
        routes: &crate::net::route::RouteTable,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: IpProtocol,
        ttl: u8,
        payload: &[u8],
    ) -> NetResult<()> {
        if crate::net::frame::ETH_HEADER_LEN + IPV4_HEADER_LEN + payload.len() > crate::net::frame::MAX_FRAME_LEN {
            return Err(NetError::InvalidArgument);
        }
        let (dev, next_hop) = routes.lookup(dst).ok_or(NetError::NoRoute)?;
        let total_len = (IPV4_HEADER_LEN + payload.len()) as u16;
        let header = Ipv4Header {
            version_ihl: 0x45,
            total_len,
            identification: self.next_id.fetch_add(1, Ordering::Relaxed),
            ttl,
            protocol,
            src,
            dst,
        };
        let mut datagram = vec![0u8; IPV4_HEADER_LEN];
        header.write(&mut datagram);
        datagram.extend_from_slice(payload);

        // A full queue spin-pushes rather than dropping (spec §4.4/§9: a
        // documented limitation, not a design we're free to improve away).
        // The datagram is only moved into the queue once room is
        // confirmed under the same lock acquisition, so a full queue never
        // silently discards it.
        let mut pending = Some(QueuedDatagram {
            dev,
            next_hop,
            frame_payload: datagram,
        });
        loop {
            let mut queue = self.queue.lock().unwrap();
            if !queue.is_full() {
                let item = pending.take().expect("pushed exactly once");
                assert!(queue.push(item), "checked not full under the same lock");
                return Ok(());
            }
            drop(queue);
            std::thread::sleep(std::time::Duration::from_micros(200));
        }
    }

    /// Drain one queued datagram, resolving its next hop over ARP and
    /// transmitting the Ethernet frame. Intended to be called in a loop by
    /// a dedicated egress thread; returns `false` when the queue was empty
    /// so the caller can back off briefly.
    pub fn drain_one(&self, our_ip_for: impl Fn(DevIndex) -> Option<Ipv4Addr>) -> bool {
        let queued = {
            let mut queue = self.queue.lock().unwrap();
            match queue.pop() {
                Some(q) => q,
                None => return false,
            }
        };
        let our_ip = match our_ip_for(queued.dev) {
            Some(ip) => ip,
            None => {
                log::warn!("ip: dev{} has no configured address, dropping datagram", queued.dev);
                return true;
            }
        };
        let our_mac = match self.devices.get(queued.dev) {
            Some(dev) => dev.mac(),
            None => return true,
        };
        match self.arp.resolve(&self.devices, queued.dev, our_ip, queued.next_hop) {
            Ok(dst_mac) => {
                match EthernetHeader::build_frame(dst_mac, our_mac, EtherType::Ipv4, &queued.frame_payload) {
                    Ok(frame) => {
                        if let Err(e) = self.devices.tx(queued.dev, &frame) {
                            log::warn!("ip: tx on dev{} failed: {}", queued.dev, e);
                        }
                    }
                    Err(e) => log::warn!("ip: datagram too large for a frame: {}", e),
                }
            }
            Err(e) => {
                log::warn!("ip: could not resolve {}: {}", queued.next_hop, e);
            }
        }
        true
    }
}

/// Outcome of handling a received IPv4 datagram.
pub enum Ipv4Disposition {
    /// Addressed to us; `payload` is the protocol payload past the header.
    Deliver { header: Ipv4Header, payload: Vec<u8> },
    /// Not addressed to us; forwarded to the next hop (or dropped if TTL
    /// expired / no route existed).
    Forwarded,
    Dropped,
}

/// Handle one received IPv4 datagram: deliver locally, forward, or drop.
#[allow(clippy::too_many_arguments)]
pub fn handle_rx(
    ip_layer: &IpLayer,
    routes: &crate::net::route::RouteTable,
    data: &[u8],
    is_our_addr: impl Fn(Ipv4Addr) -> bool,
    our_ip_for: impl Fn(DevIndex) -> Option<Ipv4Addr>,
) -> Ipv4Disposition {
    let (header, header_len) = match Ipv4Header::parse(data) {
        Some(h) => h,
        None => return Ipv4Disposition::Dropped,
    };
    let payload = &data[header_len..];

    if is_our_addr(header.dst) {
        return Ipv4Disposition::Deliver {
            header,
            payload: payload.to_vec(),
        };
    }

    if header.ttl <= 1 {
        log::debug!("ip: dropping {} -> {} (ttl expired)", header.src, header.dst);
        return Ipv4Disposition::Dropped;
    }

    let forwarded_ttl = header.ttl - 1;
    match ip_layer.forward(routes, header.src, header.dst, header.protocol, forwarded_ttl, payload) {
        Ok(()) => {
            let _ = our_ip_for; // next-hop resolution happens in drain_one
            Ipv4Disposition::Forwarded
        }
        Err(e) => {
            log::debug!("ip: forward {} -> {} failed: {}", header.src, header.dst, e);
            Ipv4Disposition::Dropped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_checksum_valid() {
        let header = Ipv4Header {
            version_ihl: 0x45,
            total_len: 40,
            identification: 7,
            ttl: 64,
            protocol: IpProtocol::Tcp,
            src: Ipv4Addr::from_bytes([10, 0, 0, 1]),
            dst: Ipv4Addr::from_bytes([10, 0, 0, 2]),
        };
        let mut buf = [0u8; IPV4_HEADER_LEN];
        header.write(&mut buf);
        let (parsed, len) = Ipv4Header::parse(&buf).expect("valid header");
        assert_eq!(len, IPV4_HEADER_LEN);
        assert_eq!(parsed.src, header.src);
        assert_eq!(parsed.dst, header.dst);
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let header = Ipv4Header {
            version_ihl: 0x45,
            total_len: 40,
            identification: 7,
            ttl: 64,
            protocol: IpProtocol::Tcp,
            src: Ipv4Addr::from_bytes([10, 0, 0, 1]),
            dst: Ipv4Addr::from_bytes([10, 0, 0, 2]),
        };
        let mut buf = [0u8; IPV4_HEADER_LEN];
        header.write(&mut buf);
        buf[12] ^= 0xff; // corrupt source address after checksum was computed
        assert!(Ipv4Header::parse(&buf).is_none());
    }
}
