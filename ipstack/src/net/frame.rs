//! Ethernet II framing: header parse/build and the protocol constants every
//! other module keys off of.

use ipstack_types::{EtherType, MacAddr, NetError, NetResult};

pub const ETH_HEADER_LEN: usize = 14;
pub const ETH_ADDR_LEN: usize = 6;

/// Minimum Ethernet frame size (header + payload, no CRC): the driver pads
/// on the wire if we don't, but this stack pads itself per spec so a short
/// ARP request or bare ACK never depends on driver behavior.
pub const MIN_FRAME_LEN: usize = 64;
/// Maximum Ethernet II frame size this stack will emit (header + a
/// standard 1500-byte MTU payload, no CRC).
pub const MAX_FRAME_LEN: usize = ETH_HEADER_LEN + 1500;

pub const ARP_HTYPE_ETHERNET: u16 = 1;
pub const ARP_HLEN_ETHERNET: u8 = 6;
pub const ARP_PLEN_IPV4: u8 = 4;
pub const ARP_OPER_REQUEST: u16 = 1;
pub const ARP_OPER_REPLY: u16 = 2;
pub const ARP_HEADER_LEN: usize = 28;

pub const IPV4_HEADER_LEN: usize = 20;

/// A parsed Ethernet II header.
#[derive(Clone, Copy, Debug)]
pub struct EthernetHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: EtherType,
}

impl EthernetHeader {
    /// Parse the 14-byte Ethernet header prefix of `frame`.
    ///
    /// Returns the header and the byte offset of the payload (always
    /// [`ETH_HEADER_LEN`]). `None` if the frame is shorter than a header or
    /// the ethertype field is not one this stack understands — unknown
    /// ethertypes are silently dropped by callers, per link-layer framing
    /// rules (only IPv4/ARP/the routing ethertype are in scope).
    pub fn parse(frame: &[u8]) -> Option<(Self, usize)> {
        if frame.len() < ETH_HEADER_LEN {
            return None;
        }
        let dst = MacAddr(frame[0..6].try_into().unwrap());
        let src = MacAddr(frame[6..12].try_into().unwrap());
        let ethertype = EtherType::from_u16(u16::from_be_bytes([frame[12], frame[13]]))?;
        Some((Self { dst, src, ethertype }, ETH_HEADER_LEN))
    }

    /// Serialize the header into `out[..ETH_HEADER_LEN]`.
    pub fn write(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= ETH_HEADER_LEN);
        out[0..6].copy_from_slice(self.dst.as_bytes());
        out[6..12].copy_from_slice(self.src.as_bytes());
        out[12..14].copy_from_slice(&self.ethertype.as_u16().to_be_bytes());
    }

    /// Build a complete frame: header followed by `payload`, padded with
    /// zeros to [`MIN_FRAME_LEN`] if short. Rejects payloads that would
    /// push the frame past [`MAX_FRAME_LEN`] rather than silently
    /// truncating or splitting them (fragmentation is out of scope here —
    /// callers that can exceed the MTU are responsible for staying under
    /// it themselves).
    pub fn build_frame(dst: MacAddr, src: MacAddr, ethertype: EtherType, payload: &[u8]) -> NetResult<Vec<u8>> {
        if ETH_HEADER_LEN + payload.len() > MAX_FRAME_LEN {
            return Err(NetError::InvalidArgument);
        }
        let mut frame = Vec::with_capacity((ETH_HEADER_LEN + payload.len()).max(MIN_FRAME_LEN));
        frame.resize(ETH_HEADER_LEN, 0);
        Self { dst, src, ethertype }.write(&mut frame);
        frame.extend_from_slice(payload);
        if frame.len() < MIN_FRAME_LEN {
            frame.resize(MIN_FRAME_LEN, 0);
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let frame = EthernetHeader::build_frame(
            MacAddr::BROADCAST,
            MacAddr([1, 2, 3, 4, 5, 6]),
            EtherType::Arp,
            &[0xde, 0xad],
        )
        .unwrap();
        let (hdr, off) = EthernetHeader::parse(&frame).unwrap();
        assert_eq!(hdr.dst, MacAddr::BROADCAST);
        assert_eq!(hdr.ethertype, EtherType::Arp);
        assert_eq!(&frame[off..off + 2], &[0xde, 0xad]);
    }

    #[test]
    fn rejects_short_frame() {
        assert!(EthernetHeader::parse(&[0u8; 10]).is_none());
    }

    #[test]
    fn short_payload_is_padded_to_minimum_frame_length() {
        let frame =
            EthernetHeader::build_frame(MacAddr::BROADCAST, MacAddr([1; 6]), EtherType::Arp, &[1, 2, 3]).unwrap();
        assert_eq!(frame.len(), MIN_FRAME_LEN);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = vec![0u8; MAX_FRAME_LEN];
        assert!(EthernetHeader::build_frame(MacAddr::BROADCAST, MacAddr([1; 6]), EtherType::Arp, &payload).is_err());
    }
}
