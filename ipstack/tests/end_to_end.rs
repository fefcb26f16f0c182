//! Two-host scenarios that exercise the full stack rather than one layer in
//! isolation: a three-way handshake followed by an echo and a graceful
//! close, a connection that never gets an answer running out of
//! retransmits, and a datagram routed by the most specific of two
//! overlapping routes.
//!
//! These wire two [`Stack`]s together with [`PairedDevice`] the same way
//! `demos/echo` does, but as assertions rather than a runnable demo.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ipstack::net::arp::ArpPacket;
use ipstack::net::device::{NetDevice, PairedDevice};
use ipstack::net::frame::{EthernetHeader, ARP_HEADER_LEN, ARP_OPER_REPLY};
use ipstack::net::ip::Ipv4Header;
use ipstack::Stack;
use ipstack_support::StackConfig;
use ipstack_types::{DevIndex, EtherType, IpProtocol, Ipv4Addr, MacAddr, Port, SockAddr};

fn fast_config() -> StackConfig {
    let mut cfg = StackConfig::default();
    cfg.arp_timeout = Duration::from_millis(100);
    cfg.tcp_rto = Duration::from_millis(20);
    cfg.tcp_max_retransmits = 3;
    cfg
}

#[test]
fn handshake_echo_and_graceful_close() {
    let client_ip = Ipv4Addr::from_bytes([10, 0, 0, 1]);
    let server_ip = Ipv4Addr::from_bytes([10, 0, 0, 2]);
    let mask = Ipv4Addr::from_bytes([255, 255, 255, 0]);
    let port = Port::new(9000);

    let (client_dev, server_dev) = PairedDevice::new_pair(MacAddr([1; 6]), MacAddr([2; 6]));

    let client = Stack::new(fast_config());
    client.net.add_interface(client_dev, client_ip, mask, Ipv4Addr::UNSPECIFIED).unwrap();
    client.start();

    let server = Stack::new(fast_config());
    server.net.add_interface(server_dev, server_ip, mask, Ipv4Addr::UNSPECIFIED).unwrap();
    server.start();

    let server_sockets = server.sockets.clone();
    let server_thread = thread::spawn(move || {
        let fd = server_sockets.socket();
        server_sockets.bind(fd, SockAddr::new(server_ip, port)).unwrap();
        server_sockets.listen(fd, 4).unwrap();
        let (conn, peer) = server_sockets.accept(fd).unwrap();
        assert_eq!(peer.ip, client_ip);
        let data = server_sockets.read(conn, 64).unwrap();
        let n = server_sockets.write(conn, &data).unwrap();
        assert_eq!(n, data.len());
        // The client closes next; draining until it sees the empty read
        // confirms the FIN made it across, not just the data.
        let eof = server_sockets.read(conn, 64).unwrap();
        assert!(eof.is_empty());
        server_sockets.close(conn);
        server_sockets.close(fd);
        data
    });

    thread::sleep(Duration::from_millis(30));
    let fd = client.sockets.socket();
    client.sockets.connect(fd, SockAddr::new(server_ip, port)).unwrap();
    let message = b"ping";
    assert_eq!(client.sockets.write(fd, message).unwrap(), message.len());
    let echoed = client.sockets.read(fd, 64).unwrap();
    assert_eq!(echoed, message);
    client.sockets.close(fd);

    let sent = server_thread.join().unwrap();
    assert_eq!(sent, message);
}

#[test]
fn retransmission_exhausted_without_a_peer() {
    // The peer device exists but nothing on it ever answers ARP or TCP, so
    // every SYN retransmit goes unanswered and the connection must give up
    // after `tcp_max_retransmits`.
    let (client_dev, _silent_peer) = PairedDevice::new_pair(MacAddr([1; 6]), MacAddr([2; 6]));
    let client = Stack::new(fast_config());
    client
        .net
        .add_interface(
            client_dev,
            Ipv4Addr::from_bytes([10, 0, 0, 1]),
            Ipv4Addr::from_bytes([255, 255, 255, 0]),
            Ipv4Addr::UNSPECIFIED,
        )
        .unwrap();
    client.start();

    let fd = client.sockets.socket();
    let remote = SockAddr::new(Ipv4Addr::from_bytes([10, 0, 0, 2]), Port::new(9001));
    let result = client.sockets.connect(fd, remote);
    assert!(result.is_err(), "a connection with no answering peer must eventually fail");
}

#[test]
fn longest_prefix_route_wins_end_to_end() {
    // A router with two links: a broad route pointing at the wrong one and
    // a specific route pointing at the right one. Only the specific route's
    // peer should ever see the datagram.
    let router = Stack::new(StackConfig::default());
    let (router_wrong_dev, wrong_peer) = PairedDevice::new_pair(MacAddr([1; 6]), MacAddr([0x0a; 6]));
    let (router_right_dev, right_peer) = PairedDevice::new_pair(MacAddr([2; 6]), MacAddr([0x0b; 6]));

    let wrong_dev_idx = router.net.add_interface(
        router_wrong_dev,
        Ipv4Addr::from_bytes([192, 168, 0, 1]),
        Ipv4Addr::from_bytes([255, 255, 255, 0]),
        Ipv4Addr::UNSPECIFIED,
    ).unwrap();
    let _right_dev_idx = router.net.add_interface(
        router_right_dev,
        Ipv4Addr::from_bytes([192, 168, 1, 1]),
        Ipv4Addr::from_bytes([255, 255, 255, 0]),
        Ipv4Addr::UNSPECIFIED,
    ).unwrap();
    router.start();

    let target = Ipv4Addr::from_bytes([192, 168, 1, 2]);
    let target_mac = MacAddr([0x0b; 6]);

    // A broad route toward the target's /16 that (wrongly, for this test)
    // points out the other interface. Longest-prefix match must prefer the
    // interface's own directly-connected /24 route installed by
    // `add_interface` for `192.168.1.0/24`, so this one must lose.
    router.net.routes.add_static(
        Ipv4Addr::from_bytes([192, 168, 0, 0]),
        16,
        Ipv4Addr::UNSPECIFIED,
        wrong_dev_idx,
        1,
    );

    let answered = thread::spawn(move || {
        let frame = right_peer.recv(Duration::from_secs(2)).expect("right peer sees a frame");
        let (eth, off) = EthernetHeader::parse(&frame).unwrap();
        match eth.ethertype {
            EtherType::Arp => {
                let req = ArpPacket::parse(&frame[off..]).unwrap();
                let reply = ArpPacket {
                    operation: ARP_OPER_REPLY,
                    sender_mac: target_mac,
                    sender_ip: req.target_ip,
                    target_mac: req.sender_mac,
                    target_ip: req.sender_ip,
                };
                let mut payload = vec![0u8; ARP_HEADER_LEN];
                reply.write(&mut payload);
                right_peer
                    .tx(&EthernetHeader::build_frame(req.sender_mac, target_mac, EtherType::Arp, &payload).unwrap())
                    .unwrap();
                let frame = right_peer.recv(Duration::from_secs(2)).expect("right peer sees the datagram");
                let (_, off) = EthernetHeader::parse(&frame).unwrap();
                let (header, hlen) = Ipv4Header::parse(&frame[off..]).expect("valid IPv4 datagram");
                (header.dst, frame[off..][hlen..].to_vec())
            }
            _ => panic!("expected an ARP request first"),
        }
    });

    let wrong_saw_nothing = thread::spawn(move || wrong_peer.recv(Duration::from_millis(300)));

    let payload = b"routed-correctly".to_vec();
    router
        .net
        .ip
        .send(&router.net.routes, Ipv4Addr::from_bytes([192, 168, 1, 1]), target, IpProtocol::Tcp, &payload)
        .unwrap();

    let (delivered_to, received_payload) = answered.join().unwrap();
    assert_eq!(delivered_to, target);
    assert_eq!(received_payload, payload);
    assert!(
        wrong_saw_nothing.join().unwrap().is_none(),
        "the less specific route's interface must never see this datagram"
    );
}

/// Sanity check that `DevIndex` equality (used throughout routing) behaves
/// the way the other tests assume.
#[test]
fn dev_index_equality() {
    assert_eq!(DevIndex(0), DevIndex(0));
    assert_ne!(DevIndex(0), DevIndex(1));
}
