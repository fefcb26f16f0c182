//! Minimal echo client/server wired over an in-memory loopback pair,
//! exercising the full socket lifecycle this stack exposes: `socket`,
//! `bind`, `listen`, `accept`, `connect`, `read`, `write`, `close`.
//!
//! There is no real network interface here — `PairedDevice` stands in for
//! the raw packet-capture collaborator spec.md treats as external (§1, §6).
//! Everything above that boundary (ARP, routing, TCP, sockets) is the real
//! thing.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ipstack::net::device::PairedDevice;
use ipstack::Stack;
use ipstack_support::StackConfig;
use ipstack_types::{Ipv4Addr, MacAddr, Port, SockAddr};

const SERVER_IP: [u8; 4] = [10, 0, 0, 2];
const CLIENT_IP: [u8; 4] = [10, 0, 0, 1];
const SERVER_PORT: u16 = 7; // the classic echo port

fn main() {
    ipstack_support::logging::init();

    let (client_dev, server_dev) = PairedDevice::new_pair(MacAddr([0x02, 0, 0, 0, 0, 1]), MacAddr([0x02, 0, 0, 0, 0, 2]));

    let client = Stack::new(StackConfig::from_env());
    client
        .net
        .add_interface(client_dev, Ipv4Addr::from_bytes(CLIENT_IP), Ipv4Addr::from_bytes([255, 255, 255, 0]), Ipv4Addr::UNSPECIFIED)
        .expect("client interface");
    client.start();

    let server = Stack::new(StackConfig::from_env());
    server
        .net
        .add_interface(server_dev, Ipv4Addr::from_bytes(SERVER_IP), Ipv4Addr::from_bytes([255, 255, 255, 0]), Ipv4Addr::UNSPECIFIED)
        .expect("server interface");
    server.start();

    let server_thread = {
        let server = server.sockets.clone();
        thread::spawn(move || run_server(server))
    };

    run_client(&client.sockets);
    server_thread.join().expect("server thread panicked");

    client.shutdown();
    server.shutdown();
}

/// One iteration: accept a connection, echo everything it sends until the
/// peer closes, then exit (this demo serves exactly one client).
fn run_server(sockets: Arc<ipstack::SocketLayer>) {
    let fd = sockets.socket();
    sockets
        .bind(fd, SockAddr::new(Ipv4Addr::from_bytes(SERVER_IP), Port::new(SERVER_PORT)))
        .expect("bind");
    sockets.listen(fd, 4).expect("listen");
    log::info!("echo: listening on {}:{}", Ipv4Addr::from_bytes(SERVER_IP), SERVER_PORT);

    let (conn_fd, peer) = sockets.accept(fd).expect("accept");
    log::info!("echo: accepted connection from {}", peer);

    loop {
        let data = sockets.read(conn_fd, 4096).expect("read");
        if data.is_empty() {
            log::info!("echo: peer closed the connection");
            break;
        }
        let n = sockets.write(conn_fd, &data).expect("write");
        log::info!("echo: echoed {} bytes", n);
    }

    sockets.close(conn_fd);
    sockets.close(fd);
}

fn run_client(sockets: &ipstack::SocketLayer) {
    // Give the server a moment to reach PASSIVE_LISTENING before connecting.
    thread::sleep(Duration::from_millis(50));

    let fd = sockets.socket();
    sockets
        .connect(fd, SockAddr::new(Ipv4Addr::from_bytes(SERVER_IP), Port::new(SERVER_PORT)))
        .expect("connect");
    log::info!("echo: connected to server");

    let message = b"hello from the echo client\n";
    let written = sockets.write(fd, message).expect("write");
    assert_eq!(written, message.len());

    let mut received = Vec::new();
    while received.len() < message.len() {
        let chunk = sockets.read(fd, message.len() - received.len()).expect("read");
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, message);
    log::info!("echo: round trip confirmed, {} bytes", received.len());

    sockets.close(fd);
}
