//! Application-facing socket layer: file descriptors, connection setup,
//! and the busy-poll glue that turns the non-blocking TCP engine into
//! blocking `read`/`write`/`accept`/`connect` calls.
//!
//! Descriptors below [`FD_BASE`] belong to the host OS and are never issued
//! here; this layer only ever hands out descriptors starting at 1000.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ipstack_types::{Ipv4Addr, NetError, NetResult, Port, SockAddr};

use super::tcp::{TcpState, TcpTuple};
use super::NetStack;

pub const FD_BASE: i32 = 1000;

const EPHEMERAL_START: u16 = 10_000;
const EPHEMERAL_END: u16 = 20_000; // exclusive
const EPHEMERAL_COUNT: usize = (EPHEMERAL_END - EPHEMERAL_START) as usize;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const READ_WRITE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Round-robin ephemeral port allocator over `[10000, 20000)`.
struct EphemeralPorts {
    bitmap: [u8; EPHEMERAL_COUNT / 8],
    next: u16,
    allocated: usize,
}

impl EphemeralPorts {
    fn new() -> Self {
        Self {
            bitmap: [0; EPHEMERAL_COUNT / 8],
            next: EPHEMERAL_START,
            allocated: 0,
        }
    }

    fn bit(&self, port: u16) -> bool {
        let idx = (port - EPHEMERAL_START) as usize;
        self.bitmap[idx / 8] & (1 << (idx % 8)) != 0
    }

    fn set(&mut self, port: u16, val: bool) {
        let idx = (port - EPHEMERAL_START) as usize;
        if val {
            self.bitmap[idx / 8] |= 1 << (idx % 8);
        } else {
            self.bitmap[idx / 8] &= !(1 << (idx % 8));
        }
    }

    fn alloc(&mut self) -> Option<Port> {
        if self.allocated >= EPHEMERAL_COUNT {
            return None;
        }
        for offset in 0..EPHEMERAL_COUNT {
            let candidate = EPHEMERAL_START + ((self.next - EPHEMERAL_START + offset as u16) % EPHEMERAL_COUNT as u16);
            if !self.bit(candidate) {
                self.set(candidate, true);
                self.allocated += 1;
                self.next = if candidate + 1 == EPHEMERAL_END { EPHEMERAL_START } else { candidate + 1 };
                return Some(Port::new(candidate));
            }
        }
        None
    }

    fn release(&mut self, port: Port) {
        let p = port.as_u16();
        if (EPHEMERAL_START..EPHEMERAL_END).contains(&p) && self.bit(p) {
            self.set(p, false);
            self.allocated -= 1;
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SockState {
    Default,
    Active,
    PassiveBound,
    PassiveListening,
    Closed,
}

/// Options this stack actually implements, grounded in the subset of
/// `setsockopt`/`getsockopt` that makes sense over a stop-and-wait TCP with
/// no flow control: timeouts, address reuse, and last-error retrieval.
#[derive(Clone, Copy, Default)]
pub struct SocketOptions {
    pub recv_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
    pub reuse_addr: bool,
}

struct SocketBlock {
    state: SockState,
    local: Option<SockAddr>,
    tuple: Option<TcpTuple>,
    backlog: usize,
    ephemeral: Option<Port>,
    options: SocketOptions,
    last_error: Option<NetError>,
}

impl SocketBlock {
    fn new() -> Self {
        Self {
            state: SockState::Default,
            local: None,
            tuple: None,
            backlog: 0,
            ephemeral: None,
            options: SocketOptions::default(),
            last_error: None,
        }
    }
}

/// Owns the fd table and every socket's bookkeeping; delegates connection
/// state entirely to [`super::tcp::TcpEngine`].
pub struct SocketLayer {
    stack: std::sync::Arc<NetStack>,
    sockets: Mutex<HashMap<i32, SocketBlock>>,
    next_fd: AtomicI32,
    ephemeral: Mutex<EphemeralPorts>,
    listener_ports: Mutex<HashMap<Port, i32>>,
}

impl SocketLayer {
    pub fn new(stack: std::sync::Arc<NetStack>) -> Self {
        Self {
            stack,
            sockets: Mutex::new(HashMap::new()),
            next_fd: AtomicI32::new(FD_BASE),
            ephemeral: Mutex::new(EphemeralPorts::new()),
            listener_ports: Mutex::new(HashMap::new()),
        }
    }

    pub fn socket(&self) -> i32 {
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.sockets.lock().unwrap().insert(fd, SocketBlock::new());
        fd
    }

    pub fn bind(&self, fd: i32, addr: SockAddr) -> NetResult<()> {
        let mut sockets = self.sockets.lock().unwrap();
        let sock = sockets.get_mut(&fd).ok_or(NetError::InvalidArgument)?;
        if sock.state != SockState::Default {
            return Err(NetError::WrongState);
        }
        sock.local = Some(addr);
        sock.state = SockState::PassiveBound;
        Ok(())
    }

    pub fn listen(&self, fd: i32, backlog: usize) -> NetResult<()> {
        let mut sockets = self.sockets.lock().unwrap();
        let sock = sockets.get_mut(&fd).ok_or(NetError::InvalidArgument)?;
        if sock.state != SockState::PassiveBound {
            return Err(NetError::WrongState);
        }
        let local = sock.local.ok_or(NetError::SocketNotBound)?;
        self.stack.tcp.register_listener(local.port, backlog)?;
        sock.backlog = backlog;
        sock.state = SockState::PassiveListening;
        self.listener_ports.lock().unwrap().insert(local.port, fd);
        Ok(())
    }

    /// Busy-wait (10ms polls) for a fully established child connection.
    /// `deadline` bounds the wait when the caller set `SO_RCVTIMEO`-style
    /// behavior via [`SocketLayer::set_options`]; `None` waits forever.
    pub fn accept(&self, fd: i32) -> NetResult<(i32, SockAddr)> {
        let port = {
            let sockets = self.sockets.lock().unwrap();
            let sock = sockets.get(&fd).ok_or(NetError::InvalidArgument)?;
            if sock.state != SockState::PassiveListening {
                return Err(NetError::WrongState);
            }
            sock.local.unwrap().port
        };
        let deadline = self.recv_deadline(fd);
        loop {
            if let Some(tuple) = self.stack.tcp.accept(port) {
                let new_fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
                let peer = SockAddr::new(tuple.remote_ip, tuple.remote_port);
                let mut block = SocketBlock::new();
                block.state = SockState::Active;
                block.tuple = Some(tuple);
                self.sockets.lock().unwrap().insert(new_fd, block);
                return Ok((new_fd, peer));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(NetError::TimedOut);
            }
            std::thread::sleep(ACCEPT_POLL_INTERVAL);
        }
    }

    /// Assigns an ephemeral local port, opens an active TCB, and busy-waits
    /// until the handshake completes or the connection is aborted.
    pub fn connect(&self, fd: i32, remote: SockAddr) -> NetResult<()> {
        let local_ip = self
            .stack
            .first_ipv4()
            .ok_or(NetError::AddressNotAvailable)?;
        let port = {
            let mut sockets = self.sockets.lock().unwrap();
            let sock = sockets.get_mut(&fd).ok_or(NetError::InvalidArgument)?;
            if sock.state != SockState::Default {
                return Err(NetError::WrongState);
            }
            let port = self.ephemeral.lock().unwrap().alloc().ok_or(NetError::NoBufferSpace)?;
            sock.ephemeral = Some(port);
            port
        };
        let local = SockAddr::new(local_ip, port);
        let tuple = match self.stack.tcp.open_active(local, remote) {
            Ok(t) => t,
            Err(e) => {
                self.ephemeral.lock().unwrap().release(port);
                return Err(e);
            }
        };

        let deadline = self.recv_deadline(fd);
        loop {
            match self.stack.tcp.state_of(tuple) {
                Some(TcpState::Established) => break,
                Some(TcpState::Closed) | None => {
                    self.ephemeral.lock().unwrap().release(port);
                    return Err(NetError::ConnectionRefused);
                }
                _ => {}
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(NetError::TimedOut);
            }
            std::thread::sleep(CONNECT_POLL_INTERVAL);
        }

        let mut sockets = self.sockets.lock().unwrap();
        let sock = sockets.get_mut(&fd).unwrap();
        sock.tuple = Some(tuple);
        sock.local = Some(local);
        sock.state = SockState::Active;
        Ok(())
    }

    /// Loop `tcp_receive` until at least one byte arrives, the peer's
    /// stream has ended, or the deadline (if any) passes.
    pub fn read(&self, fd: i32, max: usize) -> NetResult<Vec<u8>> {
        let tuple = self.active_tuple(fd)?;
        let deadline = self.recv_deadline(fd);
        loop {
            let data = self.stack.tcp.receive(tuple, max);
            if !data.is_empty() {
                return Ok(data);
            }
            if self.stack.tcp.peer_closed_and_drained(tuple) {
                return Ok(Vec::new());
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(NetError::TimedOut);
            }
            std::thread::sleep(READ_WRITE_POLL_INTERVAL);
        }
    }

    /// Loop `tcp_send` until every byte is enqueued or the connection can
    /// no longer accept data, in which case a short write is returned.
    pub fn write(&self, fd: i32, data: &[u8]) -> NetResult<usize> {
        let tuple = self.active_tuple(fd)?;
        let deadline = self.send_deadline(fd);
        let mut written = 0;
        while written < data.len() {
            match self.stack.tcp.send(tuple, &data[written..]) {
                Ok(n) => written += n,
                Err(NetError::WrongState) => break,
                Err(e) => return Err(e),
            }
            if written < data.len() {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(NetError::TimedOut);
                }
                std::thread::sleep(READ_WRITE_POLL_INTERVAL);
            }
        }
        Ok(written)
    }

    pub fn close(&self, fd: i32) {
        let mut sockets = self.sockets.lock().unwrap();
        let Some(mut sock) = sockets.remove(&fd) else { return };
        match sock.state {
            SockState::Active => {
                if let Some(tuple) = sock.tuple {
                    self.stack.tcp.close(tuple);
                }
            }
            SockState::PassiveListening => {
                if let Some(local) = sock.local {
                    self.stack.tcp.unregister_listener(local.port);
                    self.listener_ports.lock().unwrap().remove(&local.port);
                    while let Some(tuple) = self.stack.tcp.accept(local.port) {
                        self.stack.tcp.close(tuple);
                    }
                }
            }
            _ => {}
        }
        if let Some(port) = sock.ephemeral.take() {
            self.ephemeral.lock().unwrap().release(port);
        }
        sock.state = SockState::Closed;
    }

    /// Close every open descriptor. For process shutdown: ordinary
    /// application code closes sockets one at a time via [`Self::close`].
    pub fn close_all(&self) {
        let fds: Vec<i32> = self.sockets.lock().unwrap().keys().copied().collect();
        for fd in fds {
            self.close(fd);
        }
    }

    pub fn set_options(&self, fd: i32, options: SocketOptions) -> NetResult<()> {
        let mut sockets = self.sockets.lock().unwrap();
        let sock = sockets.get_mut(&fd).ok_or(NetError::InvalidArgument)?;
        sock.options = options;
        Ok(())
    }

    /// Last error observed on this socket (`SO_ERROR`), cleared on read.
    /// Checks both errors recorded directly against the socket block and
    /// whatever the underlying TCB most recently observed (e.g. a
    /// retransmission-limit abort the application hasn't noticed yet via
    /// `read`/`write`).
    pub fn take_error(&self, fd: i32) -> Option<NetError> {
        let tuple = {
            let mut sockets = self.sockets.lock().unwrap();
            let sock = sockets.get_mut(&fd)?;
            if let Some(e) = sock.last_error.take() {
                return Some(e);
            }
            sock.tuple
        };
        tuple.and_then(|t| self.stack.tcp.take_pending_error(t))
    }

    /// `getaddrinfo` against this stack's configured static hosts table
    /// (`StackConfig::hosts`), falling back to the dotted-quad parser.
    pub fn resolve(&self, host: &str) -> NetResult<Ipv4Addr> {
        getaddrinfo(host, self.stack.hosts())
    }

    fn active_tuple(&self, fd: i32) -> NetResult<TcpTuple> {
        let sockets = self.sockets.lock().unwrap();
        let sock = sockets.get(&fd).ok_or(NetError::InvalidArgument)?;
        if sock.state != SockState::Active {
            return Err(NetError::NotConnected);
        }
        sock.tuple.ok_or(NetError::NotConnected)
    }

    fn recv_deadline(&self, fd: i32) -> Option<Instant> {
        let sockets = self.sockets.lock().unwrap();
        sockets.get(&fd).and_then(|s| s.options.recv_timeout).map(|d| Instant::now() + d)
    }

    fn send_deadline(&self, fd: i32) -> Option<Instant> {
        let sockets = self.sockets.lock().unwrap();
        sockets.get(&fd).and_then(|s| s.options.send_timeout).map(|d| Instant::now() + d)
    }
}

/// Minimal `getaddrinfo`: a dotted-quad parser with an optional
/// `/etc/hosts`-style static lookup table. No DNS wire protocol — this
/// stack resolves names it has been told about, nothing more.
pub fn getaddrinfo(host: &str, hosts: &HashMap<String, Ipv4Addr>) -> NetResult<Ipv4Addr> {
    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    hosts.get(host).copied().ok_or(NetError::AddressNotAvailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_allocator_round_robins_and_releases() {
        let mut pool = EphemeralPorts::new();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        pool.release(a);
        assert_eq!(pool.allocated, 1);
    }

    #[test]
    fn getaddrinfo_parses_dotted_quad_without_hosts_table() {
        let hosts = HashMap::new();
        let addr = getaddrinfo("10.0.0.5", &hosts).unwrap();
        assert_eq!(addr, Ipv4Addr::from_bytes([10, 0, 0, 5]));
    }

    #[test]
    fn getaddrinfo_falls_back_to_hosts_table() {
        let mut hosts = HashMap::new();
        hosts.insert("b-host".to_string(), Ipv4Addr::from_bytes([10, 0, 0, 2]));
        assert_eq!(getaddrinfo("b-host", &hosts).unwrap(), Ipv4Addr::from_bytes([10, 0, 0, 2]));
        assert!(getaddrinfo("unknown-host", &hosts).is_err());
    }

    #[test]
    fn close_all_removes_every_descriptor() {
        let stack = NetStack::new(ipstack_support::StackConfig::default());
        let layer = SocketLayer::new(stack);
        let a = layer.socket();
        let b = layer.socket();
        layer.close_all();
        assert_eq!(layer.sockets.lock().unwrap().len(), 0);
        let _ = (a, b);
    }

    #[test]
    fn resolve_uses_the_stacks_configured_hosts_table() {
        let mut config = ipstack_support::StackConfig::default();
        config.hosts.insert("echo-server".to_string(), Ipv4Addr::from_bytes([10, 0, 0, 2]));
        let stack = NetStack::new(config);
        let layer = SocketLayer::new(stack);
        assert_eq!(layer.resolve("echo-server").unwrap(), Ipv4Addr::from_bytes([10, 0, 0, 2]));
        assert_eq!(layer.resolve("10.0.0.9").unwrap(), Ipv4Addr::from_bytes([10, 0, 0, 9]));
        assert!(layer.resolve("unknown").is_err());
    }
}
