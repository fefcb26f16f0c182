//! The TCP core: TCB table, 11-state machine, retransmission timer, and
//! orphan reaper, all serialized behind one mutex.
//!
//! A single global lock over every TCB is a deliberate simplification — it
//! trades throughput for a state machine that is trivially linearizable.
//! Every public entry point, the per-connection retransmit tick, and the
//! reaper sweep all take the same lock.

pub mod segment;
pub mod tcb;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ipstack_types::{IpProtocol, Ipv4Addr, NetError, NetResult, Port, SockAddr};
use ipstack_support::StackConfig;

use crate::net::ip::IpLayer;
use crate::net::route::RouteTable;

pub use segment::{
    build_segment, checksum, parse_header, seq_gt, seq_le, seq_lt, verify_checksum, TcpHeader,
    TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_RST, TCP_FLAG_SYN,
};
pub use tcb::{generate_isn, SendUnit, Tcb, TcpState, TcpTuple};

struct Listener {
    backlog_cap: usize,
    pending: VecDeque<TcpTuple>,
}

struct TcpTables {
    active: HashMap<TcpTuple, Tcb>,
    orphaned: HashMap<TcpTuple, Tcb>,
    listeners: HashMap<Port, Listener>,
}

pub struct TcpEngine {
    tables: Mutex<TcpTables>,
    ip: Arc<IpLayer>,
    routes: Arc<RouteTable>,
    config: StackConfig,
}

impl TcpEngine {
    pub fn new(ip: Arc<IpLayer>, routes: Arc<RouteTable>, config: StackConfig) -> Arc<Self> {
        let engine = Arc::new(Self {
            tables: Mutex::new(TcpTables {
                active: HashMap::new(),
                orphaned: HashMap::new(),
                listeners: HashMap::new(),
            }),
            ip,
            routes,
            config,
        });
        spawn_reaper(&engine);
        engine
    }

    pub fn register_listener(&self, port: Port, backlog_cap: usize) -> NetResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables.listeners.contains_key(&port) {
            return Err(NetError::PortInUse);
        }
        log::info!("tcp: listening on port {}", port);
        tables.listeners.insert(
            port,
            Listener {
                backlog_cap,
                pending: VecDeque::new(),
            },
        );
        Ok(())
    }

    pub fn unregister_listener(&self, port: Port) {
        self.tables.lock().unwrap().listeners.remove(&port);
    }

    /// Pop one fully-established child connection off a listener's backlog.
    pub fn accept(&self, port: Port) -> Option<TcpTuple> {
        self.tables
            .lock()
            .unwrap()
            .listeners
            .get_mut(&port)?
            .pending
            .pop_front()
    }

    /// Active open: CLOSED -> SYN_SENT, SYN emitted immediately.
    pub fn open_active(self: &Arc<Self>, local: SockAddr, remote: SockAddr) -> NetResult<TcpTuple> {
        let tuple = TcpTuple {
            local_ip: local.ip,
            local_port: local.port,
            remote_ip: remote.ip,
            remote_port: remote.port,
        };
        let mut tables = self.tables.lock().unwrap();
        if tables.active.contains_key(&tuple) || tables.orphaned.contains_key(&tuple) {
            return Err(NetError::AlreadyConnected);
        }
        let mut tcb = Tcb::new(tuple);
        tcb.iss = generate_isn();
        tcb.snd_una = tcb.iss;
        tcb.snd_nxt = tcb.iss;
        tcb.state = TcpState::SynSent;
        tcb.send_buffer.push_back(SendUnit::Syn);
        send_unit(&self.ip, &self.routes, &mut tcb);
        log::info!("tcp: {:?} CLOSED -> SYN_SENT", tuple);
        tables.active.insert(tuple, tcb);
        drop(tables);
        spawn_retransmit_timer(self, tuple);
        Ok(tuple)
    }

    /// Non-blocking: enqueue up to `data.len()` bytes as tagged send units,
    /// kicking off transmission if nothing is currently in flight.
    pub fn send(&self, tuple: TcpTuple, data: &[u8]) -> NetResult<usize> {
        let mut tables = self.tables.lock().unwrap();
        let tcb = tables.active.get_mut(&tuple).ok_or(NetError::NotConnected)?;
        if !tcb.state.can_send_data() {
            return Err(NetError::WrongState);
        }
        let mss = self.config.tcp_mss.max(1);
        let mut written = 0;
        while written < data.len() {
            let end = (written + mss).min(data.len());
            tcb.send_buffer.push_back(SendUnit::Data(data[written..end].to_vec()));
            written = end;
        }
        if !tcb.in_flight {
            send_unit(&self.ip, &self.routes, tcb);
        }
        Ok(written)
    }

    /// Non-blocking: drain up to `max` bytes from the in-order receive
    /// buffer, regardless of connection state.
    pub fn receive(&self, tuple: TcpTuple, max: usize) -> Vec<u8> {
        let mut tables = self.tables.lock().unwrap();
        let tcb = match tables.active.get_mut(&tuple).or_else(|| tables.orphaned.get_mut(&tuple)) {
            Some(t) => t,
            None => return Vec::new(),
        };
        tcb.recv_buffer.pop_many(max)
    }

    /// `true` once no more data will ever arrive (peer's FIN has been seen
    /// and the receive buffer has been fully drained).
    pub fn peer_closed_and_drained(&self, tuple: TcpTuple) -> bool {
        let tables = self.tables.lock().unwrap();
        match tables.active.get(&tuple).or_else(|| tables.orphaned.get(&tuple)) {
            Some(tcb) => tcb.peer_fin_received && tcb.recv_buffer.is_empty(),
            None => true,
        }
    }

    /// Take (and clear) whatever network-level error this connection last
    /// observed, for `SO_ERROR`.
    pub fn take_pending_error(&self, tuple: TcpTuple) -> Option<NetError> {
        let mut tables = self.tables.lock().unwrap();
        tables
            .active
            .get_mut(&tuple)
            .or_else(|| tables.orphaned.get_mut(&tuple))
            .and_then(|tcb| tcb.pending_error.take())
    }

    pub fn state_of(&self, tuple: TcpTuple) -> Option<TcpState> {
        let tables = self.tables.lock().unwrap();
        tables
            .active
            .get(&tuple)
            .or_else(|| tables.orphaned.get(&tuple))
            .map(|t| t.state)
    }

    /// Move the TCB from active to orphaned and begin the state-appropriate
    /// shutdown. Idempotent: closing an already-orphaned or unknown tuple is
    /// a no-op.
    pub fn close(&self, tuple: TcpTuple) {
        let mut tables = self.tables.lock().unwrap();
        let Some(mut tcb) = tables.active.remove(&tuple) else {
            return;
        };
        match tcb.state {
            TcpState::Established | TcpState::SynReceived => {
                tcb.send_buffer.push_back(SendUnit::Fin);
                tcb.state = TcpState::FinWait1;
                if !tcb.in_flight {
                    send_unit(&self.ip, &self.routes, &mut tcb);
                }
            }
            TcpState::CloseWait => {
                tcb.send_buffer.push_back(SendUnit::Fin);
                tcb.state = TcpState::LastAck;
                if !tcb.in_flight {
                    send_unit(&self.ip, &self.routes, &mut tcb);
                }
            }
            TcpState::SynSent | TcpState::Listen => {
                tcb.state = TcpState::Closed;
            }
            _ => {}
        }
        log::info!("tcp: {:?} closed locally, now {}", tuple, tcb.state.name());
        tables.orphaned.insert(tuple, tcb);
    }

    /// Forcibly close every tracked connection (active or still-orphaned)
    /// without a graceful FIN exchange, then block until the reaper has
    /// swept the result. For process shutdown, not ordinary
    /// application-driven close.
    pub fn shutdown(&self) {
        {
            let mut tables = self.tables.lock().unwrap();
            let tuples: Vec<TcpTuple> = tables.active.keys().copied().collect();
            for tuple in tuples {
                if let Some(mut tcb) = tables.active.remove(&tuple) {
                    log::info!("tcp: {:?} force-closed at shutdown, was {}", tuple, tcb.state.name());
                    tcb.state = TcpState::Closed;
                    tables.orphaned.insert(tuple, tcb);
                }
            }
            tables.listeners.clear();
        }
        let deadline = Instant::now() + Duration::from_millis(500);
        loop {
            if self.tables.lock().unwrap().orphaned.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                log::warn!("tcp: shutdown timed out waiting for the reaper to drain");
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Entry point for every inbound TCP segment delivered by the IP layer.
    pub fn handle_segment(self: &Arc<Self>, src_ip: Ipv4Addr, dst_ip: Ipv4Addr, data: &[u8]) {
        if data.len() < segment::TCP_HEADER_LEN {
            log::warn!("tcp: segment from {} too short", src_ip);
            return;
        }
        if !verify_checksum(src_ip, dst_ip, data) {
            log::warn!("tcp: checksum mismatch from {}", src_ip);
            return;
        }
        let Some((hdr, header_len)) = parse_header(data) else {
            log::warn!("tcp: malformed header from {}", src_ip);
            return;
        };
        let payload = &data[header_len..];
        let tuple = TcpTuple {
            local_ip: dst_ip,
            local_port: Port::new(hdr.dst_port),
            remote_ip: src_ip,
            remote_port: Port::new(hdr.src_port),
        };

        if hdr.is_syn() && !hdr.is_ack() {
            self.accept_new_connection(tuple, &hdr);
            return;
        }

        let mut tables_guard = self.tables.lock().unwrap();
        let TcpTables { active, orphaned, listeners } = &mut *tables_guard;
        let tcb = match active.get_mut(&tuple).or_else(|| orphaned.get_mut(&tuple)) {
            Some(t) => t,
            None => {
                log::warn!("tcp: segment for unknown connection {:?}", tuple);
                return;
            }
        };

        if tcb.state != TcpState::SynSent && hdr.seq_num != tcb.rcv_nxt {
            log::debug!("tcp: {:?} out-of-order seq, re-acking", tuple);
            send_pure_ack(&self.ip, &self.routes, tcb);
            return;
        }

        self.dispatch(tcb, &hdr, payload, listeners);
    }

    fn accept_new_connection(self: &Arc<Self>, tuple: TcpTuple, hdr: &TcpHeader) {
        let mut tables = self.tables.lock().unwrap();
        let Some(listener) = tables.listeners.get_mut(&tuple.local_port) else {
            log::warn!("tcp: SYN to unlistened port {}", tuple.local_port);
            return;
        };
        if listener.pending.len() >= listener.backlog_cap {
            log::warn!("tcp: backlog full for port {}", tuple.local_port);
            return;
        }
        if tables.active.contains_key(&tuple) {
            return; // retransmitted SYN for a connection already being set up
        }

        let mut tcb = Tcb::new(tuple);
        tcb.irs = hdr.seq_num;
        tcb.rcv_nxt = hdr.seq_num.wrapping_add(1);
        tcb.iss = generate_isn();
        tcb.snd_una = tcb.iss;
        tcb.snd_nxt = tcb.iss;
        tcb.ack_on_syn = true;
        tcb.state = TcpState::SynReceived;
        tcb.send_buffer.push_back(SendUnit::Syn);
        send_unit(&self.ip, &self.routes, &mut tcb);
        log::info!("tcp: {:?} LISTEN -> SYN_RECV", tuple);
        tables.active.insert(tuple, tcb);
        drop(tables);
        spawn_retransmit_timer(self, tuple);
    }

    /// Per-state segment handler, following the transition table: pure ACK,
    /// data, FIN and timer events each drive a specific next state. Anything
    /// not explicitly handled for the current state is a silent drop (a
    /// warning is logged, state is left untouched).
    fn dispatch(
        &self,
        tcb: &mut Tcb,
        hdr: &TcpHeader,
        payload: &[u8],
        listeners: &mut HashMap<Port, Listener>,
    ) {
        let acks_front = |tcb: &Tcb| tcb.in_flight && hdr.ack_num == tcb.snd_nxt;

        // A segment carrying new data is only possible once seq==rcv_nxt has
        // already been confirmed by the caller.
        let advances_send = |tcb: &mut Tcb| {
            if acks_front(tcb) {
                tcb.snd_una = tcb.snd_nxt;
                tcb.in_flight = false;
                tcb.retransmits = 0;
                tcb.send_buffer.pop_front();
                if !tcb.send_buffer.is_empty() {
                    send_unit(&self.ip, &self.routes, tcb);
                }
                true
            } else {
                false
            }
        };

        match tcb.state {
            TcpState::SynSent => {
                if hdr.is_syn() && hdr.is_ack() && hdr.ack_num == tcb.snd_nxt {
                    tcb.irs = hdr.seq_num;
                    tcb.rcv_nxt = hdr.seq_num.wrapping_add(1);
                    tcb.snd_una = hdr.ack_num;
                    tcb.in_flight = false;
                    tcb.retransmits = 0;
                    tcb.send_buffer.pop_front();
                    tcb.state = TcpState::Established;
                    log::info!("tcp: {:?} SYN_SENT -> ESTABLISHED", tcb.tuple);
                    send_pure_ack(&self.ip, &self.routes, tcb);
                } else {
                    log::warn!("tcp: {:?} unexpected segment in SYN_SENT", tcb.tuple);
                }
            }

            TcpState::SynReceived => {
                if hdr.is_ack() && !hdr.is_syn() && !hdr.is_fin() && payload.is_empty() && advances_send(tcb) {
                    tcb.state = TcpState::Established;
                    log::info!("tcp: {:?} SYN_RECV -> ESTABLISHED", tcb.tuple);
                    if let Some(listener) = listeners.get_mut(&tcb.tuple.local_port) {
                        listener.pending.push_back(tcb.tuple);
                    }
                } else {
                    log::warn!("tcp: {:?} unexpected segment in SYN_RECV", tcb.tuple);
                }
            }

            TcpState::Established => {
                let data_acked = advances_send(tcb);
                if !payload.is_empty() {
                    if payload.len() <= tcb.recv_buffer.rest_capacity() {
                        let accepted = tcb.recv_buffer.push_many(payload);
                        debug_assert_eq!(accepted, payload.len());
                        tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(payload.len() as u32);
                    } else {
                        log::warn!(
                            "tcp: {:?} receive buffer full ({}/{} bytes free), dropping segment for backpressure",
                            tcb.tuple,
                            tcb.recv_buffer.rest_capacity(),
                            payload.len()
                        );
                    }
                    send_pure_ack(&self.ip, &self.routes, tcb);
                } else if hdr.is_fin() {
                    tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(1);
                    tcb.peer_fin_received = true;
                    tcb.state = TcpState::CloseWait;
                    log::info!("tcp: {:?} ESTABLISHED -> CLOSE_WAIT", tcb.tuple);
                    send_pure_ack(&self.ip, &self.routes, tcb);
                } else if !data_acked {
                    // pure ACK that didn't advance anything outstanding: ignore
                }
            }

            TcpState::FinWait1 => {
                let fin_acked = advances_send(tcb);
                if hdr.is_fin() {
                    tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(1);
                    tcb.peer_fin_received = true;
                    if fin_acked {
                        tcb.state = TcpState::TimeWait;
                        tcb.time_wait_start = Some(Instant::now());
                        log::info!("tcp: {:?} FIN_WAIT1 -> TIME_WAIT", tcb.tuple);
                    } else {
                        tcb.state = TcpState::Closing;
                        log::info!("tcp: {:?} FIN_WAIT1 -> CLOSING", tcb.tuple);
                    }
                    send_pure_ack(&self.ip, &self.routes, tcb);
                } else if fin_acked {
                    tcb.state = TcpState::FinWait2;
                    log::info!("tcp: {:?} FIN_WAIT1 -> FIN_WAIT2", tcb.tuple);
                }
            }

            TcpState::FinWait2 => {
                if hdr.is_fin() {
                    tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(1);
                    tcb.peer_fin_received = true;
                    tcb.state = TcpState::TimeWait;
                    tcb.time_wait_start = Some(Instant::now());
                    log::info!("tcp: {:?} FIN_WAIT2 -> TIME_WAIT", tcb.tuple);
                    send_pure_ack(&self.ip, &self.routes, tcb);
                } else {
                    log::warn!("tcp: {:?} unexpected segment in FIN_WAIT2", tcb.tuple);
                }
            }

            TcpState::CloseWait => {
                if payload.is_empty() && !hdr.is_fin() {
                    // stay; nothing to do for a bare ACK
                } else if hdr.is_fin() {
                    // peer already closed; re-ack, stay
                    send_pure_ack(&self.ip, &self.routes, tcb);
                } else {
                    log::warn!("tcp: {:?} unexpected data in CLOSE_WAIT", tcb.tuple);
                }
            }

            TcpState::Closing => {
                if advances_send(tcb) {
                    tcb.state = TcpState::TimeWait;
                    tcb.time_wait_start = Some(Instant::now());
                    log::info!("tcp: {:?} CLOSING -> TIME_WAIT", tcb.tuple);
                } else if !hdr.is_fin() {
                    log::warn!("tcp: {:?} unexpected segment in CLOSING", tcb.tuple);
                }
            }

            TcpState::LastAck => {
                if advances_send(tcb) {
                    tcb.state = TcpState::Closed;
                    log::info!("tcp: {:?} LAST_ACK -> CLOSED", tcb.tuple);
                } else {
                    log::warn!("tcp: {:?} unexpected segment in LAST_ACK", tcb.tuple);
                }
            }

            TcpState::TimeWait => {
                send_pure_ack(&self.ip, &self.routes, tcb);
            }

            TcpState::Closed | TcpState::Listen => {
                log::warn!("tcp: {:?} segment in terminal/unbound state", tcb.tuple);
            }
        }
    }
}

/// Transmit the front of the send buffer (or resend it, unchanged, on a
/// retransmission tick). Stop-and-wait: `snd_nxt` only advances the first
/// time a unit is sent, never on retransmit.
fn send_unit(ip: &IpLayer, routes: &RouteTable, tcb: &mut Tcb) {
    let Some(unit) = tcb.send_buffer.front().cloned() else {
        return;
    };
    let (flags, payload): (u8, &[u8]) = match &unit {
        SendUnit::Syn => {
            let flags = TCP_FLAG_SYN | if tcb.ack_on_syn { TCP_FLAG_ACK } else { 0 };
            (flags, &[])
        }
        SendUnit::Fin => (TCP_FLAG_FIN | TCP_FLAG_ACK, &[]),
        SendUnit::Data(d) => (TCP_FLAG_ACK, d.as_slice()),
    };
    let hdr = TcpHeader {
        src_port: tcb.tuple.local_port.as_u16(),
        dst_port: tcb.tuple.remote_port.as_u16(),
        seq_num: tcb.snd_una,
        ack_num: tcb.rcv_nxt,
        flags,
        window_size: tcb.rcv_wnd,
    };
    let seg = build_segment(&hdr, tcb.tuple.local_ip, tcb.tuple.remote_ip, payload);
    if let Err(e) = ip.send(routes, tcb.tuple.local_ip, tcb.tuple.remote_ip, IpProtocol::Tcp, &seg) {
        log::warn!("tcp: send on {:?} failed: {}", tcb.tuple, e);
    }
    if !tcb.in_flight {
        tcb.snd_nxt = tcb.snd_una.wrapping_add(unit.seq_len());
        tcb.in_flight = true;
    }
    tcb.last_send_time = Some(Instant::now());
}

/// A content-free ACK, acknowledging `rcv_nxt`. Never retransmitted, never
/// tracked against the outstanding-segment state.
fn send_pure_ack(ip: &IpLayer, routes: &RouteTable, tcb: &Tcb) {
    let hdr = TcpHeader {
        src_port: tcb.tuple.local_port.as_u16(),
        dst_port: tcb.tuple.remote_port.as_u16(),
        seq_num: tcb.snd_nxt,
        ack_num: tcb.rcv_nxt,
        flags: TCP_FLAG_ACK,
        window_size: tcb.rcv_wnd,
    };
    let seg = build_segment(&hdr, tcb.tuple.local_ip, tcb.tuple.remote_ip, &[]);
    if let Err(e) = ip.send(routes, tcb.tuple.local_ip, tcb.tuple.remote_ip, IpProtocol::Tcp, &seg) {
        log::warn!("tcp: ack on {:?} failed: {}", tcb.tuple, e);
    }
}

/// One retransmission timer thread per TCB, ticking every 10ms. Stops once
/// the TCB is no longer present in either map (reaped).
fn spawn_retransmit_timer(engine: &Arc<TcpEngine>, tuple: TcpTuple) {
    let engine = engine.clone();
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_millis(10));
        let mut tables = engine.tables.lock().unwrap();
        let tcb = match tables.active.get_mut(&tuple).or_else(|| tables.orphaned.get_mut(&tuple)) {
            Some(t) => t,
            None => return,
        };
        match tcb.state {
            TcpState::Closed => return,
            TcpState::TimeWait => {
                if let Some(start) = tcb.time_wait_start {
                    if start.elapsed() >= engine.config.tcp_msl * 2 {
                        tcb.state = TcpState::Closed;
                        log::info!("tcp: {:?} TIME_WAIT -> CLOSED", tuple);
                    }
                }
            }
            _ => {
                if tcb.in_flight {
                    let elapsed = tcb.last_send_time.map(|t| t.elapsed()).unwrap_or_default();
                    if elapsed >= engine.config.tcp_rto {
                        if tcb.retransmits >= engine.config.tcp_max_retransmits {
                            log::error!("fatal: tcp {:?} exceeded retransmission limit", tuple);
                            tcb.pending_error = Some(NetError::RetransmitLimitExceeded);
                            tcb.state = TcpState::Closed;
                        } else {
                            tcb.retransmits += 1;
                            log::debug!("tcp: {:?} retransmit #{}", tuple, tcb.retransmits);
                            send_unit(&engine.ip, &engine.routes, tcb);
                        }
                    }
                }
            }
        }
    });
}

/// Sweeps the orphan map for fully CLOSED TCBs and drops them. Grounded in
/// the same "reap once terminal" lifecycle as the teacher's connection
/// table, collapsed from a requeue-loop into a periodic sweep since both
/// converge on the timer serializing every tick through the same lock.
fn spawn_reaper(engine: &Arc<TcpEngine>) {
    let engine = engine.clone();
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_millis(50));
        let mut tables = engine.tables.lock().unwrap();
        let before = tables.orphaned.len();
        tables.orphaned.retain(|_, tcb| tcb.state != TcpState::Closed);
        let reaped = before - tables.orphaned.len();
        if reaped > 0 {
            log::debug!("tcp: reaper collected {} connection(s)", reaped);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::arp::ArpTable;
    use crate::net::device::{DeviceRegistry, PairedDevice};
    use ipstack_types::{MacAddr, Port};

    fn engines() -> (Arc<TcpEngine>, Arc<TcpEngine>, Arc<DeviceRegistry>, Arc<DeviceRegistry>) {
        let (dev_a, dev_b) = PairedDevice::new_pair(MacAddr([1; 6]), MacAddr([2; 6]));
        let regs_a = Arc::new(DeviceRegistry::new());
        let regs_b = Arc::new(DeviceRegistry::new());
        regs_a.register(dev_a);
        regs_b.register(dev_b);
        let arp_a = Arc::new(ArpTable::new(Duration::from_millis(200)));
        let arp_b = Arc::new(ArpTable::new(Duration::from_millis(200)));
        let routes_a = Arc::new(RouteTable::new());
        let routes_b = Arc::new(RouteTable::new());
        routes_a.add_static(Ipv4Addr::from_bytes([10, 0, 0, 2]), 32, Ipv4Addr::UNSPECIFIED, ipstack_types::DevIndex(0), 1);
        routes_b.add_static(Ipv4Addr::from_bytes([10, 0, 0, 1]), 32, Ipv4Addr::UNSPECIFIED, ipstack_types::DevIndex(0), 1);
        let ip_a = Arc::new(IpLayer::new(regs_a.clone(), arp_a, 100));
        let ip_b = Arc::new(IpLayer::new(regs_b.clone(), arp_b, 100));
        let config = StackConfig::default();
        (
            TcpEngine::new(ip_a, routes_a, config.clone()),
            TcpEngine::new(ip_b, routes_b, config),
            regs_a,
            regs_b,
        )
    }

    #[test]
    fn active_open_enters_syn_sent_and_emits_syn() {
        let (engine_a, _engine_b, _regs_a, _regs_b) = engines();
        let local = SockAddr::new(Ipv4Addr::from_bytes([10, 0, 0, 1]), Port::new(33000));
        let remote = SockAddr::new(Ipv4Addr::from_bytes([10, 0, 0, 2]), Port::new(12345));
        let tuple = engine_a.open_active(local, remote).unwrap();
        assert_eq!(engine_a.state_of(tuple), Some(TcpState::SynSent));
    }

    #[test]
    fn listener_rejects_duplicate_registration() {
        let (engine_a, _engine_b, _regs_a, _regs_b) = engines();
        let port = Port::new(12345);
        assert!(engine_a.register_listener(port, 4).is_ok());
        assert_eq!(engine_a.register_listener(port, 4), Err(NetError::PortInUse));
    }

    #[test]
    fn close_before_established_goes_straight_to_closed() {
        let (engine_a, _engine_b, _regs_a, _regs_b) = engines();
        let local = SockAddr::new(Ipv4Addr::from_bytes([10, 0, 0, 1]), Port::new(33000));
        let remote = SockAddr::new(Ipv4Addr::from_bytes([10, 0, 0, 2]), Port::new(12345));
        let tuple = engine_a.open_active(local, remote).unwrap();
        engine_a.close(tuple);
        assert_eq!(engine_a.state_of(tuple), Some(TcpState::Closed));
    }

    #[test]
    fn established_receive_rejects_a_segment_that_would_overflow_the_buffer() {
        let (engine_a, _engine_b, _regs_a, _regs_b) = engines();
        let tuple = TcpTuple {
            local_ip: Ipv4Addr::from_bytes([10, 0, 0, 1]),
            local_port: Port::new(33000),
            remote_ip: Ipv4Addr::from_bytes([10, 0, 0, 2]),
            remote_port: Port::new(12345),
        };
        {
            let mut tables = engine_a.tables.lock().unwrap();
            let mut tcb = Tcb::new(tuple);
            tcb.state = TcpState::Established;
            tcb.rcv_nxt = 1000;
            // Leave only 10 bytes of room in the receive buffer.
            let filler = vec![0u8; tcb.recv_buffer.capacity() - 10];
            tcb.recv_buffer.push_many(&filler);
            tables.active.insert(tuple, tcb);
        }

        let hdr = TcpHeader {
            src_port: tuple.remote_port.as_u16(),
            dst_port: tuple.local_port.as_u16(),
            seq_num: 1000,
            ack_num: 0,
            flags: TCP_FLAG_ACK,
            window_size: 0,
        };
        let payload = vec![7u8; 20]; // more than the 10 bytes of room left
        {
            let mut tables = engine_a.tables.lock().unwrap();
            let mut listeners = std::mem::take(&mut tables.listeners);
            let tcb = tables.active.get_mut(&tuple).unwrap();
            engine_a.dispatch(tcb, &hdr, &payload, &mut listeners);
            tables.listeners = listeners;
        }

        let tables = engine_a.tables.lock().unwrap();
        let tcb = &tables.active[&tuple];
        assert_eq!(tcb.rcv_nxt, 1000, "rcv_nxt must not advance past what the buffer actually held");
        assert!(tcb.recv_buffer.rest_capacity() < 20, "the oversized segment must not have been buffered");
    }

    #[test]
    fn shutdown_force_closes_every_active_connection() {
        let (engine_a, _engine_b, _regs_a, _regs_b) = engines();
        let local = SockAddr::new(Ipv4Addr::from_bytes([10, 0, 0, 1]), Port::new(33000));
        let remote = SockAddr::new(Ipv4Addr::from_bytes([10, 0, 0, 2]), Port::new(12345));
        let tuple = engine_a.open_active(local, remote).unwrap();
        assert!(engine_a.register_listener(Port::new(9999), 4).is_ok());
        engine_a.shutdown();
        assert_eq!(engine_a.state_of(tuple), None, "reaper must have drained the forced close");
        assert!(engine_a.accept(Port::new(9999)).is_none());
    }
}
