//! Transmission Control Block: per-connection state, the 11-state machine,
//! and the tagged send buffer a stop-and-wait sender drains one unit at a
//! time.

use std::collections::VecDeque;
use std::time::Instant;

use ipstack_support::BoundedQueue;
use ipstack_types::{Ipv4Addr, Port};

/// Capacity of a fresh TCB's receive buffer, in bytes. Matches `rcv_wnd`'s
/// default so the window advertised at handshake time equals the room
/// actually available to hold data (see `ringbuffer.h`'s fixed `Capacity`).
pub const DEFAULT_RECV_CAPACITY: usize = 16384;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TcpTuple {
    pub local_ip: Ipv4Addr,
    pub local_port: Port,
    pub remote_ip: Ipv4Addr,
    pub remote_port: Port,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    CloseWait,
    LastAck,
    TimeWait,
}

impl TcpState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECV",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT1",
            Self::FinWait2 => "FIN_WAIT2",
            Self::Closing => "CLOSING",
            Self::CloseWait => "CLOSE_WAIT",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
        }
    }

    pub const fn can_send_data(self) -> bool {
        matches!(self, Self::Established | Self::CloseWait)
    }

    pub const fn can_receive_data(self) -> bool {
        matches!(self, Self::Established | Self::FinWait1 | Self::FinWait2)
    }
}

/// A unit of the stop-and-wait send buffer. The sender has at most one
/// unacked unit outstanding at a time, regardless of kind.
#[derive(Clone, Debug)]
pub enum SendUnit {
    Syn,
    Data(Vec<u8>),
    Fin,
}

impl SendUnit {
    /// Sequence space consumed by this unit (SYN/FIN each count as one
    /// byte of sequence space; data counts its length).
    pub fn seq_len(&self) -> u32 {
        match self {
            Self::Syn | Self::Fin => 1,
            Self::Data(d) => d.len() as u32,
        }
    }
}

/// One TCP connection's complete state.
pub struct Tcb {
    pub tuple: TcpTuple,
    pub state: TcpState,

    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u16,
    pub iss: u32,

    pub rcv_nxt: u32,
    pub rcv_wnd: u16,
    pub irs: u32,

    /// Whether the queued/outstanding SYN unit must carry ACK (passive
    /// open, replying to a peer's SYN) as opposed to a bare SYN (active
    /// open, the first segment of the handshake).
    pub ack_on_syn: bool,

    /// Data/SYN/FIN units not yet fully acknowledged, in send order. The
    /// front unit is the one currently "in flight" (stop-and-wait: never
    /// more than one unacked segment outstanding).
    pub send_buffer: VecDeque<SendUnit>,
    /// Whether the front of `send_buffer` has been transmitted at least
    /// once (distinguishes "queued" from "in flight, awaiting ACK").
    pub in_flight: bool,
    pub last_send_time: Option<Instant>,
    pub retransmits: u32,

    /// Bytes received in order, ready for the application to read. Fixed
    /// capacity: a segment that would overflow it is not accepted, and
    /// `rcv_nxt` does not advance past what actually fit (see
    /// `TcpEngine::dispatch`'s `Established` arm).
    pub recv_buffer: BoundedQueue<u8>,
    /// Out-of-order segments are dropped per the in-order-only receive
    /// model; `rcv_nxt` only advances on exactly the next expected byte.

    /// Set once a FIN has been accepted from the peer — the application
    /// sees end-of-stream once `recv_buffer` drains past this point.
    pub peer_fin_received: bool,

    /// When the connection entered TIME_WAIT (for 2xMSL expiry) or became
    /// orphaned (closed locally, with no socket referencing it — reaped
    /// after staying orphaned past the TCB's own teardown timers).
    pub time_wait_start: Option<Instant>,

    /// Last error observed on this connection (for `SO_ERROR`).
    pub pending_error: Option<ipstack_types::NetError>,
}

impl Tcb {
    pub fn new(tuple: TcpTuple) -> Self {
        Self {
            tuple,
            state: TcpState::Closed,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            iss: 0,
            rcv_nxt: 0,
            rcv_wnd: 16384,
            irs: 0,
            ack_on_syn: false,
            send_buffer: VecDeque::new(),
            in_flight: false,
            last_send_time: None,
            retransmits: 0,
            recv_buffer: BoundedQueue::new(DEFAULT_RECV_CAPACITY),
            peer_fin_received: false,
            time_wait_start: None,
            pending_error: None,
        }
    }
}

/// Generate an initial sequence number. A real RFC 793 ISN would be
/// clock-driven to avoid wrapped-connection ambiguity; this stack only
/// needs distinct per-connection numbers for its own bookkeeping; it draws
/// from a process-wide monotonic counter seeded from a coarse time value.
pub fn generate_isn() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let base = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u32)
        .unwrap_or(0);
    base.wrapping_add(COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_mul(65537))
}
