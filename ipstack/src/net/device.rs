//! Network device abstraction: the boundary between raw packet capture
//! (owned by an external collaborator — promiscuous-mode socket, tap
//! device, or a test double) and the protocol stack above it.
//!
//! Only whole Ethernet frames cross this boundary.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitflags::bitflags;
use ipstack_types::{DevIndex, MacAddr, NetError, NetResult};

/// Implemented by whatever owns raw frame I/O for one interface: a
/// promiscuous-mode capture socket, a tap device, or (in tests) an
/// in-memory pair wired to another `NetDevice`.
pub trait NetDevice: Send + Sync {
    /// Transmit one complete Ethernet frame.
    fn tx(&self, frame: &[u8]) -> NetResult<()>;

    /// Block for up to `timeout` waiting for one received frame. Returns
    /// `None` on timeout with nothing received.
    fn recv(&self, timeout: Duration) -> Option<Vec<u8>>;

    fn mac(&self) -> MacAddr;

    fn mtu(&self) -> u16 {
        1500
    }

    fn stats(&self) -> NetDeviceStatsSnapshot;

    fn features(&self) -> NetDeviceFeatures {
        NetDeviceFeatures::empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetDeviceStatsSnapshot {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

/// Atomic counters a [`NetDevice`] impl can share across its tx/recv paths
/// without its own locking.
#[derive(Default)]
pub struct NetDeviceStats {
    rx_packets: AtomicU64,
    tx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    rx_dropped: AtomicU64,
    tx_dropped: AtomicU64,
}

impl NetDeviceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_rx_dropped(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tx_dropped(&self) {
        self.tx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NetDeviceStatsSnapshot {
        NetDeviceStatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NetDeviceFeatures: u32 {
        const PROMISCUOUS = 1 << 0;
    }
}

/// Control-plane storage for registered devices. Devices are never removed
/// individually by index in this stack (a run owns a fixed set of
/// interfaces for its lifetime); `register` hands back a stable
/// [`DevIndex`] used everywhere else.
pub struct DeviceRegistry {
    devices: Mutex<Vec<Arc<dyn NetDevice>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, dev: Arc<dyn NetDevice>) -> DevIndex {
        let mut devices = self.devices.lock().unwrap();
        let idx = DevIndex(devices.len());
        log::info!("device: registered dev{} mac={}", idx, dev.mac());
        devices.push(dev);
        idx
    }

    pub fn get(&self, index: DevIndex) -> Option<Arc<dyn NetDevice>> {
        self.devices.lock().unwrap().get(index.0).cloned()
    }

    pub fn enumerate(&self) -> Vec<(DevIndex, MacAddr)> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .map(|(i, d)| (DevIndex(i), d.mac()))
            .collect()
    }

    pub fn tx(&self, index: DevIndex, frame: &[u8]) -> NetResult<()> {
        self.get(index).ok_or(NetError::NoRoute)?.tx(frame)
    }

    pub fn count(&self) -> usize {
        self.devices.lock().unwrap().len()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceRegistry({} devices)", self.count())
    }
}

/// In-memory loopback pair used by integration tests: frames sent on one
/// side become receivable on the other, modeling two real hosts linked by
/// raw packet capture without needing an actual interface.
pub struct PairedDevice {
    mac: MacAddr,
    inbox: Mutex<std::collections::VecDeque<Vec<u8>>>,
    peer: Mutex<Option<Arc<PairedDevice>>>,
    stats: NetDeviceStats,
}

impl PairedDevice {
    pub fn new_pair(mac_a: MacAddr, mac_b: MacAddr) -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self {
            mac: mac_a,
            inbox: Mutex::new(std::collections::VecDeque::new()),
            peer: Mutex::new(None),
            stats: NetDeviceStats::new(),
        });
        let b = Arc::new(Self {
            mac: mac_b,
            inbox: Mutex::new(std::collections::VecDeque::new()),
            peer: Mutex::new(None),
            stats: NetDeviceStats::new(),
        });
        *a.peer.lock().unwrap() = Some(b.clone());
        *b.peer.lock().unwrap() = Some(a.clone());
        (a, b)
    }
}

impl NetDevice for PairedDevice {
    fn tx(&self, frame: &[u8]) -> NetResult<()> {
        self.stats.record_tx(frame.len());
        if let Some(peer) = self.peer.lock().unwrap().as_ref() {
            peer.inbox.lock().unwrap().push_back(frame.to_vec());
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = self.inbox.lock().unwrap().pop_front() {
                self.stats.record_rx(frame.len());
                return Some(frame);
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn stats(&self) -> NetDeviceStatsSnapshot {
        self.stats.snapshot()
    }
}
