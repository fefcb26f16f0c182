//! Per-interface IPv4 configuration and the top-level stack that wires
//! together devices, ARP, routing, IP, and TCP.
//!
//! [`NetStack`] owns every background thread this crate spawns: one receive
//! dispatcher per device, one IP egress drain thread, one distance-vector
//! broadcaster. Construct it once per process.

pub mod arp;
pub mod device;
pub mod frame;
pub mod ip;
pub mod route;
pub mod routing_protocol;
pub mod socket;
pub mod tcp;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ipstack_types::{DevIndex, EtherType, Ipv4Addr, MacAddr};
use ipstack_support::StackConfig;

use arp::ArpTable;
use device::DeviceRegistry;
use frame::EthernetHeader;
use ip::{handle_rx, IpLayer, Ipv4Disposition};
use route::RouteTable;
use routing_protocol::{apply_update, decode_update};
use tcp::TcpEngine;

/// Errors raised while bringing up an interface, distinct from
/// [`ipstack_types::NetError`] because they're a configuration mistake
/// caught at startup rather than a runtime network condition.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("address {0} is already assigned to another interface")]
    DuplicateAddress(Ipv4Addr),
}

/// Per-interface IPv4 configuration: address, netmask, and whether the
/// interface is administratively up.
#[derive(Clone, Copy)]
pub struct IfaceConfig {
    pub dev_index: DevIndex,
    pub ipv4_addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub up: bool,
}

impl IfaceConfig {
    #[inline]
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from_u32_be(self.ipv4_addr.to_u32_be() | !self.netmask.to_u32_be())
    }

    #[inline]
    pub fn is_local(&self, ip: Ipv4Addr) -> bool {
        Ipv4Addr::in_subnet(ip, self.ipv4_addr, self.netmask)
    }

    #[inline]
    pub fn prefix_len(&self) -> u8 {
        self.netmask.to_u32_be().leading_ones() as u8
    }
}

impl fmt::Debug for IfaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IfaceConfig {{ dev={}, ip={}/{}, gw={}, up={} }}",
            self.dev_index,
            self.ipv4_addr,
            self.prefix_len(),
            self.gateway,
            self.up
        )
    }
}

struct IfaceTable {
    ifaces: Vec<IfaceConfig>,
}

/// The complete stack: device registry, ARP, routing, IP, TCP, and the
/// per-interface address table that ties a device index to "our IP".
pub struct NetStack {
    pub devices: Arc<DeviceRegistry>,
    pub arp: Arc<ArpTable>,
    pub routes: Arc<RouteTable>,
    pub ip: Arc<IpLayer>,
    pub tcp: Arc<TcpEngine>,
    ifaces: Mutex<IfaceTable>,
    config: StackConfig,
}

impl NetStack {
    pub fn new(config: StackConfig) -> Arc<Self> {
        let devices = Arc::new(DeviceRegistry::new());
        let arp = Arc::new(ArpTable::new(config.arp_timeout));
        let routes = Arc::new(RouteTable::new());
        let ip = Arc::new(IpLayer::new(devices.clone(), arp.clone(), config.ip_send_queue_cap));
        let tcp = TcpEngine::new(ip.clone(), routes.clone(), config.clone());
        Arc::new(Self {
            devices,
            arp,
            routes,
            ip,
            tcp,
            ifaces: Mutex::new(IfaceTable { ifaces: Vec::new() }),
            config,
        })
    }

    /// Register a raw device and assign it an IPv4 address/netmask,
    /// installing the directly-connected static route. Spawns the
    /// per-device receive dispatcher thread.
    ///
    /// Rejects an address already claimed by another registered
    /// interface: `is_our_addr`/`our_ip` assume at most one device
    /// answers for a given IPv4, and a duplicate would make delivery
    /// dispatch ambiguous.
    pub fn add_interface(
        self: &Arc<Self>,
        dev: Arc<dyn device::NetDevice>,
        ipv4_addr: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Ipv4Addr,
    ) -> Result<DevIndex, DeviceError> {
        {
            let ifaces = self.ifaces.lock().unwrap();
            if ifaces.ifaces.iter().any(|c| c.ipv4_addr == ipv4_addr) {
                return Err(DeviceError::DuplicateAddress(ipv4_addr));
            }
        }
        let idx = self.devices.register(dev);
        let prefix_len = netmask.to_u32_be().leading_ones() as u8;
        self.routes.add_static(ipv4_addr, prefix_len, Ipv4Addr::UNSPECIFIED, idx, 0);
        if !gateway.is_unspecified() {
            self.routes.add_static(Ipv4Addr::UNSPECIFIED, 0, gateway, idx, 1);
        }
        self.ifaces.lock().unwrap().ifaces.push(IfaceConfig {
            dev_index: idx,
            ipv4_addr,
            netmask,
            gateway,
            up: true,
        });
        log::info!("netstack: dev{} configured {}/{}", idx, ipv4_addr, prefix_len);
        spawn_receive_dispatcher(self.clone(), idx);
        Ok(idx)
    }

    pub fn our_ip(&self, dev: DevIndex) -> Option<Ipv4Addr> {
        self.ifaces.lock().unwrap().ifaces.iter().find(|c| c.dev_index == dev).map(|c| c.ipv4_addr)
    }

    pub fn is_our_addr(&self, ip: Ipv4Addr) -> bool {
        self.ifaces.lock().unwrap().ifaces.iter().any(|c| c.up && c.ipv4_addr == ip)
    }

    pub fn iface_for_dev(&self, dev: DevIndex) -> Option<IfaceConfig> {
        self.ifaces.lock().unwrap().ifaces.iter().find(|c| c.dev_index == dev).copied()
    }

    /// The static `getaddrinfo` lookup table configured at startup.
    pub fn hosts(&self) -> &std::collections::HashMap<String, Ipv4Addr> {
        &self.config.hosts
    }

    pub fn first_ipv4(&self) -> Option<Ipv4Addr> {
        self.ifaces.lock().unwrap().ifaces.iter().find(|c| c.up).map(|c| c.ipv4_addr)
    }

    /// `true` if `(prefix, prefix_len)` names a subnet we're directly
    /// attached to — used to filter distance-vector entries on ingest so
    /// we never learn a worse, indirect route to a network we already
    /// reach directly.
    pub fn is_locally_attached(&self, prefix: Ipv4Addr, prefix_len: u8) -> bool {
        self.ifaces.lock().unwrap().ifaces.iter().any(|c| {
            c.prefix_len() == prefix_len
                && (prefix.to_u32_be() & c.netmask.to_u32_be()) == (c.ipv4_addr.to_u32_be() & c.netmask.to_u32_be())
        })
    }

    /// Install routes parsed by
    /// [`ipstack_support::host_routes::parse_proc_net_route`] that name an
    /// interface this stack knows about. This crate never learns a
    /// device's OS interface name itself (see the [`device`] module), so
    /// the caller supplies `iface_to_dev`, its own mapping from that name
    /// to the `DevIndex` returned by [`Self::add_interface`]; routes naming
    /// any other interface are skipped. Call after all interfaces are
    /// registered.
    pub fn import_host_routes(
        &self,
        routes: &[ipstack_support::host_routes::LinuxRoute],
        iface_to_dev: &std::collections::HashMap<String, DevIndex>,
    ) {
        for route in routes {
            let Some(&dev) = iface_to_dev.get(&route.iface) else {
                log::debug!("netstack: host route on unknown interface '{}' skipped", route.iface);
                continue;
            };
            let prefix_len = route.mask.to_u32_be().leading_ones() as u8;
            self.routes.add_static(route.destination, prefix_len, route.gateway, dev, route.metric);
            log::info!(
                "netstack: imported host route {}/{} via {} dev{}",
                route.destination,
                prefix_len,
                route.gateway,
                dev
            );
        }
    }

    /// Start the background IP egress drain thread and the distance-vector
    /// broadcaster. Call once, after all interfaces are registered.
    pub fn start_background_tasks(self: &Arc<Self>) {
        spawn_ip_drain(self.clone());
        let stack = self.clone();
        routing_protocol::spawn_broadcaster(
            self.devices.clone(),
            self.routes.clone(),
            move |dev| stack.our_ip(dev),
            Duration::from_secs(1),
        );
    }
}

/// One thread per device: block on `recv`, classify by EtherType, dispatch.
fn spawn_receive_dispatcher(stack: Arc<NetStack>, dev: DevIndex) {
    thread::spawn(move || loop {
        let Some(device) = stack.devices.get(dev) else { return };
        let Some(frame) = device.recv(Duration::from_millis(200)) else {
            continue;
        };
        let Some((eth, off)) = EthernetHeader::parse(&frame) else {
            log::warn!("netstack: dev{} received a malformed frame", dev);
            continue;
        };
        let payload = &frame[off..];
        match eth.ethertype {
            EtherType::Arp => {
                let Some(pkt) = arp::ArpPacket::parse(payload) else {
                    log::warn!("netstack: dev{} malformed ARP packet", dev);
                    continue;
                };
                let Some(our_ip) = stack.our_ip(dev) else { continue };
                stack.arp.handle_rx(&stack.devices, dev, device.mac(), our_ip, &pkt);
            }
            EtherType::Ipv4 => {
                let stack2 = stack.clone();
                let disposition = handle_rx(
                    &stack.ip,
                    &stack.routes,
                    payload,
                    |ip| stack2.is_our_addr(ip),
                    |d| stack2.our_ip(d),
                );
                if let Ipv4Disposition::Deliver { header, payload } = disposition {
                    match header.protocol {
                        ipstack_types::IpProtocol::Tcp => {
                            stack.tcp.handle_segment(header.src, header.dst, &payload);
                        }
                    }
                }
            }
            EtherType::RoutingUpdate => {
                let Some((source_ip, entries)) = decode_update(payload) else {
                    log::warn!("netstack: dev{} malformed routing update", dev);
                    continue;
                };
                apply_update(&stack.routes, dev, source_ip, &entries, |prefix, len| {
                    stack.is_locally_attached(prefix, len)
                });
            }
        }
    });
}

/// Drains the IP layer's egress queue in a loop; each iteration resolves
/// ARP and transmits, or sleeps briefly when the queue is empty.
fn spawn_ip_drain(stack: Arc<NetStack>) {
    thread::spawn(move || loop {
        let stack2 = stack.clone();
        let did_work = stack.ip.drain_one(move |dev| stack2.our_ip(dev));
        if !did_work {
            thread::sleep(Duration::from_millis(5));
        }
    });
}

/// A broadcast MAC target for convenience at call sites outside this module.
pub const BROADCAST_MAC: MacAddr = MacAddr::BROADCAST;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::PairedDevice;
    use ipstack_support::StackConfig;

    #[test]
    fn duplicate_interface_address_is_rejected() {
        let stack = NetStack::new(StackConfig::default());
        let (dev_a, dev_b) = PairedDevice::new_pair(MacAddr([1; 6]), MacAddr([2; 6]));
        let addr = Ipv4Addr::from_bytes([10, 0, 0, 1]);
        let mask = Ipv4Addr::from_bytes([255, 255, 255, 0]);
        stack.add_interface(dev_a, addr, mask, Ipv4Addr::UNSPECIFIED).expect("first interface");
        let result = stack.add_interface(dev_b, addr, mask, Ipv4Addr::UNSPECIFIED);
        assert_eq!(result, Err(DeviceError::DuplicateAddress(addr)));
    }

    #[test]
    fn import_host_routes_installs_known_interfaces_and_skips_unknown() {
        let stack = NetStack::new(StackConfig::default());
        let (dev_a, _dev_b) = PairedDevice::new_pair(MacAddr([1; 6]), MacAddr([2; 6]));
        let idx = stack
            .add_interface(
                dev_a,
                Ipv4Addr::from_bytes([10, 0, 0, 1]),
                Ipv4Addr::from_bytes([255, 255, 255, 0]),
                Ipv4Addr::UNSPECIFIED,
            )
            .expect("interface");

        let (routes, errors) = ipstack_support::host_routes::parse_proc_net_route(
            "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT\n\
             eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0\n\
             wlan0\t0001A8C0\t00000000\t0001\t0\t0\t0\t00FFFFFF\t0\t0\t0\n",
        );
        assert!(errors.is_empty());

        let mut iface_to_dev = std::collections::HashMap::new();
        iface_to_dev.insert("eth0".to_string(), idx);
        stack.import_host_routes(&routes, &iface_to_dev);

        let (dev, next_hop) = stack.routes.lookup(Ipv4Addr::from_bytes([8, 8, 8, 8])).expect("imported default route resolves");
        assert_eq!(dev, idx);
        assert_eq!(next_hop, Ipv4Addr::from_bytes([192, 168, 1, 1]));

        // wlan0's row names an interface with no entry in `iface_to_dev`
        // and must be skipped: a destination inside its /24 still resolves
        // only through the imported default route (next hop is the
        // gateway, not the destination itself as a directly-connected
        // route would give).
        let (_, next_hop) = stack.routes.lookup(Ipv4Addr::from_bytes([192, 168, 1, 5])).expect("falls back to default");
        assert_eq!(next_hop, Ipv4Addr::from_bytes([192, 168, 1, 1]));
    }
}
