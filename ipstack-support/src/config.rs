//! Startup configuration, read once from the environment.
//!
//! Every tunable has a default matching the behavior described for the
//! un-configured stack; set the corresponding environment variable to
//! override it before constructing the stack.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use ipstack_types::Ipv4Addr;

#[derive(Clone, Debug)]
pub struct StackConfig {
    /// Bound on a single ARP query (request -> reply or give up).
    pub arp_timeout: Duration,
    /// Base retransmission timeout for an unacked TCP segment.
    pub tcp_rto: Duration,
    /// Retransmissions attempted before a connection is aborted.
    pub tcp_max_retransmits: u32,
    /// Maximum Segment Lifetime; TIME_WAIT lasts 2x this.
    pub tcp_msl: Duration,
    /// Maximum TCP payload bytes per segment.
    pub tcp_mss: usize,
    /// Capacity of the per-device IP egress queue.
    pub ip_send_queue_cap: usize,
    /// Static `getaddrinfo` lookup table, `/etc/hosts`-style.
    pub hosts: HashMap<String, Ipv4Addr>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            arp_timeout: Duration::from_millis(500),
            tcp_rto: Duration::from_millis(1000),
            tcp_max_retransmits: 100,
            tcp_msl: Duration::from_millis(1000),
            tcp_mss: 1024,
            ip_send_queue_cap: 100,
            hosts: HashMap::new(),
        }
    }
}

impl StackConfig {
    /// Build a config from defaults overridden by environment variables.
    /// Malformed values are logged and the default is kept rather than
    /// failing startup.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.arp_timeout = env_millis("IPSTACK_ARP_TIMEOUT_MS", cfg.arp_timeout);
        cfg.tcp_rto = env_millis("IPSTACK_TCP_RTO_MS", cfg.tcp_rto);
        cfg.tcp_msl = env_millis("IPSTACK_TCP_MSL_MS", cfg.tcp_msl);
        cfg.tcp_max_retransmits = env_u32("IPSTACK_TCP_MAX_RETRANSMITS", cfg.tcp_max_retransmits);
        cfg.tcp_mss = env_usize("IPSTACK_TCP_MSS", cfg.tcp_mss);
        cfg.ip_send_queue_cap = env_usize("IPSTACK_IP_SEND_QUEUE_CAP", cfg.ip_send_queue_cap);
        cfg.hosts = env_hosts("IPSTACK_HOSTS");
        cfg
    }
}

/// Parse `IPSTACK_HOSTS` as `name=1.2.3.4,other=5.6.7.8`. A malformed entry
/// is logged and skipped rather than failing the whole table.
fn env_hosts(key: &str) -> HashMap<String, Ipv4Addr> {
    let mut hosts = HashMap::new();
    let Some(raw) = env::var(key).ok() else {
        return hosts;
    };
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match entry.split_once('=') {
            Some((name, addr)) => match addr.parse::<Ipv4Addr>() {
                Ok(addr) => {
                    hosts.insert(name.to_string(), addr);
                }
                Err(_) => log::warn!("config: {} entry '{}' has an invalid address", key, entry),
            },
            None => log::warn!("config: {} entry '{}' is missing '='", key, entry),
        }
    }
    hosts
}

fn env_millis(key: &str, default: Duration) -> Duration {
    match env::var(key).ok().and_then(|v| v.parse::<u64>().ok()) {
        Some(ms) => Duration::from_millis(ms),
        None => default,
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = StackConfig::default();
        assert_eq!(cfg.arp_timeout, Duration::from_millis(500));
        assert_eq!(cfg.tcp_rto, Duration::from_millis(1000));
        assert_eq!(cfg.tcp_max_retransmits, 100);
        assert_eq!(cfg.tcp_msl, Duration::from_millis(1000));
    }
}
