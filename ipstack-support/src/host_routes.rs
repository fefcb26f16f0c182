//! Best-effort import of the host OS's routing table at startup (spec.md
//! §6 "Environment": "Static routing initialized from the host OS routing
//! table (optional) or via explicit calls at startup").
//!
//! Parsing is split from applying: [`parse_proc_net_route`] takes the raw
//! text of Linux's `/proc/net/route` (a stable, documented kernel ABI) so
//! it can be unit-tested without touching the filesystem; callers combine
//! the parsed entries with their own interface-name -> `DevIndex` mapping
//! before handing them to `RouteTable::add_static`.

use ipstack_types::Ipv4Addr;
use thiserror::Error;

/// One row of `/proc/net/route`, after decoding its little-endian hex
/// fields into the address types the rest of the stack uses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinuxRoute {
    pub iface: String,
    pub destination: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub metric: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostRouteError {
    #[error("line {0} has fewer than 8 whitespace-separated fields")]
    TooFewFields(usize),
    #[error("line {0} has a malformed hex field: {1}")]
    BadHexField(usize, String),
}

/// Parse the body of `/proc/net/route`. The first line is a column-header
/// row and is always skipped; malformed data lines are reported by index
/// (0-based, counting only data lines) rather than aborting the whole
/// parse, so one corrupt row doesn't hide the rest of a real routing
/// table from the caller.
pub fn parse_proc_net_route(contents: &str) -> (Vec<LinuxRoute>, Vec<HostRouteError>) {
    let mut routes = Vec::new();
    let mut errors = Vec::new();
    for (idx, line) in contents.lines().skip(1).enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            errors.push(HostRouteError::TooFewFields(idx));
            continue;
        }
        let iface = fields[0].to_string();
        let parse_hex_addr = |field: &str| -> Option<Ipv4Addr> {
            let val = u32::from_str_radix(field, 16).ok()?;
            // /proc/net/route stores addresses as little-endian u32.
            Some(Ipv4Addr::from_bytes(val.to_le_bytes()))
        };
        let destination = match parse_hex_addr(fields[1]) {
            Some(a) => a,
            None => {
                errors.push(HostRouteError::BadHexField(idx, fields[1].to_string()));
                continue;
            }
        };
        let gateway = match parse_hex_addr(fields[2]) {
            Some(a) => a,
            None => {
                errors.push(HostRouteError::BadHexField(idx, fields[2].to_string()));
                continue;
            }
        };
        let metric: u32 = fields[6].parse().unwrap_or(0);
        let mask = match parse_hex_addr(fields[7]) {
            Some(a) => a,
            None => {
                errors.push(HostRouteError::BadHexField(idx, fields[7].to_string()));
                continue;
            }
        };
        routes.push(LinuxRoute {
            iface,
            destination,
            gateway,
            mask,
            metric,
        });
    }
    (routes, errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT\n\
eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0\n\
eth0\t0001A8C0\t00000000\t0001\t0\t0\t0\t00FFFFFF\t0\t0\t0\n";

    #[test]
    fn parses_default_and_connected_routes() {
        let (routes, errors) = parse_proc_net_route(SAMPLE);
        assert!(errors.is_empty());
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].destination, Ipv4Addr::UNSPECIFIED);
        assert_eq!(routes[0].gateway, Ipv4Addr::from_bytes([192, 168, 1, 1]));
        assert_eq!(routes[1].destination, Ipv4Addr::from_bytes([192, 168, 1, 0]));
        assert_eq!(routes[1].mask, Ipv4Addr::from_bytes([255, 255, 255, 0]));
    }

    #[test]
    fn reports_malformed_rows_without_discarding_valid_ones() {
        let input = "header line ignored\neth0\tZZZZZZZZ\t00000000\t0001\t0\t0\t0\t00FFFFFF\t0\t0\t0\n";
        let (routes, errors) = parse_proc_net_route(input);
        assert!(routes.is_empty());
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn too_few_fields_is_reported() {
        let input = "header\neth0 short row\n";
        let (routes, errors) = parse_proc_net_route(input);
        assert!(routes.is_empty());
        assert_eq!(errors, vec![HostRouteError::TooFewFields(0)]);
    }
}
