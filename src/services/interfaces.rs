//! Host network interface lookup

use std::net::{IpAddr, Ipv4Addr};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;

use crate::error::PathError;

/// One address assigned to a local interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub name: String,
    pub addr: IpAddr,
    pub up: bool,
    pub loopback: bool,
}

/// Snapshot of every IPv4/IPv6 address on the host
pub fn list_interfaces() -> Result<Vec<InterfaceAddr>, PathError> {
    let addrs = getifaddrs().map_err(|e| PathError::Interfaces(e.to_string()))?;

    Ok(addrs
        .filter_map(|ifa| {
            let storage = ifa.address?;
            let addr = if let Some(v4) = storage.as_sockaddr_in() {
                IpAddr::V4(v4.ip())
            } else if let Some(v6) = storage.as_sockaddr_in6() {
                IpAddr::V6(v6.ip())
            } else {
                return None;
            };

            Some(InterfaceAddr {
                name: ifa.interface_name,
                addr,
                up: ifa.flags.contains(InterfaceFlags::IFF_UP)
                    && ifa.flags.contains(InterfaceFlags::IFF_RUNNING),
                loopback: ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK),
            })
        })
        .collect())
}

/// Address to bind egress sockets to on `interface`, if it is usable.
/// IPv4 is preferred; IPv6 link-local addresses are skipped.
pub fn egress_address(interfaces: &[InterfaceAddr], interface: &str) -> Option<IpAddr> {
    let mut candidates = interfaces
        .iter()
        .filter(|i| i.name == interface && i.up)
        .map(|i| i.addr)
        .filter(|addr| match addr {
            IpAddr::V4(v4) => !v4.is_unspecified(),
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80,
        })
        .collect::<Vec<_>>();

    candidates.sort_by_key(|addr| !addr.is_ipv4());
    candidates.first().copied()
}

/// IPv4 address clients should point at, taken from the first non-loopback
/// interface whose name contains `hint`
pub fn local_edge_address(interfaces: &[InterfaceAddr], hint: &str) -> Option<Ipv4Addr> {
    interfaces
        .iter()
        .filter(|i| !i.loopback && i.name.contains(hint))
        .find_map(|i| match i.addr {
            IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
            _ => None,
        })
}
