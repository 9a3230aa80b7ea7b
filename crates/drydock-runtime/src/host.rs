use drydock_schema::HostNetwork;
use ipnetwork::IpNetwork;
use nix::ifaddrs::getifaddrs;
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};

/// Addresses bound to host interfaces, with their netmasks.
///
/// Interfaces without a netmask (point-to-point peers, some tunnels) are
/// skipped.
pub fn host_networks() -> Result<Vec<HostNetwork>, std::io::Error> {
    let mut out = Vec::new();
    for ifa in getifaddrs().map_err(std::io::Error::from)? {
        let (Some(addr), Some(mask)) = (ifa.address, ifa.netmask) else {
            continue;
        };
        let pair = if let (Some(a), Some(m)) = (addr.as_sockaddr_in(), mask.as_sockaddr_in()) {
            Some((
                IpAddr::V4(*SocketAddrV4::from(*a).ip()),
                IpAddr::V4(*SocketAddrV4::from(*m).ip()),
            ))
        } else if let (Some(a), Some(m)) = (addr.as_sockaddr_in6(), mask.as_sockaddr_in6()) {
            Some((
                IpAddr::V6(*SocketAddrV6::from(*a).ip()),
                IpAddr::V6(*SocketAddrV6::from(*m).ip()),
            ))
        } else {
            None
        };
        let Some((ip, netmask)) = pair else {
            continue;
        };
        match IpNetwork::with_netmask(ip, netmask) {
            Ok(network) => out.push(HostNetwork {
                interface: ifa.interface_name.clone(),
                network,
            }),
            Err(e) => tracing::debug!("skipping {} address {ip}: {e}", ifa.interface_name),
        }
    }
    Ok(out)
}
