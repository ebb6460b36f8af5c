use std::net::{IpAddr, Ipv4Addr};
use sysinfo::{Networks, System};

/// A non-loopback IPv4 address bound to a named network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub name: String,
    pub addr: Ipv4Addr,
}

/// Enumerate non-loopback IPv4 interface addresses, sorted by interface name.
pub fn ipv4_interfaces() -> Vec<InterfaceAddr> {
    let networks = Networks::new_with_refreshed_list();

    let mut found: Vec<InterfaceAddr> = networks
        .list()
        .iter()
        .flat_map(|(name, data)| {
            data.ip_networks().iter().filter_map(move |net| match net.addr {
                IpAddr::V4(addr) if !addr.is_loopback() && !addr.is_unspecified() => {
                    Some(InterfaceAddr {
                        name: name.clone(),
                        addr,
                    })
                }
                _ => None,
            })
        })
        .collect();

    found.sort_by(|a, b| a.name.cmp(&b.name).then(a.addr.cmp(&b.addr)));
    found
}

/// Hostname of this machine, `"localhost"` if it can't be determined.
pub fn local_hostname() -> String {
    System::host_name()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
