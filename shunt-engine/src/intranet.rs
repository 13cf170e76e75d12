//! Intranet exception ranges
//!
//! Destinations in these ranges are never proxied. The table starts from
//! the special-purpose address blocks, gains the host's own unicast
//! addresses at startup and may be extended with the subnets served on
//! access-point interfaces.

use std::net::IpAddr;
use std::process::Command;

use ipnet::IpNet;
use shunt_net::AddressFamily;

use crate::error::{Error, Result};

/// Special-purpose IPv4 blocks
pub const BUILTIN_V4: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.0.0.0/8",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.88.99.0/24",
    "192.168.0.0/16",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "255.255.255.255/32",
];

/// Special-purpose IPv6 blocks
pub const BUILTIN_V6: &[&str] = &[
    "::/128",
    "::1/128",
    "::ffff:0:0/96",
    "100::/64",
    "64:ff9b::/96",
    "2001::/32",
    "2001:10::/28",
    "2001:20::/28",
    "2001:db8::/32",
    "2002::/16",
    "fe80::/10",
    "ff00::/8",
];

/// Per-family list of ranges that bypass the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntranetTable {
    v4: Vec<IpNet>,
    v6: Vec<IpNet>,
    global_v6: bool,
}

impl IntranetTable {
    /// Only the special-purpose blocks
    pub fn builtin() -> Self {
        fn parse(list: &[&str]) -> Vec<IpNet> {
            list.iter().filter_map(|s| s.parse().ok()).collect()
        }

        Self {
            v4: parse(BUILTIN_V4),
            v6: parse(BUILTIN_V6),
            global_v6: false,
        }
    }

    /// Special-purpose blocks plus the host's own unicast addresses
    pub fn discover() -> Self {
        let mut table = Self::builtin();
        match local_ip_address::list_afinet_netifas() {
            Ok(ifas) => table.add_host_addresses(ifas.into_iter().map(|(_, ip)| ip)),
            Err(e) => log::warn!("Failed to list interface addresses: {}", e),
        }
        table
    }

    /// Add host addresses as single-address ranges
    ///
    /// Only unicast addresses with a scope beyond the link are kept. Any such
    /// IPv6 address means the host has IPv6 connectivity of its own.
    pub fn add_host_addresses<I>(&mut self, addrs: I)
    where
        I: IntoIterator<Item = IpAddr>,
    {
        for ip in addrs {
            if !is_global_unicast(&ip) {
                continue;
            }
            if ip.is_ipv6() {
                self.global_v6 = true;
            }
            let prefix = if ip.is_ipv4() { 32 } else { 128 };
            if let Ok(net) = IpNet::new(ip, prefix) {
                self.push(net);
            }
        }
    }

    /// Merge operator-supplied ranges
    pub fn merge<I>(&mut self, nets: I)
    where
        I: IntoIterator<Item = IpNet>,
    {
        for net in nets {
            self.push(net.trunc());
        }
    }

    /// Add the subnets assigned to access-point interfaces
    ///
    /// `output` is the text of `ip -o addr`. A pattern ending in `+` matches
    /// every interface with that prefix, as iptables does.
    pub fn add_access_point_subnets(&mut self, output: &str, patterns: &[String]) {
        let mut found = Vec::new();
        for line in output.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 || !matches!(fields[2], "inet" | "inet6") {
                continue;
            }
            let name = fields[1].split('@').next().unwrap_or(fields[1]);
            if !patterns.iter().any(|p| interface_matches(p, name)) {
                continue;
            }
            if let Ok(net) = fields[3].parse::<IpNet>() {
                found.push(net);
            }
        }

        log::debug!("Access-point subnets for {:?}: {:?}", patterns, found);
        self.merge(found);
    }

    /// Query the live interfaces and add access-point subnets
    pub fn refresh_access_points(&mut self, patterns: &[String]) -> Result<()> {
        if patterns.is_empty() {
            return Ok(());
        }

        let output = Command::new("ip").args(["-o", "addr"]).output()?;
        if !output.status.success() {
            return Err(Error::Config(format!(
                "ip -o addr failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        self.add_access_point_subnets(&String::from_utf8_lossy(&output.stdout), patterns);
        Ok(())
    }

    /// Ranges of one family, in insertion order
    pub fn ranges(&self, family: AddressFamily) -> &[IpNet] {
        match family {
            AddressFamily::V4 => &self.v4,
            AddressFamily::V6 => &self.v6,
        }
    }

    /// Whether a global IPv6 address was seen on the host
    pub fn has_global_v6(&self) -> bool {
        self.global_v6
    }

    fn push(&mut self, net: IpNet) {
        let list = match net {
            IpNet::V4(_) => &mut self.v4,
            IpNet::V6(_) => &mut self.v6,
        };
        if !list.contains(&net) {
            list.push(net);
        }
    }
}

impl Default for IntranetTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Interface name match with iptables `+` wildcard semantics
pub fn interface_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('+') {
        Some(prefix) => name.starts_with(prefix),
        None => name == pattern,
    }
}

fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_link_local()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_unspecified() || v6.is_loopback() || v6.is_multicast() || link_local)
        }
    }
}
