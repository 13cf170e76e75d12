//! Address families
//!
//! IPv4 and IPv6 have fully independent netfilter tables and routing
//! policy databases. Everything in this crate is scoped to one family.

use std::fmt;

use ipnet::IpNet;

/// IP address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// Both families, IPv4 first
    pub const ALL: [AddressFamily; 2] = [AddressFamily::V4, AddressFamily::V6];

    /// Name of the iptables binary that manages this family
    pub fn iptables(&self) -> &'static str {
        match self {
            AddressFamily::V4 => "iptables",
            AddressFamily::V6 => "ip6tables",
        }
    }

    /// Leading arguments for the `ip` tool
    pub fn ip_args(&self) -> &'static [&'static str] {
        match self {
            AddressFamily::V4 => &[],
            AddressFamily::V6 => &["-6"],
        }
    }

    /// Family of a network
    pub fn of_net(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => AddressFamily::V4,
            IpNet::V6(_) => AddressFamily::V6,
        }
    }

    /// Whether a network belongs to this family
    pub fn contains(&self, net: &IpNet) -> bool {
        Self::of_net(net) == *self
    }

    /// Keep only the networks of this family, preserving order
    pub fn filter<'a, I>(&self, nets: I) -> impl Iterator<Item = &'a IpNet>
    where
        I: IntoIterator<Item = &'a IpNet>,
    {
        let family = *self;
        nets.into_iter().filter(move |n| family.contains(n))
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "ipv4"),
            AddressFamily::V6 => write!(f, "ipv6"),
        }
    }
}
