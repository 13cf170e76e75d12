//! Interception strategies
//!
//! Each strategy owns a fixed set of kernel resources: two mangle chains,
//! one mark bit and one routing table. The marks of different strategies
//! never overlap, so leftovers of one strategy cannot capture packets meant
//! for the other.

use std::net::Ipv6Addr;

use shunt_net::{Action, AddressFamily, Mark};

/// Group owning the proxy core's sockets
pub const CORE_GID: u32 = 3005;

/// Mark set on packets bound for the TPROXY listener
pub const TPROXY_MARK: Mark = Mark::bit(0x1000000);
/// Routing table delivering TPROXY-marked packets locally
pub const TPROXY_TABLE: u32 = 160;

/// Mark set on packets bound for the tunnel device
pub const TUN_MARK: Mark = Mark::bit(0x4000000);
/// Routing table holding the tunnel default route
pub const TUN_TABLE: u32 = 168;
/// Priority of the IPv6 rule sending all traffic to the tunnel table
pub const TUN_CATCH_ALL_PRIORITY: u32 = 31999;

/// Bit-bucket link giving IPv6 sockets a route on hosts without one
pub const DUMMY_DEVICE: &str = "xdummy";
/// Host address assigned to the dummy link
pub const DUMMY_ADDRESS: Ipv6Addr =
    Ipv6Addr::new(0xfd01, 0x5ca1, 0xab1e, 0x8d97, 0x497f, 0x8b48, 0xb9aa, 0x85cd);
/// Metric of the main-table default route through the dummy link
pub const DUMMY_ROUTE_METRIC: u32 = 4096;

pub const DNS_PORT: u16 = 53;

/// Chain names used by one strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSet {
    /// Locally generated traffic, hooked into `OUTPUT`
    pub local: &'static str,
    /// Forwarded and access-point traffic, hooked into `PREROUTING`
    pub forward: &'static str,
}

pub const TPROXY_CHAINS: ChainSet = ChainSet {
    local: "PROXY",
    forward: "XRAY",
};

pub const TUN_CHAINS: ChainSet = ChainSet {
    local: "XT",
    forward: "TUN2SOCKS",
};

/// How marked packets reach the proxy core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interception {
    /// Kernel TPROXY delivery to a local listener
    KernelRedirect {
        /// Port of the core's TPROXY inbound
        port: u16,
    },
    /// Routing into a tunnel device served by a user-space helper
    UserspaceTunnel {
        /// Tunnel device created by the helper
        device: String,
        /// SOCKS5 port the helper forwards to
        socks_port: u16,
    },
}

impl Interception {
    pub fn name(&self) -> &'static str {
        match self {
            Interception::KernelRedirect { .. } => "tproxy",
            Interception::UserspaceTunnel { .. } => "tun2socks",
        }
    }

    pub fn chains(&self) -> ChainSet {
        match self {
            Interception::KernelRedirect { .. } => TPROXY_CHAINS,
            Interception::UserspaceTunnel { .. } => TUN_CHAINS,
        }
    }

    pub fn mark(&self) -> Mark {
        match self {
            Interception::KernelRedirect { .. } => TPROXY_MARK,
            Interception::UserspaceTunnel { .. } => TUN_MARK,
        }
    }

    pub fn table(&self) -> u32 {
        match self {
            Interception::KernelRedirect { .. } => TPROXY_TABLE,
            Interception::UserspaceTunnel { .. } => TUN_TABLE,
        }
    }

    /// Outgoing interface whose traffic must never be re-marked
    ///
    /// Marking packets that already leave through the tunnel or the dummy
    /// link would route them straight back into it.
    pub fn self_bypass(&self, family: AddressFamily, use_dummy: bool) -> Option<&str> {
        match self {
            Interception::UserspaceTunnel { device, .. } => Some(device),
            Interception::KernelRedirect { .. } if family == AddressFamily::V6 && use_dummy => {
                Some(DUMMY_DEVICE)
            }
            Interception::KernelRedirect { .. } => None,
        }
    }

    /// Target used in the forward chain for traffic that should be proxied
    pub fn forward_action(&self) -> Action {
        match self {
            Interception::KernelRedirect { port } => Action::Tproxy {
                port: *port,
                mark: TPROXY_MARK,
            },
            Interception::UserspaceTunnel { .. } => Action::Mark(TUN_MARK),
        }
    }

    /// Whether forwarded packets are diverted only once they carry the mark
    ///
    /// Locally generated TPROXY traffic re-enters through `PREROUTING` after
    /// the mark reroutes it to loopback; the forward chain picks it up there.
    pub fn diverts_marked_only(&self) -> bool {
        matches!(self, Interception::KernelRedirect { .. })
    }

    /// Tunnel device, if this strategy routes into one
    pub fn tunnel_device(&self) -> Option<&str> {
        match self {
            Interception::UserspaceTunnel { device, .. } => Some(device),
            Interception::KernelRedirect { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel() -> Interception {
        Interception::UserspaceTunnel {
            device: "xtun".into(),
            socks_port: 65534,
        }
    }

    #[test]
    fn test_marks_are_disjoint() {
        let tproxy = Interception::KernelRedirect { port: 65535 };
        assert!(!tproxy.mark().overlaps(&tunnel().mark()));
        assert_ne!(tproxy.table(), tunnel().table());
        assert_ne!(tproxy.chains(), tunnel().chains());
    }

    #[test]
    fn test_self_bypass() {
        let tproxy = Interception::KernelRedirect { port: 65535 };
        assert_eq!(tproxy.self_bypass(AddressFamily::V4, true), None);
        assert_eq!(tproxy.self_bypass(AddressFamily::V6, false), None);
        assert_eq!(tproxy.self_bypass(AddressFamily::V6, true), Some(DUMMY_DEVICE));
        assert_eq!(tunnel().self_bypass(AddressFamily::V4, false), Some("xtun"));
    }

    #[test]
    fn test_forward_action() {
        assert_eq!(
            Interception::KernelRedirect { port: 7893 }.forward_action(),
            Action::Tproxy {
                port: 7893,
                mark: TPROXY_MARK
            }
        );
        assert_eq!(tunnel().forward_action(), Action::Mark(TUN_MARK));
        assert!(!tunnel().diverts_marked_only());
    }
}
