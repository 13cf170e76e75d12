//! Session policy
//!
//! [`ProxyPolicy`] is everything the rule builders and the session
//! controller need, resolved from configuration once and never mutated
//! while a session is active.

use ipnet::IpNet;
use shunt_net::AddressFamily;

use crate::config::CoreFlavor;
use crate::intranet::IntranetTable;
use crate::strategy::Interception;

/// Which local applications are proxied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppMode {
    /// Every application
    Everyone,
    /// Every application except the listed packages
    Blacklist(Vec<String>),
    /// Only the listed packages plus the always-allowed UIDs
    Whitelist(Vec<String>),
}

impl AppMode {
    pub fn name(&self) -> &'static str {
        match self {
            AppMode::Everyone => "everyone",
            AppMode::Blacklist(_) => "blacklist",
            AppMode::Whitelist(_) => "whitelist",
        }
    }
}

/// Immutable interception policy for one session
#[derive(Debug, Clone)]
pub struct ProxyPolicy {
    pub interception: Interception,
    pub mode: AppMode,
    /// UIDs marked in whitelist mode regardless of the package list
    pub always_allow_uids: Vec<u32>,
    pub ignore_interfaces: Vec<String>,
    pub bypass: Vec<IpNet>,
    pub intranet_allow: Vec<IpNet>,
    pub ap_interfaces: Vec<String>,
    pub enable_ipv6: bool,
    /// Attach IPv6 KernelRedirect to the dummy link
    pub use_dummy: bool,
    pub flavor: CoreFlavor,
    pub core_gid: u32,
    pub dns_redirect_port: Option<u16>,
    pub intranet: IntranetTable,
}

impl ProxyPolicy {
    /// Families a session touches, IPv4 first
    pub fn families(&self) -> Vec<AddressFamily> {
        if self.enable_ipv6 {
            AddressFamily::ALL.to_vec()
        } else {
            vec![AddressFamily::V4]
        }
    }

    /// Port DNS is NAT-redirected to after the chains are installed
    ///
    /// Only cores with a local resolver get a redirect.
    pub fn dns_redirect(&self) -> Option<u16> {
        if self.flavor.resolves_locally() {
            self.dns_redirect_port
        } else {
            None
        }
    }

    /// Whether system IPv6 DNS is blocked while the session is active
    ///
    /// Cores resolving inside the proxied stream only see IPv4 DNS when
    /// IPv6 is not intercepted.
    pub fn blocks_ipv6_dns(&self) -> bool {
        !self.flavor.resolves_locally() && !self.enable_ipv6
    }

    /// Bypass ranges of one family
    pub fn bypass_for(&self, family: AddressFamily) -> impl Iterator<Item = &IpNet> {
        family.filter(&self.bypass)
    }

    /// Intranet allow-list entries of one family
    pub fn intranet_allow_for(&self, family: AddressFamily) -> impl Iterator<Item = &IpNet> {
        family.filter(&self.intranet_allow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn policy(toml: &str) -> ProxyPolicy {
        Config::from_toml(toml)
            .unwrap()
            .policy(&IntranetTable::builtin())
            .unwrap()
    }

    #[test]
    fn test_dns_plan_per_flavor() {
        let xray = policy("");
        assert_eq!(xray.dns_redirect(), None);
        assert!(xray.blocks_ipv6_dns());

        let xray_v6 = policy("[proxy]\nenable_ipv6 = true\n");
        assert!(!xray_v6.blocks_ipv6_dns());

        let mihomo = policy("[core]\nflavor = \"mihomo\"\n[dns]\nredirect_port = 1053\n");
        assert_eq!(mihomo.dns_redirect(), Some(1053));
        assert!(!mihomo.blocks_ipv6_dns());

        let hysteria = policy("[core]\nflavor = \"hysteria2\"\n");
        assert_eq!(hysteria.dns_redirect(), None);
        assert!(!hysteria.blocks_ipv6_dns());
    }

    #[test]
    fn test_families() {
        assert_eq!(policy("").families(), vec![AddressFamily::V4]);
        assert_eq!(
            policy("[proxy]\nenable_ipv6 = true\n").families(),
            vec![AddressFamily::V4, AddressFamily::V6]
        );
    }

    #[test]
    fn test_per_family_filters() {
        let p = policy(
            "[proxy]\nbypass = [\"1.1.1.0/24\", \"2606:4700::/32\"]\nintranet_allow = [\"192.168.9.0/24\"]\n",
        );
        assert_eq!(p.bypass_for(AddressFamily::V6).count(), 1);
        assert_eq!(p.intranet_allow_for(AddressFamily::V4).count(), 1);
        assert_eq!(p.intranet_allow_for(AddressFamily::V6).count(), 0);
    }
}
