//! DNS redirection
//!
//! Cores with a local resolver get port-53 traffic NAT-redirected to it.
//! Cores resolving inside the proxied stream only see IPv4 DNS when IPv6 is
//! not intercepted, so system IPv6 DNS is rejected for the session.

use std::sync::Arc;

use shunt_net::{
    Action, AddressFamily, ControlPlane, FirewallOp, Position, Protocol, Rule, Table,
};

use crate::error::{Error, Result};
use crate::strategy::DNS_PORT;

/// DNS adjustment collaborator
pub trait DnsRedirector: Send + Sync {
    /// Redirect DNS on both families to a local port
    fn redirect(&self, port: u16) -> Result<()>;

    /// Remove a redirect, ignoring rules that are already gone
    fn clean(&self, port: u16);

    /// Reject IPv6 DNS queries from the host and its clients
    fn disable_system_ipv6_dns(&self) -> Result<()>;

    /// Lift the IPv6 DNS rejection, ignoring rules that are already gone
    fn enable_system_ipv6_dns(&self);
}

/// [`DnsRedirector`] implemented with `nat` and `filter` table rules
pub struct NetfilterDns {
    plane: Arc<dyn ControlPlane>,
    core_gid: u32,
}

impl NetfilterDns {
    pub fn new(plane: Arc<dyn ControlPlane>, core_gid: u32) -> Self {
        Self { plane, core_gid }
    }

    /// Rules redirecting DNS to `port`, as (family, chain, rule)
    pub fn redirect_rules(&self, port: u16) -> Vec<(AddressFamily, &'static str, Rule)> {
        let redirect = Action::Redirect { to_port: port };
        let mut rules = Vec::new();
        for family in AddressFamily::ALL {
            rules.push((
                family,
                "OUTPUT",
                Rule::new(redirect.clone())
                    .protocol(Protocol::Udp)
                    .not_gid_owner(self.core_gid)
                    .dport(DNS_PORT),
            ));
            rules.push((
                family,
                "PREROUTING",
                Rule::new(redirect.clone())
                    .protocol(Protocol::Udp)
                    .dport(DNS_PORT),
            ));
        }
        rules
    }

    /// Rules rejecting IPv6 DNS, as chain and rule
    pub fn ipv6_block_rules(&self) -> Vec<(&'static str, Rule)> {
        ["OUTPUT", "FORWARD"]
            .into_iter()
            .map(|chain| {
                (
                    chain,
                    Rule::new(Action::Reject)
                        .protocol(Protocol::Udp)
                        .dport(DNS_PORT),
                )
            })
            .collect()
    }

    fn insert(&self, family: AddressFamily, table: Table, chain: &str, rule: Rule) -> Result<()> {
        let op = FirewallOp::AddRule {
            family,
            table,
            chain: chain.to_string(),
            position: Position::FRONT,
            rule,
        };
        log::debug!("apply: {}", op);
        self.plane.firewall(&op).map_err(|source| Error::Dns {
            op: op.to_string(),
            source,
        })
    }

    fn delete(&self, family: AddressFamily, table: Table, chain: &str, rule: Rule) {
        let op = FirewallOp::DeleteRule {
            family,
            table,
            chain: chain.to_string(),
            rule,
        };
        if let Err(e) = self.plane.firewall(&op) {
            log::debug!("teardown `{}`: {}", op, e);
        }
    }
}

impl DnsRedirector for NetfilterDns {
    fn redirect(&self, port: u16) -> Result<()> {
        for (family, chain, rule) in self.redirect_rules(port) {
            self.insert(family, Table::Nat, chain, rule)?;
        }
        log::info!("Redirected DNS to local port {}", port);
        Ok(())
    }

    fn clean(&self, port: u16) {
        for (family, chain, rule) in self.redirect_rules(port) {
            self.delete(family, Table::Nat, chain, rule);
        }
    }

    fn disable_system_ipv6_dns(&self) -> Result<()> {
        for (chain, rule) in self.ipv6_block_rules() {
            self.insert(AddressFamily::V6, Table::Filter, chain, rule)?;
        }
        log::info!("Disabled system IPv6 DNS");
        Ok(())
    }

    fn enable_system_ipv6_dns(&self) {
        for (chain, rule) in self.ipv6_block_rules() {
            self.delete(AddressFamily::V6, Table::Filter, chain, rule);
        }
    }
}
