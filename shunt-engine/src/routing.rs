//! Policy routing for marked packets
//!
//! Marked packets are steered into the strategy's table by an `ip rule`.
//! For TPROXY the table holds a `local` default route, so packets are
//! delivered to the host and caught by the TPROXY target in `PREROUTING`.
//! For the tunnel the table routes into the tunnel device.
//!
//! IPv6 has two special cases. A host without global IPv6 has no IPv6
//! default route at all, so sockets fail before reaching `OUTPUT`; for
//! TPROXY a dummy link supplies that route. The tunnel instead adds a
//! low-priority rule sending all IPv6 traffic to its table.

use ipnet::{IpNet, Ipv6Net};
use shunt_net::{AddressFamily, PolicyRule, RouteOp, TableRoute};

use crate::applier::RuleApplier;
use crate::error::Result;
use crate::policy::ProxyPolicy;
use crate::strategy::{
    Interception, DUMMY_ADDRESS, DUMMY_DEVICE, DUMMY_ROUTE_METRIC, TUN_CATCH_ALL_PRIORITY,
};

/// Builds and applies the routing attachment of a strategy
pub struct PolicyRoutingManager<'a> {
    policy: &'a ProxyPolicy,
}

impl<'a> PolicyRoutingManager<'a> {
    pub fn new(policy: &'a ProxyPolicy) -> Self {
        Self { policy }
    }

    /// Ops attaching one family
    pub fn attach_ops(&self, family: AddressFamily) -> Vec<RouteOp> {
        let interception = &self.policy.interception;
        let table = interception.table();
        let fwmark = RouteOp::AddPolicyRule(PolicyRule::fwmark(family, interception.mark(), table));

        match interception {
            Interception::KernelRedirect { .. } => {
                let mut ops = Vec::new();
                if family == AddressFamily::V6 && self.policy.use_dummy {
                    ops.extend(self.dummy_ops());
                }
                ops.push(fwmark);
                ops.push(RouteOp::AddRoute(TableRoute::local_default(family, "lo", table)));
                ops
            }
            Interception::UserspaceTunnel { device, .. } => {
                let mut ops = vec![fwmark];
                if family == AddressFamily::V6 {
                    ops.push(RouteOp::AddPolicyRule(PolicyRule::catch_all(
                        family,
                        table,
                        TUN_CATCH_ALL_PRIORITY,
                    )));
                }
                ops.push(RouteOp::AddRoute(TableRoute::default_dev(
                    family,
                    device.as_str(),
                    table,
                )));
                ops
            }
        }
    }

    /// Ops detaching one family
    ///
    /// Every entry the attachment may have created is listed, whether or
    /// not it exists, so the list also cleans up after a crashed session.
    pub fn detach_ops(&self, family: AddressFamily) -> Vec<RouteOp> {
        let interception = &self.policy.interception;
        let table = interception.table();
        let mut ops = Vec::new();

        if family == AddressFamily::V6 {
            match interception {
                Interception::KernelRedirect { .. } => ops.push(RouteOp::DeleteLink {
                    name: DUMMY_DEVICE.to_string(),
                }),
                Interception::UserspaceTunnel { .. } => {
                    ops.push(RouteOp::DeletePolicyRule(PolicyRule::catch_all(
                        family,
                        table,
                        TUN_CATCH_ALL_PRIORITY,
                    )))
                }
            }
        }

        ops.push(RouteOp::DeletePolicyRule(PolicyRule::fwmark(
            family,
            interception.mark(),
            table,
        )));
        ops.push(RouteOp::FlushTable { family, table });
        ops
    }

    pub fn attach(&self, applier: &RuleApplier<'_>, family: AddressFamily) -> Result<()> {
        let ops = self.attach_ops(family);
        applier.install_routes(family, self.policy.interception.table(), &ops)?;
        log::info!(
            "Attached {} routing table {}",
            family,
            self.policy.interception.table()
        );
        Ok(())
    }

    pub fn detach(&self, applier: &RuleApplier<'_>, family: AddressFamily) {
        applier.remove_routes(&self.detach_ops(family));
    }

    fn dummy_ops(&self) -> Vec<RouteOp> {
        vec![
            RouteOp::AddDummyLink {
                name: DUMMY_DEVICE.to_string(),
                address: IpNet::V6(Ipv6Net::from(DUMMY_ADDRESS)),
            },
            RouteOp::AddRoute(
                TableRoute::main_default_dev(AddressFamily::V6, DUMMY_DEVICE)
                    .with_metric(DUMMY_ROUTE_METRIC),
            ),
        ]
    }
}
