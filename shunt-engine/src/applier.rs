//! Op execution against a control plane
//!
//! Installs stop at the first failing op and report exactly which op,
//! chain and family broke. Removals run every op and only log failures,
//! since teardown must always complete.

use shunt_net::{AddressFamily, ControlPlane, FirewallOp, RouteOp};

use crate::error::{Error, Result};

/// Runs firewall and routing ops in order
pub struct RuleApplier<'a> {
    plane: &'a dyn ControlPlane,
}

impl<'a> RuleApplier<'a> {
    pub fn new(plane: &'a dyn ControlPlane) -> Self {
        Self { plane }
    }

    /// Apply firewall ops, stopping at the first failure
    pub fn install_firewall(&self, ops: &[FirewallOp]) -> Result<()> {
        for op in ops {
            log::debug!("apply: {}", op);
            self.plane
                .firewall(op)
                .map_err(|source| Error::ControlPlane {
                    family: op.family(),
                    target: op.chain().to_string(),
                    op: op.to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Apply routing ops, stopping at the first failure
    pub fn install_routes(&self, family: AddressFamily, table: u32, ops: &[RouteOp]) -> Result<()> {
        for op in ops {
            log::debug!("apply: {}", op);
            self.plane
                .route(op)
                .map_err(|source| Error::ControlPlane {
                    family,
                    target: format!("table {}", table),
                    op: op.to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Run every firewall op, logging failures at debug level
    ///
    /// Returns how many ops succeeded.
    pub fn remove_firewall(&self, ops: &[FirewallOp]) -> usize {
        ops.iter()
            .filter(|op| match self.plane.firewall(op) {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("teardown `{}`: {}", op, e);
                    false
                }
            })
            .count()
    }

    /// Run every routing op, logging failures at debug level
    pub fn remove_routes(&self, ops: &[RouteOp]) -> usize {
        ops.iter()
            .filter(|op| match self.plane.route(op) {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("teardown `{}`: {}", op, e);
                    false
                }
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use shunt_net::{MockControlPlane, Rule, Table};

    use super::*;

    fn new_chain(chain: &str) -> FirewallOp {
        FirewallOp::NewChain {
            family: AddressFamily::V6,
            table: Table::Mangle,
            chain: chain.into(),
        }
    }

    #[test]
    fn test_install_stops_at_first_error() {
        let mock = MockControlPlane::new();
        mock.fail_at(2);
        let applier = RuleApplier::new(&mock);

        let err = applier
            .install_firewall(&[new_chain("A"), new_chain("B"), new_chain("C")])
            .unwrap_err();

        match err {
            Error::ControlPlane {
                family, target, op, ..
            } => {
                assert_eq!(family, AddressFamily::V6);
                assert_eq!(target, "B");
                assert_eq!(op, "ip6tables -t mangle -N B");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mock.op_count(), 2);
    }

    #[test]
    fn test_remove_runs_every_op() {
        let mock = MockControlPlane::new();
        let applier = RuleApplier::new(&mock);
        applier.install_firewall(&[new_chain("B")]).unwrap();

        let removed = applier.remove_firewall(&[
            FirewallOp::DeleteRule {
                family: AddressFamily::V6,
                table: Table::Mangle,
                chain: "OUTPUT".into(),
                rule: Rule::jump("B"),
            },
            FirewallOp::FlushAndDeleteChain {
                family: AddressFamily::V6,
                table: Table::Mangle,
                chain: "B".into(),
            },
        ]);

        assert_eq!(removed, 1);
        assert!(mock.state().user_chains().is_empty());
    }

    #[test]
    fn test_route_error_names_table() {
        let mock = MockControlPlane::new();
        let applier = RuleApplier::new(&mock);
        let err = applier
            .install_routes(
                AddressFamily::V4,
                160,
                &[RouteOp::DeleteLink {
                    name: "xdummy".into(),
                }],
            )
            .unwrap_err();
        assert!(err.to_string().starts_with("ipv4 table 160:"));
    }
}
