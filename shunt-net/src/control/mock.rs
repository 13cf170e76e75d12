//! In-memory control plane for testing
//!
//! [`MockControlPlane`] keeps a model of the kernel state the engine
//! manipulates (chains per family and table, routing policy rules, table
//! routes and links) and enforces the same preconditions the real tools
//! do: a chain must exist before rules are added to it, a chain that is
//! still the target of a jump cannot be deleted, deleting something absent
//! fails, and so on.
//!
//! Failures can be injected by op number or by a substring of the rendered
//! op, which is how rollback behavior is exercised.
//!
//! # Example
//!
//! ```
//! use shunt_net::control::mock::MockControlPlane;
//! use shunt_net::control::ControlPlane;
//! use shunt_net::{AddressFamily, FirewallOp, Table};
//!
//! let mock = MockControlPlane::new();
//! mock.firewall(&FirewallOp::NewChain {
//!     family: AddressFamily::V4,
//!     table: Table::Mangle,
//!     chain: "PROXY".into(),
//! })
//! .unwrap();
//!
//! assert!(mock.state().has_chain(AddressFamily::V4, Table::Mangle, "PROXY"));
//! ```

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use ipnet::IpNet;

use super::ControlPlane;
use crate::error::{Error, Result};
use crate::family::AddressFamily;
use crate::firewall::{FirewallOp, Position, Rule, Table};
use crate::route::{PolicyRule, RouteOp, TableRoute};

/// Identity of a chain
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainKey {
    pub family: AddressFamily,
    pub table: Table,
    pub chain: String,
}

impl ChainKey {
    pub fn new(family: AddressFamily, table: Table, chain: impl Into<String>) -> Self {
        Self {
            family,
            table,
            chain: chain.into(),
        }
    }

    fn is_builtin(&self) -> bool {
        self.table.builtin_chains().contains(&self.chain.as_str())
    }
}

/// Snapshot of simulated kernel state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelState {
    pub chains: BTreeMap<ChainKey, Vec<Rule>>,
    pub policy_rules: Vec<PolicyRule>,
    pub routes: Vec<TableRoute>,
    pub links: BTreeMap<String, Vec<IpNet>>,
}

impl KernelState {
    /// Fresh state: empty built-in chains for every family and table
    pub fn baseline() -> Self {
        let mut chains = BTreeMap::new();
        for family in AddressFamily::ALL {
            for table in [Table::Mangle, Table::Nat, Table::Filter] {
                for chain in table.builtin_chains() {
                    chains.insert(ChainKey::new(family, table, *chain), Vec::new());
                }
            }
        }

        Self {
            chains,
            policy_rules: Vec::new(),
            routes: Vec::new(),
            links: BTreeMap::new(),
        }
    }

    /// Rules of a chain, if it exists
    pub fn chain(&self, family: AddressFamily, table: Table, chain: &str) -> Option<&[Rule]> {
        self.chains
            .get(&ChainKey::new(family, table, chain))
            .map(Vec::as_slice)
    }

    pub fn has_chain(&self, family: AddressFamily, table: Table, chain: &str) -> bool {
        self.chain(family, table, chain).is_some()
    }

    /// Chains that are not built into their table
    pub fn user_chains(&self) -> Vec<&ChainKey> {
        self.chains.keys().filter(|k| !k.is_builtin()).collect()
    }

    fn chain_mut(&mut self, key: &ChainKey) -> Result<&mut Vec<Rule>> {
        self.chains
            .get_mut(key)
            .ok_or_else(|| Error::ChainNotFound(key.chain.clone()))
    }

    fn apply_firewall(&mut self, op: &FirewallOp) -> Result<()> {
        let key = ChainKey::new(op.family(), op.table(), op.chain());

        match op {
            FirewallOp::NewChain { .. } => {
                if self.chains.contains_key(&key) {
                    return Err(Error::ChainExists(key.chain));
                }
                self.chains.insert(key, Vec::new());
            }
            FirewallOp::AddRule { position, rule, .. } => {
                if let Some(target) = rule.jump_target() {
                    let target_key = ChainKey::new(key.family, key.table, target);
                    if !self.chains.contains_key(&target_key) {
                        return Err(Error::ChainNotFound(target.to_string()));
                    }
                }

                let rules = self.chain_mut(&key)?;
                match position {
                    Position::Append => rules.push(rule.clone()),
                    Position::Insert(n) => {
                        let index = *n as usize;
                        if index == 0 || index > rules.len() + 1 {
                            return Err(Error::InvalidPosition {
                                chain: key.chain,
                                position: *n,
                            });
                        }
                        rules.insert(index - 1, rule.clone());
                    }
                }
            }
            FirewallOp::DeleteRule { rule, .. } => {
                let rules = self.chain_mut(&key)?;
                let index = rules
                    .iter()
                    .position(|r| r == rule)
                    .ok_or_else(|| Error::RuleNotFound(rule.to_string()))?;
                rules.remove(index);
            }
            FirewallOp::FlushAndDeleteChain { .. } => {
                if !self.chains.contains_key(&key) {
                    return Err(Error::ChainNotFound(key.chain));
                }
                if key.is_builtin() {
                    return Err(Error::ChainInUse(key.chain));
                }

                let referenced = self.chains.iter().any(|(k, rules)| {
                    k.family == key.family
                        && k.table == key.table
                        && rules.iter().any(|r| r.jump_target() == Some(key.chain.as_str()))
                });
                if referenced {
                    return Err(Error::ChainInUse(key.chain));
                }

                self.chains.remove(&key);
            }
        }

        Ok(())
    }

    fn apply_route(&mut self, op: &RouteOp) -> Result<()> {
        match op {
            RouteOp::AddPolicyRule(rule) => {
                if self.policy_rules.contains(rule) {
                    return Err(Error::RouteExists(rule.to_string()));
                }
                self.policy_rules.push(rule.clone());
            }
            RouteOp::DeletePolicyRule(rule) => {
                let index = self
                    .policy_rules
                    .iter()
                    .position(|r| r == rule)
                    .ok_or_else(|| Error::RouteNotFound(rule.to_string()))?;
                self.policy_rules.remove(index);
            }
            RouteOp::AddRoute(route) => {
                if self.routes.contains(route) {
                    return Err(Error::RouteExists(route.to_string()));
                }
                self.routes.push(route.clone());
            }
            RouteOp::FlushTable { family, table } => {
                self.routes
                    .retain(|r| !(r.family == *family && r.table == Some(*table)));
            }
            RouteOp::AddDummyLink { name, address } => {
                if self.links.contains_key(name) {
                    return Err(Error::LinkExists(name.clone()));
                }
                self.links.insert(name.clone(), vec![*address]);
            }
            RouteOp::DeleteLink { name } => {
                if self.links.remove(name).is_none() {
                    return Err(Error::LinkNotFound(name.clone()));
                }
                self.routes.retain(|r| r.device != *name);
            }
        }

        Ok(())
    }
}

impl Default for KernelState {
    fn default() -> Self {
        Self::baseline()
    }
}

#[derive(Debug)]
enum FailurePlan {
    None,
    AtOp(usize),
    Matching(String),
}

#[derive(Debug)]
struct MockInner {
    state: KernelState,
    journal: Vec<String>,
    ops: usize,
    failure: FailurePlan,
}

/// In-memory [`ControlPlane`]
#[derive(Debug)]
pub struct MockControlPlane {
    inner: Mutex<MockInner>,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::with_state(KernelState::baseline())
    }

    /// Start from a prepared state
    pub fn with_state(state: KernelState) -> Self {
        Self {
            inner: Mutex::new(MockInner {
                state,
                journal: Vec::new(),
                ops: 0,
                failure: FailurePlan::None,
            }),
        }
    }

    /// Fail the `n`-th op (1-based, counted across firewall and route ops)
    pub fn fail_at(&self, n: usize) {
        self.lock().failure = FailurePlan::AtOp(n);
    }

    /// Fail the first op whose rendering contains `pattern`
    pub fn fail_matching(&self, pattern: impl Into<String>) {
        self.lock().failure = FailurePlan::Matching(pattern.into());
    }

    /// Current simulated state
    pub fn state(&self) -> KernelState {
        self.lock().state.clone()
    }

    /// Rendered ops that were applied successfully, in order
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    /// Number of ops attempted so far
    pub fn op_count(&self) -> usize {
        self.lock().ops
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply<F>(&self, rendered: String, apply: F) -> Result<()>
    where
        F: FnOnce(&mut KernelState) -> Result<()>,
    {
        let mut inner = self.lock();
        inner.ops += 1;

        let injected = match &inner.failure {
            FailurePlan::None => false,
            FailurePlan::AtOp(n) => *n == inner.ops,
            FailurePlan::Matching(pattern) => rendered.contains(pattern.as_str()),
        };
        if injected {
            inner.failure = FailurePlan::None;
            return Err(Error::Injected(inner.ops));
        }

        apply(&mut inner.state)?;
        inner.journal.push(rendered);
        Ok(())
    }
}

impl Default for MockControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPlane for MockControlPlane {
    fn firewall(&self, op: &FirewallOp) -> Result<()> {
        self.apply(op.to_string(), |state| state.apply_firewall(op))
    }

    fn route(&self, op: &RouteOp) -> Result<()> {
        self.apply(op.to_string(), |state| state.apply_route(op))
    }
}
