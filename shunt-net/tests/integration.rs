//! Integration tests for shunt-net
//!
//! # Permission Requirements
//!
//! Tests that touch the live netfilter tables or routing policy database
//! need root or `CAP_NET_ADMIN` and are marked with `#[ignore]`.
//!
//! ```bash
//! sudo cargo test -p shunt-net --test integration -- --ignored
//! ```
//!
//! ## Test Categories
//!
//! - `test_*` - Run against the in-memory control plane
//! - `test_privileged_*` - Run against the live kernel (marked with `#[ignore]`)

use shunt_net::{
    Action, AddressFamily, CommandControlPlane, ControlPlane, FirewallOp, KernelState, Mark,
    MockControlPlane, PolicyRule, Position, Protocol, RouteOp, Rule, Table, TableRoute,
};

const MARK: Mark = Mark::bit(0x1000000);

fn chain_ops(family: AddressFamily, chain: &str) -> Vec<FirewallOp> {
    let add = |position, rule| FirewallOp::AddRule {
        family,
        table: Table::Mangle,
        chain: chain.to_string(),
        position,
        rule,
    };

    vec![
        FirewallOp::NewChain {
            family,
            table: Table::Mangle,
            chain: chain.to_string(),
        },
        add(Position::Append, Rule::returning().gid_owner(3005)),
        add(
            Position::Append,
            Rule::new(Action::Mark(MARK)).protocol(Protocol::Tcp),
        ),
        FirewallOp::AddRule {
            family,
            table: Table::Mangle,
            chain: "OUTPUT".into(),
            position: Position::FRONT,
            rule: Rule::jump(chain),
        },
    ]
}

fn teardown_ops(family: AddressFamily, chain: &str) -> Vec<FirewallOp> {
    vec![
        FirewallOp::DeleteRule {
            family,
            table: Table::Mangle,
            chain: "OUTPUT".into(),
            rule: Rule::jump(chain),
        },
        FirewallOp::FlushAndDeleteChain {
            family,
            table: Table::Mangle,
            chain: chain.to_string(),
        },
    ]
}

/// A chain hooked into OUTPUT and torn down again leaves no trace
#[test]
fn test_chain_lifecycle_restores_baseline() {
    let mock = MockControlPlane::new();

    for op in chain_ops(AddressFamily::V4, "PROXY") {
        mock.firewall(&op).unwrap();
    }
    let state = mock.state();
    assert_eq!(state.user_chains().len(), 1);
    assert_eq!(
        state.chain(AddressFamily::V4, Table::Mangle, "OUTPUT").unwrap()[0],
        Rule::jump("PROXY")
    );
    assert!(!state.has_chain(AddressFamily::V6, Table::Mangle, "PROXY"));

    for op in teardown_ops(AddressFamily::V4, "PROXY") {
        mock.firewall(&op).unwrap();
    }
    assert_eq!(mock.state(), KernelState::baseline());
}

/// Deleting the chain before its hook is refused
#[test]
fn test_teardown_order_matters() {
    let mock = MockControlPlane::new();
    for op in chain_ops(AddressFamily::V6, "XT") {
        mock.firewall(&op).unwrap();
    }

    let ops = teardown_ops(AddressFamily::V6, "XT");
    assert!(mock.firewall(&ops[1]).is_err());
    mock.firewall(&ops[0]).unwrap();
    mock.firewall(&ops[1]).unwrap();
}

/// Routing policy entries are tracked per family
#[test]
fn test_policy_routing_per_family() {
    let mock = MockControlPlane::new();
    let v4 = PolicyRule::fwmark(AddressFamily::V4, MARK, 160);
    let v6 = PolicyRule::fwmark(AddressFamily::V6, MARK, 160);

    mock.route(&RouteOp::AddPolicyRule(v4.clone())).unwrap();
    mock.route(&RouteOp::AddPolicyRule(v6.clone())).unwrap();
    assert!(mock.route(&RouteOp::AddPolicyRule(v4.clone())).is_err());

    mock.route(&RouteOp::DeletePolicyRule(v6)).unwrap();
    assert_eq!(mock.state().policy_rules, vec![v4]);
}

/// The journal renders ops the way the live tools receive them
#[test]
fn test_journal_rendering() {
    let mock = MockControlPlane::new();
    mock.route(&RouteOp::AddRoute(TableRoute::local_default(
        AddressFamily::V6,
        "lo",
        160,
    )))
    .unwrap();

    assert_eq!(
        mock.journal(),
        vec!["ip -6 route add local default dev lo table 160".to_string()]
    );
}

/// Build, hook and remove a chain in the live mangle table
#[test]
#[ignore = "requires root privileges"]
fn test_privileged_live_chain_lifecycle() {
    let plane = CommandControlPlane::new();
    let chain = "SHUNT_TEST";

    for op in chain_ops(AddressFamily::V4, chain) {
        plane.firewall(&op).expect("apply chain op");
    }
    for op in teardown_ops(AddressFamily::V4, chain) {
        plane.firewall(&op).expect("remove chain op");
    }
}

/// Deleting an absent rule reports a command failure
#[test]
#[ignore = "requires root privileges"]
fn test_privileged_missing_rule_fails() {
    let plane = CommandControlPlane::new();
    let result = plane.firewall(&FirewallOp::DeleteRule {
        family: AddressFamily::V4,
        table: Table::Mangle,
        chain: "OUTPUT".into(),
        rule: Rule::jump("SHUNT_ABSENT"),
    });

    assert!(result.is_err());
}

/// Add and flush a policy-routing table
#[test]
#[ignore = "requires root privileges"]
fn test_privileged_routing_table() {
    let plane = CommandControlPlane::new();
    let rule = PolicyRule::fwmark(AddressFamily::V4, Mark::bit(0x8000000), 250);

    plane.route(&RouteOp::AddPolicyRule(rule.clone())).expect("add rule");
    plane
        .route(&RouteOp::AddRoute(TableRoute::local_default(
            AddressFamily::V4,
            "lo",
            250,
        )))
        .expect("add route");

    plane.route(&RouteOp::DeletePolicyRule(rule)).expect("delete rule");
    plane
        .route(&RouteOp::FlushTable {
            family: AddressFamily::V4,
            table: 250,
        })
        .expect("flush table");
}
