//! Per-family chain construction
//!
//! [`AddressFamilyRuleSet`] turns a [`ProxyPolicy`] into the ordered list
//! of firewall ops that builds the strategy's two mangle chains for one
//! address family and hooks them into `OUTPUT` and `PREROUTING`. Nothing
//! here touches the kernel.
//!
//! Evaluation order inside the local chain, first match wins:
//!
//! 1. DNS handling (inserted last, at the front)
//! 2. Intranet allow-list (inserted at the front)
//! 3. Package bypasses in blacklist mode (inserted at the front)
//! 4. Self-bypass of the tunnel or dummy link
//! 5. Ignored outgoing interfaces
//! 6. Intranet ranges, then user bypass ranges
//! 7. Traffic of the proxy core's group
//! 8. Mode-specific mark rules

use ipnet::IpNet;
use shunt_net::{Action, AddressFamily, FirewallOp, Position, Protocol, Rule, Table};

use crate::packages::UidResolver;
use crate::policy::{AppMode, ProxyPolicy};
use crate::strategy::DNS_PORT;

/// Hook for locally generated traffic
pub const LOCAL_HOOK: &str = "OUTPUT";
/// Hook for forwarded traffic
pub const FORWARD_HOOK: &str = "PREROUTING";

struct ChainBuilder {
    family: AddressFamily,
    chain: &'static str,
    ops: Vec<FirewallOp>,
}

impl ChainBuilder {
    fn new(family: AddressFamily, chain: &'static str) -> Self {
        Self {
            family,
            chain,
            ops: vec![FirewallOp::NewChain {
                family,
                table: Table::Mangle,
                chain: chain.to_string(),
            }],
        }
    }

    fn add(&mut self, position: Position, rule: Rule) {
        self.ops.push(FirewallOp::AddRule {
            family: self.family,
            table: Table::Mangle,
            chain: self.chain.to_string(),
            position,
            rule,
        });
    }

    fn append(&mut self, rule: Rule) {
        self.add(Position::Append, rule);
    }

    fn insert(&mut self, rule: Rule) {
        self.add(Position::FRONT, rule);
    }

    /// Finish by jumping to the chain from the front of a built-in hook
    fn hook(mut self, builtin: &str) -> Vec<FirewallOp> {
        self.ops.push(FirewallOp::AddRule {
            family: self.family,
            table: Table::Mangle,
            chain: builtin.to_string(),
            position: Position::FRONT,
            rule: Rule::jump(self.chain),
        });
        self.ops
    }
}

/// Chain builder for one address family
pub struct AddressFamilyRuleSet<'a> {
    policy: &'a ProxyPolicy,
    family: AddressFamily,
    uids: &'a dyn UidResolver,
}

impl<'a> AddressFamilyRuleSet<'a> {
    pub fn new(policy: &'a ProxyPolicy, family: AddressFamily, uids: &'a dyn UidResolver) -> Self {
        Self {
            policy,
            family,
            uids,
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Ops building both chains, forward chain first
    pub fn build(&self) -> Vec<FirewallOp> {
        let mut ops = self.forward_chain();
        ops.extend(self.local_chain());
        ops
    }

    /// Ops removing both chains and their hooks
    ///
    /// Hooks are removed first; a chain still referenced by a jump cannot be
    /// deleted.
    pub fn teardown(&self) -> Vec<FirewallOp> {
        let chains = self.policy.interception.chains();
        let unhook = |builtin: &str, chain: &str| FirewallOp::DeleteRule {
            family: self.family,
            table: Table::Mangle,
            chain: builtin.to_string(),
            rule: Rule::jump(chain),
        };
        let remove = |chain: &str| FirewallOp::FlushAndDeleteChain {
            family: self.family,
            table: Table::Mangle,
            chain: chain.to_string(),
        };

        vec![
            unhook(LOCAL_HOOK, chains.local),
            unhook(FORWARD_HOOK, chains.forward),
            remove(chains.local),
            remove(chains.forward),
        ]
    }

    /// Ops building the chain for locally generated traffic
    pub fn local_chain(&self) -> Vec<FirewallOp> {
        let policy = self.policy;
        let interception = &policy.interception;
        let mark = Action::Mark(interception.mark());
        let mut chain = ChainBuilder::new(self.family, interception.chains().local);

        if let Some(iface) = interception.self_bypass(self.family, policy.use_dummy) {
            chain.append(Rule::returning().out_interface(iface));
        }
        for iface in &policy.ignore_interfaces {
            chain.append(Rule::returning().out_interface(iface.as_str()));
        }
        self.append_exceptions(&mut chain);
        chain.append(Rule::returning().gid_owner(policy.core_gid));

        match &policy.mode {
            AppMode::Everyone => Self::mark_all(&mut chain, &mark),
            AppMode::Blacklist(packages) => {
                for uid in self.resolve(packages) {
                    chain.insert(Rule::returning().uid_owner(uid));
                }
                Self::mark_all(&mut chain, &mark);
            }
            AppMode::Whitelist(packages) => {
                let uids = self
                    .resolve(packages)
                    .into_iter()
                    .chain(policy.always_allow_uids.iter().copied());
                for uid in uids {
                    for proto in Protocol::BOTH {
                        chain.append(Rule::new(mark.clone()).protocol(proto).uid_owner(uid));
                    }
                }
            }
        }

        for net in policy.intranet_allow_for(self.family) {
            for proto in Protocol::BOTH {
                chain.insert(Rule::new(mark.clone()).protocol(proto).destination(*net));
            }
        }

        let dns = if policy.flavor.resolves_locally() {
            Rule::returning().protocol(Protocol::Udp).dport(DNS_PORT)
        } else {
            Rule::new(mark)
                .protocol(Protocol::Udp)
                .not_gid_owner(policy.core_gid)
                .dport(DNS_PORT)
        };
        chain.insert(dns);

        chain.hook(LOCAL_HOOK)
    }

    /// Ops building the chain for forwarded and access-point traffic
    pub fn forward_chain(&self) -> Vec<FirewallOp> {
        let policy = self.policy;
        let interception = &policy.interception;
        let action = interception.forward_action();
        let mark = interception.mark();
        let marked_only = interception.diverts_marked_only();
        let mut chain = ChainBuilder::new(self.family, interception.chains().forward);

        self.append_exceptions(&mut chain);

        let allow: Vec<IpNet> = policy.intranet_allow_for(self.family).copied().collect();
        for net in &allow {
            for proto in Protocol::BOTH {
                let rule = Rule::new(action.clone()).protocol(proto).destination(*net);
                chain.insert(if marked_only { rule.has_mark(mark) } else { rule });
            }
        }

        if marked_only {
            for proto in Protocol::BOTH {
                chain.append(Rule::new(action.clone()).protocol(proto).has_mark(mark));
            }
        }

        for ap in &policy.ap_interfaces {
            for net in &allow {
                for proto in Protocol::BOTH {
                    chain.insert(
                        Rule::new(action.clone())
                            .protocol(proto)
                            .in_interface(ap.as_str())
                            .destination(*net),
                    );
                }
            }
            for proto in Protocol::BOTH {
                chain.append(
                    Rule::new(action.clone())
                        .protocol(proto)
                        .in_interface(ap.as_str()),
                );
            }
        }

        let dns = if policy.flavor.resolves_locally() {
            Rule::returning().protocol(Protocol::Udp).dport(DNS_PORT)
        } else {
            Rule::new(action).protocol(Protocol::Udp).dport(DNS_PORT)
        };
        chain.insert(dns);

        chain.hook(FORWARD_HOOK)
    }

    fn append_exceptions(&self, chain: &mut ChainBuilder) {
        for net in self.policy.intranet.ranges(self.family) {
            chain.append(Rule::returning().destination(*net));
        }
        for net in self.policy.bypass_for(self.family) {
            chain.append(Rule::returning().destination(*net));
        }
    }

    fn mark_all(chain: &mut ChainBuilder, mark: &Action) {
        for proto in Protocol::BOTH {
            chain.append(Rule::new(mark.clone()).protocol(proto));
        }
    }

    fn resolve(&self, packages: &[String]) -> Vec<u32> {
        packages
            .iter()
            .flat_map(|pkg| {
                let uids = self.uids.resolve(pkg);
                if uids.is_empty() {
                    log::warn!("Package {} resolved to no UID, skipping", pkg);
                }
                uids
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use shunt_net::{ControlPlane, Matcher, MockControlPlane};

    use super::*;
    use crate::config::Config;
    use crate::intranet::{IntranetTable, BUILTIN_V4, BUILTIN_V6};
    use crate::strategy::{TPROXY_MARK, TUN_MARK};

    const V4: AddressFamily = AddressFamily::V4;
    const V6: AddressFamily = AddressFamily::V6;

    fn policy(toml: &str) -> ProxyPolicy {
        Config::from_toml(toml)
            .unwrap()
            .policy(&IntranetTable::builtin())
            .unwrap()
    }

    fn resolver() -> HashMap<String, Vec<u32>> {
        let mut uids = HashMap::new();
        uids.insert("com.example.app".to_string(), vec![10050]);
        uids.insert("com.example.dual".to_string(), vec![10077, 1_010_077]);
        uids
    }

    /// Apply a family's ops to a fresh mock and return the resulting chain
    fn installed(policy: &ProxyPolicy, family: AddressFamily, chain: &str) -> Vec<Rule> {
        let uids = resolver();
        let mock = MockControlPlane::new();
        for op in AddressFamilyRuleSet::new(policy, family, &uids).build() {
            mock.firewall(&op).unwrap();
        }
        mock.state()
            .chain(family, Table::Mangle, chain)
            .unwrap()
            .to_vec()
    }

    fn is_dns(rule: &Rule) -> bool {
        rule.matchers.contains(&Matcher::DestinationPort(DNS_PORT))
    }

    fn is_catch_all_mark(rule: &Rule) -> bool {
        rule.is_marking() && rule.matchers.iter().all(|m| matches!(m, Matcher::Protocol(_)))
    }

    #[test]
    fn test_everyone_ipv4_tproxy_chain() {
        let p = policy("[proxy]\nap_interfaces = []\n");
        let rules = installed(&p, V4, "PROXY");
        let mark = Action::Mark(TPROXY_MARK);

        // dns + intranet + core gid + tcp/udp
        assert_eq!(rules.len(), 1 + BUILTIN_V4.len() + 1 + 2);
        assert_eq!(
            rules[0],
            Rule::new(mark.clone())
                .protocol(Protocol::Udp)
                .not_gid_owner(3005)
                .dport(53)
        );
        for (rule, cidr) in rules[1..].iter().zip(BUILTIN_V4) {
            assert_eq!(rule, &Rule::returning().destination(cidr.parse().unwrap()));
        }
        let tail = &rules[rules.len() - 3..];
        assert_eq!(tail[0], Rule::returning().gid_owner(3005));
        assert_eq!(tail[1], Rule::new(mark.clone()).protocol(Protocol::Tcp));
        assert_eq!(tail[2], Rule::new(mark).protocol(Protocol::Udp));
    }

    #[test]
    fn test_output_hook_is_first() {
        let p = policy("");
        let uids = resolver();
        let mock = MockControlPlane::new();
        for op in AddressFamilyRuleSet::new(&p, V4, &uids).build() {
            mock.firewall(&op).unwrap();
        }

        let state = mock.state();
        assert_eq!(
            state.chain(V4, Table::Mangle, "OUTPUT").unwrap(),
            &[Rule::jump("PROXY")]
        );
        assert_eq!(
            state.chain(V4, Table::Mangle, "PREROUTING").unwrap(),
            &[Rule::jump("XRAY")]
        );
        assert!(!state.has_chain(V6, Table::Mangle, "PROXY"));
    }

    #[test]
    fn test_whitelist_marks_only_listed_uids() {
        let p = policy("[proxy]\nmode = \"whitelist\"\npackages = [\"com.example.app\"]\n");
        let rules = installed(&p, V4, "PROXY");

        let marked: Vec<u32> = rules
            .iter()
            .filter(|r| r.is_marking() && !is_dns(r))
            .map(|r| r.uid().expect("mark rule without owner"))
            .collect();
        assert_eq!(marked, vec![10050, 10050, 0, 0, 1052, 1052]);
        assert!(!rules.iter().any(is_catch_all_mark));

        let protos: Vec<Protocol> = rules
            .iter()
            .filter(|r| r.uid() == Some(10050))
            .filter_map(Rule::proto)
            .collect();
        assert_eq!(protos, vec![Protocol::Tcp, Protocol::Udp]);
    }

    #[test]
    fn test_whitelist_always_allowed_uids_configurable() {
        let p = policy(
            "[proxy]\nmode = \"whitelist\"\npackages = [\"com.example.app\"]\nalways_allow_uids = []\n",
        );
        let rules = installed(&p, V4, "PROXY");
        assert!(rules
            .iter()
            .filter(|r| r.is_marking() && !is_dns(r))
            .all(|r| r.uid() == Some(10050)));
    }

    #[test]
    fn test_blacklist_returns_precede_catch_all() {
        let p = policy(
            "[proxy]\nmode = \"blacklist\"\npackages = [\"com.example.app\", \"com.example.dual\", \"com.example.gone\"]\n",
        );
        let rules = installed(&p, V4, "PROXY");

        let first_catch_all = rules.iter().position(is_catch_all_mark).unwrap();
        for uid in [10050, 10077, 1_010_077] {
            let pos = rules
                .iter()
                .position(|r| r.is_return() && r.uid() == Some(uid))
                .unwrap();
            assert!(pos < first_catch_all);
        }
        assert_eq!(rules.iter().filter(|r| is_catch_all_mark(r)).count(), 2);
    }

    #[test]
    fn test_ignored_interfaces_precede_mode_marks() {
        let p = policy(
            "[proxy]\nmode = \"whitelist\"\npackages = [\"com.example.app\"]\nignore_interfaces = [\"rmnet_data0\", \"wg0\"]\n",
        );
        let rules = installed(&p, V4, "PROXY");

        let first_mode_mark = rules
            .iter()
            .position(|r| r.is_marking() && r.uid().is_some())
            .unwrap();
        let ignored: Vec<usize> = rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_return() && r.matchers.iter().any(|m| matches!(m, Matcher::OutInterface(_))))
            .map(|(i, _)| i)
            .collect();

        assert_eq!(ignored.len(), 2);
        assert!(ignored.iter().all(|i| *i < first_mode_mark));
        assert_eq!(
            rules[ignored[0]],
            Rule::returning().out_interface("rmnet_data0")
        );
    }

    #[test]
    fn test_intranet_allow_inserted_at_front() {
        let p = policy("[proxy]\nintranet_allow = [\"192.168.9.0/24\", \"fd00::/8\"]\n");
        let rules = installed(&p, V4, "PROXY");
        let net: IpNet = "192.168.9.0/24".parse().unwrap();
        let mark = Action::Mark(TPROXY_MARK);

        assert!(is_dns(&rules[0]));
        assert_eq!(rules[1], Rule::new(mark.clone()).protocol(Protocol::Udp).destination(net));
        assert_eq!(rules[2], Rule::new(mark).protocol(Protocol::Tcp).destination(net));
        assert!(!rules.iter().any(|r| r.matchers.contains(&Matcher::Destination("fd00::/8".parse().unwrap()))));
    }

    #[test]
    fn test_tunnel_ipv6_chain_bypasses_device() {
        let p = policy(
            "[proxy]\nmethod = \"tun2socks\"\nenable_ipv6 = true\nbypass = [\"1.1.1.0/24\", \"2606:4700::/32\"]\n",
        );
        let rules = installed(&p, V6, "XT");
        let mark = Action::Mark(TUN_MARK);

        assert_eq!(
            rules[0],
            Rule::new(mark)
                .protocol(Protocol::Udp)
                .not_gid_owner(3005)
                .dport(53)
        );
        assert_eq!(rules[1], Rule::returning().out_interface("xtun"));
        let bypass = rules
            .iter()
            .filter(|r| r.is_return())
            .filter(|r| r.matchers.iter().any(|m| matches!(m, Matcher::Destination(_))))
            .count();
        assert_eq!(bypass, BUILTIN_V6.len() + 1);
    }

    #[test]
    fn test_tproxy_ipv6_dummy_bypass() {
        let p = policy("[proxy]\nenable_ipv6 = true\nuse_dummy = true\n");
        assert_eq!(
            installed(&p, V6, "PROXY")[1],
            Rule::returning().out_interface("xdummy")
        );

        let p = policy("[proxy]\nenable_ipv6 = true\nuse_dummy = false\n");
        assert!(!installed(&p, V6, "PROXY")
            .iter()
            .any(|r| r.matchers.contains(&Matcher::OutInterface("xdummy".into()))));
    }

    #[test]
    fn test_local_resolver_dns_is_returned() {
        let p = policy("[core]\nflavor = \"mihomo\"\n[dns]\nredirect_port = 1053\n");
        let dns = Rule::returning().protocol(Protocol::Udp).dport(53);

        assert_eq!(installed(&p, V4, "PROXY")[0], dns);
        assert_eq!(installed(&p, V4, "XRAY")[0], dns);
    }

    #[test]
    fn test_tproxy_forward_chain_layout() {
        let p = policy(
            "[proxy]\ntproxy_port = 7893\nap_interfaces = [\"wlan+\"]\nintranet_allow = [\"10.1.0.0/16\"]\n",
        );
        let rules = installed(&p, V4, "XRAY");
        let tproxy = Action::Tproxy {
            port: 7893,
            mark: TPROXY_MARK,
        };
        let net: IpNet = "10.1.0.0/16".parse().unwrap();

        assert_eq!(rules[0], Rule::new(tproxy.clone()).protocol(Protocol::Udp).dport(53));
        assert_eq!(
            rules[1],
            Rule::new(tproxy.clone())
                .protocol(Protocol::Udp)
                .in_interface("wlan+")
                .destination(net)
        );
        assert_eq!(
            rules[3],
            Rule::new(tproxy.clone())
                .protocol(Protocol::Udp)
                .destination(net)
                .has_mark(TPROXY_MARK)
        );

        let n = rules.len();
        assert_eq!(rules[n - 4], Rule::new(tproxy.clone()).protocol(Protocol::Tcp).has_mark(TPROXY_MARK));
        assert_eq!(rules[n - 3], Rule::new(tproxy.clone()).protocol(Protocol::Udp).has_mark(TPROXY_MARK));
        assert_eq!(rules[n - 2], Rule::new(tproxy.clone()).protocol(Protocol::Tcp).in_interface("wlan+"));
        assert_eq!(rules[n - 1], Rule::new(tproxy).protocol(Protocol::Udp).in_interface("wlan+"));
    }

    #[test]
    fn test_tunnel_forward_chain_has_no_marked_catch_all() {
        let p = policy("[proxy]\nmethod = \"tun2socks\"\nap_interfaces = [\"ap0\"]\n");
        let rules = installed(&p, V4, "TUN2SOCKS");

        assert!(!rules
            .iter()
            .any(|r| r.matchers.iter().any(|m| matches!(m, Matcher::HasMark(_)))));
        assert_eq!(
            rules.last().unwrap(),
            &Rule::new(Action::Mark(TUN_MARK))
                .protocol(Protocol::Udp)
                .in_interface("ap0")
        );
    }

    #[test]
    fn test_teardown_restores_baseline() {
        let p = policy("[proxy]\nenable_ipv6 = true\n");
        let uids = resolver();
        let mock = MockControlPlane::new();
        let before = mock.state();

        for family in AddressFamily::ALL {
            let rules = AddressFamilyRuleSet::new(&p, family, &uids);
            for op in rules.build() {
                mock.firewall(&op).unwrap();
            }
        }
        for family in AddressFamily::ALL {
            for op in AddressFamilyRuleSet::new(&p, family, &uids).teardown() {
                mock.firewall(&op).unwrap();
            }
        }

        assert_eq!(mock.state(), before);
    }
}
