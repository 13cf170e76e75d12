//! Session controller
//!
//! Sequences the strategy's setup steps and owns the rollback decision.
//! Every step registers its undo before it runs, so a step that fails
//! halfway is undone too. A failed enable unwinds the registered undos in
//! reverse order and leaves the session disabled; from the caller's view
//! enabling is all-or-nothing.
//!
//! Disabling runs every teardown step of both families whether or not the
//! session installed it. It also cleans up after a crashed session, and it
//! never fails.

use std::sync::Arc;

use tokio::sync::RwLock;

use shunt_net::{AddressFamily, ControlPlane, ForwardingControl};

use crate::applier::RuleApplier;
use crate::dns::DnsRedirector;
use crate::error::{Error, Result};
use crate::event::{EventHandler, LoggingEventHandler, SessionEvent, SessionState};
use crate::packages::UidResolver;
use crate::policy::ProxyPolicy;
use crate::routing::PolicyRoutingManager;
use crate::ruleset::AddressFamilyRuleSet;
use crate::supervisor::ProcessSupervisor;

/// A reversible setup step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Helper,
    Routing(AddressFamily),
    Chains(AddressFamily),
    Dns,
    Forwarding,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Helper => write!(f, "helper"),
            Step::Routing(family) => write!(f, "routing {}", family),
            Step::Chains(family) => write!(f, "chains {}", family),
            Step::Dns => write!(f, "dns"),
            Step::Forwarding => write!(f, "forwarding"),
        }
    }
}

/// Enables and disables one interception session
pub struct SessionController {
    policy: ProxyPolicy,
    plane: Arc<dyn ControlPlane>,
    uids: Arc<dyn UidResolver>,
    dns: Arc<dyn DnsRedirector>,
    forwarding: Arc<dyn ForwardingControl>,
    supervisor: Option<ProcessSupervisor>,
    event_handler: Arc<dyn EventHandler>,
    state: RwLock<SessionState>,
}

impl SessionController {
    pub fn new(
        policy: ProxyPolicy,
        plane: Arc<dyn ControlPlane>,
        uids: Arc<dyn UidResolver>,
        dns: Arc<dyn DnsRedirector>,
        forwarding: Arc<dyn ForwardingControl>,
    ) -> Self {
        Self {
            policy,
            plane,
            uids,
            dns,
            forwarding,
            supervisor: None,
            event_handler: Arc::new(LoggingEventHandler),
            state: RwLock::new(SessionState::Disabled),
        }
    }

    /// Set the tunnel helper supervisor, required by the tunnel strategy
    pub fn with_supervisor(mut self, supervisor: ProcessSupervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Set a custom event handler
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    pub fn policy(&self) -> &ProxyPolicy {
        &self.policy
    }

    /// Get the current state
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Install the session
    ///
    /// Fails without touching the kernel unless the session is disabled.
    /// Any failure after that rolls back every step attempted so far.
    pub async fn enable(&self) -> Result<()> {
        // Check and claim under one guard so concurrent calls cannot both pass
        {
            let mut state = self.state.write().await;
            if state.is_active() {
                return Err(Error::InvalidState(format!(
                    "cannot enable a session that is {}",
                    state.description().to_lowercase()
                )));
            }
            if self.policy.interception.tunnel_device().is_some() && self.supervisor.is_none() {
                return Err(Error::Config(
                    "tun2socks requires a tunnel helper supervisor".into(),
                ));
            }
            *state = SessionState::Enabling;
        }

        log::info!(
            "Enabling {} interception, mode {}",
            self.policy.interception.name(),
            self.policy.mode.name()
        );
        self.emit_event(SessionEvent::StateChanged {
            old: SessionState::Disabled,
            new: SessionState::Enabling,
        })
        .await;

        let mut undo = Vec::new();
        match self.run_enable(&mut undo).await {
            Ok(()) => {
                self.set_state(SessionState::Enabled).await;
                Ok(())
            }
            Err(e) => {
                self.emit_event(SessionEvent::Error {
                    message: e.to_string(),
                })
                .await;

                let mut steps = Vec::with_capacity(undo.len());
                while let Some(step) = undo.pop() {
                    self.undo(step).await;
                    steps.push(step.to_string());
                }
                self.emit_event(SessionEvent::RolledBack {
                    steps,
                    reason: e.to_string(),
                })
                .await;

                self.set_state(SessionState::Disabled).await;
                Err(e)
            }
        }
    }

    /// Tear down everything a session of this policy may have installed
    ///
    /// Runs from any state and leaves the session disabled. Failures are
    /// logged at debug level only.
    pub async fn disable(&self) {
        log::info!("Disabling {} interception", self.policy.interception.name());
        self.set_state(SessionState::Disabling).await;

        for step in Self::full_teardown().into_iter().rev() {
            self.undo(step).await;
        }

        self.set_state(SessionState::Disabled).await;
    }

    /// Render what enabling would apply, without touching the kernel
    pub fn plan(&self) -> Vec<String> {
        let mut lines = Vec::new();

        if let (Some(device), Some(supervisor)) =
            (self.policy.interception.tunnel_device(), &self.supervisor)
        {
            let config = supervisor.config();
            lines.push(format!(
                "# start {} {} and wait for {}",
                config.helper_path.display(),
                config.config_path().display(),
                device
            ));
        }

        let routing = PolicyRoutingManager::new(&self.policy);
        for family in self.policy.families() {
            lines.push(format!("# {} routing", family));
            lines.extend(routing.attach_ops(family).iter().map(ToString::to_string));

            lines.push(format!("# {} chains", family));
            let rules = AddressFamilyRuleSet::new(&self.policy, family, self.uids.as_ref());
            lines.extend(rules.build().iter().map(ToString::to_string));
        }

        if let Some(port) = self.policy.dns_redirect() {
            lines.push(format!("# redirect udp/53 to local port {}", port));
        } else if self.policy.blocks_ipv6_dns() {
            lines.push("# reject system IPv6 DNS".to_string());
        }

        if let Some(device) = self.policy.interception.tunnel_device() {
            lines.push(format!("# enable forwarding on {}", device));
        }

        lines
    }

    async fn run_enable(&self, undo: &mut Vec<Step>) -> Result<()> {
        let applier = RuleApplier::new(self.plane.as_ref());
        let routing = PolicyRoutingManager::new(&self.policy);
        let tunnel_device = self.policy.interception.tunnel_device();

        if let (Some(device), Some(supervisor)) = (tunnel_device, &self.supervisor) {
            undo.push(Step::Helper);
            let pid = supervisor.start().await?;
            self.emit_event(SessionEvent::HelperStarted {
                pid,
                device: device.to_string(),
            })
            .await;
        }

        for family in self.policy.families() {
            undo.push(Step::Routing(family));
            routing.attach(&applier, family)?;
            self.emit_event(SessionEvent::RoutingAttached {
                family,
                table: self.policy.interception.table(),
            })
            .await;

            let ops = AddressFamilyRuleSet::new(&self.policy, family, self.uids.as_ref()).build();
            undo.push(Step::Chains(family));
            applier.install_firewall(&ops)?;
            self.emit_event(SessionEvent::ChainsInstalled {
                family,
                ops: ops.len(),
            })
            .await;
        }

        undo.push(Step::Dns);
        if let Some(port) = self.policy.dns_redirect() {
            self.dns.redirect(port)?;
            self.emit_event(SessionEvent::DnsAdjusted {
                redirect_port: Some(port),
            })
            .await;
        } else if self.policy.blocks_ipv6_dns() {
            self.dns.disable_system_ipv6_dns()?;
            self.emit_event(SessionEvent::DnsAdjusted {
                redirect_port: None,
            })
            .await;
        }

        if let Some(device) = tunnel_device {
            undo.push(Step::Forwarding);
            for family in self.policy.families() {
                self.forwarding
                    .set_forwarding(family, device, true)
                    .map_err(|source| Error::Forwarding {
                        device: device.to_string(),
                        source,
                    })?;
            }
            self.emit_event(SessionEvent::ForwardingEnabled {
                device: device.to_string(),
            })
            .await;
        }

        Ok(())
    }

    /// Every step a session can register, in setup order
    fn full_teardown() -> Vec<Step> {
        let mut steps = vec![Step::Helper];
        for family in AddressFamily::ALL {
            steps.push(Step::Routing(family));
            steps.push(Step::Chains(family));
        }
        steps.push(Step::Dns);
        steps.push(Step::Forwarding);
        steps
    }

    async fn undo(&self, step: Step) {
        log::debug!("undo: {}", step);
        let applier = RuleApplier::new(self.plane.as_ref());

        match step {
            Step::Helper => {
                if let Some(supervisor) = &self.supervisor {
                    supervisor.stop().await;
                }
            }
            Step::Routing(family) => {
                PolicyRoutingManager::new(&self.policy).detach(&applier, family);
            }
            Step::Chains(family) => {
                let rules = AddressFamilyRuleSet::new(&self.policy, family, self.uids.as_ref());
                applier.remove_firewall(&rules.teardown());
            }
            Step::Dns => {
                if let Some(port) = self.policy.dns_redirect_port {
                    self.dns.clean(port);
                }
                self.dns.enable_system_ipv6_dns();
            }
            Step::Forwarding => {
                if let Some(device) = self.policy.interception.tunnel_device() {
                    for family in AddressFamily::ALL {
                        if let Err(e) = self.forwarding.set_forwarding(family, device, false) {
                            log::debug!("disable {} forwarding on {}: {}", family, device, e);
                        }
                    }
                }
            }
        }
    }

    /// Update state and emit event
    async fn set_state(&self, new_state: SessionState) {
        let old_state = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, new_state)
        };

        if old_state != new_state {
            self.emit_event(SessionEvent::StateChanged {
                old: old_state,
                new: new_state,
            })
            .await;
        }
    }

    async fn emit_event(&self, event: SessionEvent) {
        self.event_handler.on_event(event).await;
    }
}
