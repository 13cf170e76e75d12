//! Control-plane bindings
//!
//! [`ControlPlane`] is the only way the engine touches packet-filter and
//! routing state. Each op is applied synchronously and either succeeds
//! completely or reports an error; the engine owns every rollback decision.
//!
//! - [`CommandControlPlane`] shells out to `iptables`/`ip6tables` and `ip`
//! - [`mock::MockControlPlane`] simulates the kernel state in memory

pub mod mock;

use std::process::Command;

use crate::error::{Error, Result};
use crate::firewall::FirewallOp;
use crate::route::RouteOp;

/// Handle to the kernel's packet-filter and routing control surface
pub trait ControlPlane: Send + Sync {
    /// Apply one packet-filter op
    fn firewall(&self, op: &FirewallOp) -> Result<()>;

    /// Apply one routing op
    fn route(&self, op: &RouteOp) -> Result<()>;
}

const IP_PROGRAM: &str = "ip";

/// Control plane backed by the `iptables`, `ip6tables` and `ip` tools
///
/// iptables runs with `-w` so concurrent users wait for the xtables lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandControlPlane;

impl CommandControlPlane {
    pub fn new() -> Self {
        Self
    }

    fn run(program: &str, args: &[String]) -> Result<()> {
        log::debug!("exec: {} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| Error::Spawn {
                program: program.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(Error::Command {
                program: program.to_string(),
                args: args.to_vec(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

impl ControlPlane for CommandControlPlane {
    fn firewall(&self, op: &FirewallOp) -> Result<()> {
        let program = op.family().iptables();
        for invocation in op.invocations() {
            let mut args = Vec::with_capacity(invocation.len() + 1);
            args.push("-w".to_string());
            args.extend(invocation);
            Self::run(program, &args)?;
        }
        Ok(())
    }

    fn route(&self, op: &RouteOp) -> Result<()> {
        for invocation in op.invocations() {
            Self::run(IP_PROGRAM, &invocation)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_program_is_spawn_error() {
        let err = CommandControlPlane::run("/nonexistent/shunt-iptables", &["-L".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[test]
    #[cfg(unix)]
    fn test_failing_program_is_command_error() {
        let err = CommandControlPlane::run("false", &[]).unwrap_err();
        match err {
            Error::Command { program, .. } => assert_eq!(program, "false"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
