//! Process resource limiting

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Places a started helper under resource limits
pub trait ProcessLimiter: Send + Sync {
    fn limit(&self, pid: u32) -> Result<()>;
}

/// Moves processes into a cgroup by writing `cgroup.procs`
#[derive(Debug, Clone, Default)]
pub struct CgroupLimiter {
    cgroup: Option<PathBuf>,
}

impl CgroupLimiter {
    /// Limit into `cgroup`, or do nothing when no cgroup is configured
    pub fn new(cgroup: Option<&Path>) -> Self {
        Self {
            cgroup: cgroup.map(Path::to_path_buf),
        }
    }
}

impl ProcessLimiter for CgroupLimiter {
    fn limit(&self, pid: u32) -> Result<()> {
        let Some(cgroup) = &self.cgroup else {
            return Ok(());
        };

        std::fs::write(cgroup.join("cgroup.procs"), pid.to_string())?;
        log::info!("Moved pid {} into cgroup {}", pid, cgroup.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_is_noop() {
        assert!(CgroupLimiter::default().limit(1234).is_ok());
    }

    #[test]
    fn test_writes_cgroup_procs() {
        let dir = tempfile::tempdir().unwrap();
        CgroupLimiter::new(Some(dir.path())).limit(4321).unwrap();

        let procs = std::fs::read_to_string(dir.path().join("cgroup.procs")).unwrap();
        assert_eq!(procs, "4321");
    }

    #[test]
    fn test_missing_cgroup_fails() {
        let limiter = CgroupLimiter::new(Some(Path::new("/nonexistent/shunt-cgroup")));
        assert!(limiter.limit(1).is_err());
    }
}
