//! Tunnel helper process supervision
//!
//! The user-space tunnel strategy depends on an external helper that
//! creates the tunnel device and relays its packets to the core's SOCKS5
//! inbound. The supervisor writes the helper's YAML config, launches it
//! with output captured in a log file, and waits for the device to appear.
//! A helper whose device never shows up is killed, so a failed start
//! leaves no process behind.
//!
//! The PID is persisted so a later invocation can stop the helper.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use shunt_net::LinkProbe;
use tokio::process::{Child, Command};

use crate::error::{Error, Result};
use crate::limiter::ProcessLimiter;

pub const TUNNEL_MTU: u32 = 8500;
pub const TUNNEL_MULTI_QUEUE: bool = false;
pub const TUNNEL_IPV4: &str = "10.10.12.1";
pub const TUNNEL_IPV6: &str = "fd02:5ca1:ab1e:8d97:497f:8b48:b9aa:85cd";
pub const SOCKS_ADDRESS: &str = "127.0.0.1";
pub const SOCKS_UDP_MODE: &str = "udp";

pub const CONFIG_FILE: &str = "tun2socks.yml";
pub const LOG_FILE: &str = "tun2socks.log";
pub const PID_FILE: &str = "tun2socks.pid";

/// Helper configuration document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelConfig {
    pub tunnel: TunnelSection,
    pub socks5: Socks5Section,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelSection {
    pub name: String,
    pub mtu: u32,
    #[serde(rename = "multi-queue")]
    pub multi_queue: bool,
    pub ipv4: String,
    pub ipv6: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Socks5Section {
    pub port: u16,
    pub address: String,
    #[serde(rename = "udp")]
    pub udp_mode: String,
}

impl TunnelConfig {
    pub fn new(device: &str, socks_port: u16) -> Self {
        Self {
            tunnel: TunnelSection {
                name: device.to_string(),
                mtu: TUNNEL_MTU,
                multi_queue: TUNNEL_MULTI_QUEUE,
                ipv4: TUNNEL_IPV4.to_string(),
                ipv6: TUNNEL_IPV6.to_string(),
            },
            socks5: Socks5Section {
                port: socks_port,
                address: SOCKS_ADDRESS.to_string(),
                udp_mode: SOCKS_UDP_MODE.to_string(),
            },
        }
    }
}

/// Where and how the helper runs
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub helper_path: PathBuf,
    /// Holds the config, log and pid files
    pub run_dir: PathBuf,
    pub device: String,
    pub socks_port: u16,
    /// How long to wait for the device
    pub start_timeout: Duration,
    pub poll_interval: Duration,
}

impl SupervisorConfig {
    pub fn new(
        helper_path: impl Into<PathBuf>,
        run_dir: impl Into<PathBuf>,
        device: impl Into<String>,
        socks_port: u16,
    ) -> Self {
        Self {
            helper_path: helper_path.into(),
            run_dir: run_dir.into(),
            device: device.into(),
            socks_port,
            start_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn config_path(&self) -> PathBuf {
        self.run_dir.join(CONFIG_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.run_dir.join(LOG_FILE)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.run_dir.join(PID_FILE)
    }
}

/// Starts and stops the tunnel helper
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    probe: Arc<dyn LinkProbe>,
    limiter: Arc<dyn ProcessLimiter>,
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        probe: Arc<dyn LinkProbe>,
        limiter: Arc<dyn ProcessLimiter>,
    ) -> Self {
        Self {
            config,
            probe,
            limiter,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launch the helper and wait for its device
    ///
    /// Returns the helper's PID once the device exists, the process is
    /// limited and the PID file is written. On any failure the helper is
    /// killed and reaped before the error is returned.
    pub async fn start(&self) -> Result<u32> {
        let config = &self.config;
        let log_file = config.log_path();
        let fail = |message: String| Error::ProcessStart {
            message,
            log_file: log_file.clone(),
        };

        tokio::fs::create_dir_all(&config.run_dir).await?;
        let document = serde_yaml::to_string(&TunnelConfig::new(&config.device, config.socks_port))?;
        tokio::fs::write(config.config_path(), document).await?;

        let stdout = std::fs::File::create(&log_file)?;
        let stderr = stdout.try_clone()?;

        let mut child = Command::new(&config.helper_path)
            .arg(config.config_path())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| {
                fail(format!(
                    "failed to launch {}: {}",
                    config.helper_path.display(),
                    e
                ))
            })?;

        let Some(pid) = child.id() else {
            return Err(fail("tunnel helper exited immediately".into()));
        };
        log::info!(
            "Started tunnel helper {} (pid {})",
            config.helper_path.display(),
            pid
        );

        if let Err(message) = self.wait_for_device(&mut child).await {
            Self::terminate(&mut child).await;
            return Err(fail(message));
        }

        if let Err(e) = self.limiter.limit(pid) {
            Self::terminate(&mut child).await;
            return Err(fail(format!("failed to limit tunnel helper: {}", e)));
        }

        if let Err(e) = tokio::fs::write(config.pid_path(), pid.to_string()).await {
            Self::terminate(&mut child).await;
            return Err(fail(format!("failed to write pid file: {}", e)));
        }

        log::info!("Tunnel device {} is up", config.device);
        Ok(pid)
    }

    /// Kill the helper recorded in the PID file and remove generated files
    ///
    /// Never fails; problems are logged at debug level.
    pub async fn stop(&self) {
        let pid_path = self.config.pid_path();

        match tokio::fs::read_to_string(&pid_path).await {
            Ok(content) => {
                match content.trim().parse::<i32>() {
                    Ok(pid) if pid > 0 => match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                        Ok(()) => log::info!("Stopped tunnel helper (pid {})", pid),
                        Err(e) => log::debug!("kill tunnel helper {}: {}", pid, e),
                    },
                    _ => log::debug!("invalid pid file content {:?}", content),
                }
                if let Err(e) = tokio::fs::remove_file(&pid_path).await {
                    log::debug!("remove {}: {}", pid_path.display(), e);
                }
            }
            Err(e) => log::debug!("read {}: {}", pid_path.display(), e),
        }

        let config_path = self.config.config_path();
        if let Err(e) = tokio::fs::remove_file(&config_path).await {
            log::debug!("remove {}: {}", config_path.display(), e);
        }
    }

    async fn wait_for_device(&self, child: &mut Child) -> std::result::Result<(), String> {
        let device = self.config.device.as_str();

        let poll = async {
            loop {
                if self.probe.exists(device) {
                    return Ok(());
                }
                match child.try_wait() {
                    Ok(Some(status)) => {
                        return Err(format!(
                            "tunnel helper exited with {} before {} appeared",
                            status, device
                        ))
                    }
                    Ok(None) => {}
                    Err(e) => return Err(format!("failed to poll tunnel helper: {}", e)),
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };

        match tokio::time::timeout(self.config.start_timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "tunnel device {} did not appear within {:?}",
                device, self.config.start_timeout
            )),
        }
    }

    async fn terminate(child: &mut Child) {
        if let Err(e) = child.kill().await {
            log::debug!("kill tunnel helper: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use super::*;
    use crate::limiter::CgroupLimiter;

    /// Device probe that looks for a marker file named after the device
    pub(crate) struct MarkerProbe(pub PathBuf);

    impl LinkProbe for MarkerProbe {
        fn exists(&self, name: &str) -> bool {
            self.0.join(name).exists()
        }
    }

    pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Running and not a zombie
    pub(crate) fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    pub(crate) async fn wait_gone(pid: u32) -> bool {
        for _ in 0..50 {
            if !is_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    fn supervisor(dir: &Path, helper: PathBuf, timeout: Duration) -> ProcessSupervisor {
        let config = SupervisorConfig::new(helper, dir.join("run"), "xtun", 65534)
            .with_start_timeout(timeout)
            .with_poll_interval(Duration::from_millis(20));
        ProcessSupervisor::new(
            config,
            Arc::new(MarkerProbe(dir.to_path_buf())),
            Arc::new(CgroupLimiter::default()),
        )
    }

    #[test]
    fn test_tunnel_config_document() {
        let yaml = serde_yaml::to_string(&TunnelConfig::new("xtun", 65534)).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(doc["tunnel"]["name"].as_str(), Some("xtun"));
        assert_eq!(doc["tunnel"]["mtu"].as_u64(), Some(8500));
        assert_eq!(doc["tunnel"]["multi-queue"].as_bool(), Some(false));
        assert_eq!(doc["tunnel"]["ipv4"].as_str(), Some("10.10.12.1"));
        assert_eq!(doc["socks5"]["port"].as_u64(), Some(65534));
        assert_eq!(doc["socks5"]["address"].as_str(), Some("127.0.0.1"));
        assert_eq!(doc["socks5"]["udp"].as_str(), Some("udp"));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let helper = write_script(
            dir.path(),
            "helper.sh",
            &format!("touch '{}/xtun'\nexec sleep 30", dir.path().display()),
        );
        let supervisor = supervisor(dir.path(), helper, Duration::from_secs(5));

        let pid = supervisor.start().await.unwrap();
        let config = supervisor.config();
        assert_eq!(
            std::fs::read_to_string(config.pid_path()).unwrap(),
            pid.to_string()
        );
        assert!(std::fs::read_to_string(config.config_path())
            .unwrap()
            .contains("name: xtun"));
        assert!(is_running(pid));

        supervisor.stop().await;
        assert!(!config.pid_path().exists());
        assert!(!config.config_path().exists());
        assert!(wait_gone(pid).await);
    }

    #[tokio::test]
    async fn test_timeout_kills_helper() {
        let dir = tempfile::tempdir().unwrap();
        let helper = write_script(
            dir.path(),
            "helper.sh",
            &format!("echo $$ > '{}/started'\nexec sleep 30", dir.path().display()),
        );
        let supervisor = supervisor(dir.path(), helper, Duration::from_millis(500));

        let err = supervisor.start().await.unwrap_err();
        match &err {
            Error::ProcessStart { message, log_file } => {
                assert!(message.contains("did not appear"));
                assert_eq!(log_file, &supervisor.config().log_path());
            }
            other => panic!("unexpected error: {other}"),
        }

        let pid: u32 = std::fs::read_to_string(dir.path().join("started"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!is_running(pid));
        assert!(!supervisor.config().pid_path().exists());
    }

    #[tokio::test]
    async fn test_early_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let helper = write_script(dir.path(), "helper.sh", "echo boom >&2\nexit 3");
        let supervisor = supervisor(dir.path(), helper, Duration::from_secs(5));

        let err = supervisor.start().await.unwrap_err();
        assert!(err.to_string().contains("exited"));

        let log = std::fs::read_to_string(supervisor.config().log_path()).unwrap();
        assert_eq!(log.trim(), "boom");
    }

    #[tokio::test]
    async fn test_missing_helper() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(
            dir.path(),
            dir.path().join("absent"),
            Duration::from_secs(1),
        );
        assert!(supervisor.start().await.unwrap_err().is_process_start());
    }

    #[tokio::test]
    async fn test_stop_without_helper_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path(), dir.path().join("absent"), Duration::from_secs(1));
        supervisor.stop().await;
        assert!(!supervisor.config().pid_path().exists());
    }
}
