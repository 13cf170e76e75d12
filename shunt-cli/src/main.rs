//! Shunt CLI
//!
//! A command-line interface for the shunt transparent routing engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shunt_engine::{
    AppMode, CgroupLimiter, Config, IntranetTable, NetfilterDns, PackagesList, ProcessSupervisor,
    ProxyMethod, SessionController,
};
use shunt_net::{CommandControlPlane, ControlPlane, SysLinkProbe, SysctlForwarding};

/// Shunt - policy-based transparent proxy routing
#[derive(Parser)]
#[command(name = "shunt")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "shunt.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install interception; rolls back on failure
    Enable,

    /// Remove all interception state
    Disable,

    /// Print the ops `enable` would apply without applying them
    Plan,

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "shunt.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Enable => enable(&cli.config).await,
        Commands::Disable => {
            disable(&cli.config).await;
            Ok(())
        }
        Commands::Plan => plan(&cli.config),
        Commands::GenConfig { output } => generate_config(output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn enable(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    info!("Configuration loaded from {:?}", config_path);

    let controller = build_controller(&config)?;
    controller
        .enable()
        .await
        .context("Failed to enable interception")?;

    info!("Interception enabled");
    Ok(())
}

async fn disable(config_path: &Path) {
    let controller = match load_config(config_path).and_then(|config| build_controller(&config)) {
        Ok(controller) => controller,
        Err(e) => {
            error!("Nothing to disable: {:#}", e);
            return;
        }
    };

    controller.disable().await;
    info!("Interception disabled");
}

fn plan(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let controller = build_controller(&config)?;

    for line in controller.plan() {
        println!("{}", line);
    }
    Ok(())
}

fn build_controller(config: &Config) -> Result<SessionController> {
    let mut intranet = IntranetTable::discover();
    if let Err(e) = intranet.refresh_access_points(&config.proxy.ap_interfaces) {
        warn!("Failed to read access point subnets: {}", e);
    }

    let policy = config
        .policy(&intranet)
        .context("Failed to derive proxy policy")?;

    let packages = match PackagesList::load(&config.core.packages_list) {
        Ok(packages) => packages,
        Err(e) => {
            if policy.mode != AppMode::Everyone {
                warn!(
                    "Failed to read {:?}, no package will match: {}",
                    config.core.packages_list, e
                );
            }
            PackagesList::default()
        }
    };

    let plane: Arc<dyn ControlPlane> = Arc::new(CommandControlPlane::new());
    let dns = Arc::new(NetfilterDns::new(plane.clone(), config.core.gid));
    let controller = SessionController::new(
        policy,
        plane,
        Arc::new(packages),
        dns,
        Arc::new(SysctlForwarding::new()),
    );

    if config.proxy.method != ProxyMethod::Tun2socks {
        return Ok(controller);
    }

    let supervisor = ProcessSupervisor::new(
        config.supervisor(),
        Arc::new(SysLinkProbe),
        Arc::new(CgroupLimiter::new(config.core.cgroup.as_deref())),
    );
    Ok(controller.with_supervisor(supervisor))
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))
}

fn generate_config(output: PathBuf) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nReview [proxy] and [core] before running `shunt enable`.");

    Ok(())
}
