use log::{error, info, warn};
use std::path::PathBuf;
use vpsforge::configuration::Config;
use vpsforge::controller::Controller;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("Starting provisioning demo");

    // Config path from the first argument, then VPSFORGE_CONFIG
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VPSFORGE_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("vpsforge.toml"));
    let config = Config::from_file(&path)?;
    let owner = config.access.admin_ids.first().copied().unwrap_or(1);

    let controller = match Controller::from_config(&config).await {
        Ok(controller) => {
            info!("Controller ready, ledger at {}", config.ledger.database_path);
            controller
        }
        Err(e) => {
            error!("Failed to build the controller (is lxc installed and reachable?): {}", e);
            return Err(e.into());
        }
    };

    let engine = controller.info().await?;
    info!(
        "{} {} serving {} with {} free port(s)",
        engine.name, engine.version, engine.host_ip, engine.free_ports
    );

    info!("Provisioning a 512 MB VPS for owner {}...", owner);
    let vps = controller.create(owner, 512).await?;
    info!("VPS {} is up: {}", vps.instance.name, vps.ssh_command);

    for instance in controller.list_own(owner).await? {
        info!(
            "  #{} {} on port {} ({} MB)",
            instance.id, instance.name, instance.ssh_port, instance.ram_mb
        );
    }

    info!("Decommissioning VPS {}...", vps.instance.id);
    match controller.decommission(owner, vps.instance.id).await {
        Ok(released) => info!("Port {} released", released.ssh_port),
        Err(e) => warn!("VPS {} still needs cleanup: {}", vps.instance.id, e),
    }

    info!("Demo finished");
    Ok(())
}
