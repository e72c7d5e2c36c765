use clap::{Parser, Subcommand};
use log::{error, info};
use serde::Serialize;
use std::path::PathBuf;
use vpsforge::configuration::{Config, ConfigOverrides};
use vpsforge::controller::Controller;
use vpsforge::error_handling::types::ControllerError;

#[derive(Parser, Debug)]
#[command(name = "vpsforge")]
#[command(version)]
#[command(about = "Provisions SSH-accessible containers on a shared host and keeps their ledger")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "VPSFORGE_CONFIG", default_value = "vpsforge.toml")]
    config: PathBuf,

    /// Public address of the host, overrides [host] public_ip
    #[arg(long, env = "VPSFORGE_HOST_IP")]
    host_ip: Option<String>,

    /// SQLite ledger file, overrides [ledger] database_path
    #[arg(long, env = "VPSFORGE_DATABASE")]
    database: Option<String>,

    /// Image new units are created from, overrides [hypervisor] base_image
    #[arg(long, env = "VPSFORGE_BASE_IMAGE")]
    base_image: Option<String>,

    /// LXD remote to run against, overrides [hypervisor] remote
    #[arg(long, env = "VPSFORGE_LXC_REMOTE")]
    lxc_remote: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Provision a new VPS for an owner
    Create {
        #[arg(long)]
        owner: u64,
        #[arg(long, allow_negative_numbers = true)]
        ram_mb: i64,
    },
    /// List the active instances of an owner
    ListOwn {
        #[arg(long)]
        owner: u64,
    },
    /// List every active instance (admins only)
    ListAll {
        #[arg(long)]
        requester: u64,
    },
    /// Show engine status and capacity
    Info,
    /// Decommission an instance
    Destroy {
        #[arg(long)]
        requester: u64,
        id: i64,
    },
    /// List units on the hypervisor that no record accounts for (admins only)
    Orphans {
        #[arg(long)]
        requester: u64,
    },
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            public_ip: self.host_ip.clone(),
            database_path: self.database.clone(),
            base_image: self.base_image.clone(),
            lxc_remote: self.lxc_remote.clone(),
        }
    }
}

fn load_config(args: &Args) -> Result<Config, ControllerError> {
    let mut config = Config::from_file(&args.config)?;
    config.apply_overrides(args.overrides())?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), ControllerError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| ControllerError::InitializationFailed(format!("cannot render output: {}", e)))?;
    println!("{}", rendered);
    Ok(())
}

async fn dispatch(controller: &Controller, command: Command) -> Result<(), ControllerError> {
    match command {
        Command::Create { owner, ram_mb } => print_json(&controller.create(owner, ram_mb).await?),
        Command::ListOwn { owner } => print_json(&controller.list_own(owner).await?),
        Command::ListAll { requester } => print_json(&controller.list_all(requester).await?),
        Command::Info => print_json(&controller.info().await?),
        Command::Destroy { requester, id } => {
            print_json(&controller.decommission(requester, id).await?)
        }
        Command::Orphans { requester } => print_json(&controller.orphans(requester).await?),
    }
}

#[tokio::main]
async fn main() {
    // RUST_LOG takes precedence over the default level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_target(false)
        .init();

    let args = Args::parse();

    info!("Importing configuration");
    let config = load_config(&args).unwrap_or_else(|e| {
        error!("Unable to import configuration from {}: {}", args.config.display(), e);
        std::process::exit(1);
    });
    info!("Configuration imported successfully");

    let controller = Controller::from_config(&config).await.unwrap_or_else(|e| {
        error!("Unable to create a controller instance: {}, exiting...", e);
        std::process::exit(1);
    });

    if let Err(e) = dispatch(&controller, args.command).await {
        error!("{}", e);
        std::process::exit(2);
    }
}
