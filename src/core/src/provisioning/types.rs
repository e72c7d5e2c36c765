use secrecy::{ExposeSecret, SecretString};
use serde::{Serialize, Serializer};

use crate::configuration::types::PortRange;
use crate::configuration::Config;
use crate::container_management::OrchestratorStats;
use crate::storage::VpsInstance;

/// Policy knobs for [`ProvisioningCoordinator`](super::ProvisioningCoordinator).
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub host_ip: String,
    pub ssh_username: String,
    pub password_length: usize,
    pub password_hash_cost: u32,
    pub max_allocation_attempts: u32,
    pub max_ram_mb: u32,
}

impl From<&Config> for CoordinatorSettings {
    fn from(config: &Config) -> Self {
        Self {
            host_ip: config.host.public_ip.clone(),
            ssh_username: config.provisioning.ssh_username.clone(),
            password_length: config.provisioning.password_length,
            password_hash_cost: config.provisioning.password_hash_cost,
            max_allocation_attempts: config.provisioning.max_allocation_attempts,
            max_ram_mb: config.provisioning.max_ram_mb,
        }
    }
}

/// A freshly provisioned instance. This is the only place the plaintext
/// password ever appears; the ledger keeps just its hash.
#[derive(Debug, Serialize)]
pub struct ProvisionedVps {
    #[serde(flatten)]
    pub instance: VpsInstance,
    pub username: String,
    #[serde(serialize_with = "expose_once")]
    pub password: SecretString,
    pub ssh_command: String,
}

impl ProvisionedVps {
    pub fn new(instance: VpsInstance, username: String, password: SecretString) -> Self {
        let ssh_command = format!(
            "ssh {}@{} -p {}",
            username, instance.ip, instance.ssh_port
        );
        Self {
            instance,
            username,
            password,
            ssh_command,
        }
    }
}

fn expose_once<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

/// Snapshot of the engine for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineInfo {
    pub name: String,
    pub version: String,
    pub host_ip: String,
    pub port_range: PortRange,
    pub active_instances: u64,
    pub free_ports: usize,
    pub in_flight: usize,
    pub orchestrator: OrchestratorStats,
}
