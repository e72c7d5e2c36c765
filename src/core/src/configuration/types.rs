use serde::{Deserialize, Serialize};

/// Half-open range of host ports `[start, end)` handed out for SSH forwarding.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
pub struct PortRange {
    #[serde(default = "default_port_start")]
    pub start: u16,
    #[serde(default = "default_port_end")]
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        usize::from(self.end.saturating_sub(self.start))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port < self.end
    }

    pub fn iter(&self) -> std::ops::Range<u16> {
        self.start..self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
        }
    }
}

fn default_port_start() -> u16 {
    2222
}

fn default_port_end() -> u16 {
    3000
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct HostConfig {
    /// The shared host's external address, used for proxy listen and
    /// returned to callers.
    pub public_ip: String,
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    pub lxc_binary: String,
    /// Optional LXD remote; unit names are addressed as `remote:name`.
    pub remote: Option<String>,
    pub base_image: String,
    pub cpu_limit: u32,
    pub step_timeout_secs: u64,
    pub bootstrap_timeout_secs: u64,
    pub name_prefix: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            lxc_binary: "lxc".to_string(),
            remote: None,
            base_image: "ubuntu/20.04".to_string(),
            cpu_limit: 1,
            step_timeout_secs: 120,
            bootstrap_timeout_secs: 900,
            name_prefix: "vps".to_string(),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub database_path: String,
    pub max_connections: u32,
    /// Seconds after which a port claim left by a crashed process may be
    /// taken over. Quarantined claims never expire.
    pub claim_ttl_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_path: crate::storage::DatabaseLedger::DEFAULT_DB_FILE.to_string(),
            max_connections: 4,
            claim_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub password_length: usize,
    pub password_hash_cost: u32,
    pub max_allocation_attempts: u32,
    pub max_ram_mb: u32,
    pub ssh_username: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            password_length: 16,
            password_hash_cost: bcrypt::DEFAULT_COST,
            max_allocation_attempts: 3,
            max_ram_mb: 8192,
            ssh_username: "vpsuser".to_string(),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Principals allowed to list every instance and decommission any of them.
    pub admin_ids: Vec<u64>,
}
