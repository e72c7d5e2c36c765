use chrono::{DateTime, Utc};
use serde::Serialize;

/// A VPS instance as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VpsInstance {
    /// Surrogate id assigned by the ledger.
    pub id: i64,
    pub owner_id: u64,
    /// Hypervisor-side unit name.
    pub name: String,
    /// Shared host address the instance is reached through.
    pub ip: String,
    pub ram_mb: u32,
    pub ssh_port: u16,
    /// bcrypt hash of the login password; never serialized.
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decommissioned_at: Option<DateTime<Utc>>,
}

impl VpsInstance {
    pub fn is_active(&self) -> bool {
        self.decommissioned_at.is_none()
    }
}

/// Everything the ledger needs to record a freshly provisioned instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVpsInstance {
    pub owner_id: u64,
    pub name: String,
    pub ip: String,
    pub ram_mb: u32,
    pub ssh_port: u16,
    pub password_hash: String,
}

/// A port and unit name held by a provisioning attempt that is not recorded
/// yet. Claims live in the ledger, so every process sharing it sees them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortClaim {
    pub ssh_port: u16,
    pub name: String,
    pub claimed_at: DateTime<Utc>,
    /// The unit behind the claim could not be torn down; the claim then
    /// never expires.
    pub quarantined: bool,
}
