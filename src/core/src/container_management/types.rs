//! Core types used by the container management subsystem.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use std::fmt;
use std::time::Duration;

/// One stage of bringing a compute unit up, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    Create,
    Start,
    Bootstrap,
    Expose,
    /// A compensation run while unwinding a failed bring-up, or a decommission.
    Teardown,
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisionStep::Create => "create",
            ProvisionStep::Start => "start",
            ProvisionStep::Bootstrap => "bootstrap",
            ProvisionStep::Expose => "expose",
            ProvisionStep::Teardown => "teardown",
        };
        f.write_str(s)
    }
}

/// What the hypervisor needs to create a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub name: String,
    pub image: String,
    pub ram_mb: u32,
    pub cpu_limit: u32,
}

/// Host-port to unit-port forwarding rule attached to a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDevice {
    /// Device name on the unit, e.g. `proxy-ssh-2222`.
    pub name: String,
    pub listen_ip: String,
    pub listen_port: u16,
    pub connect_port: u16,
}

impl ProxyDevice {
    pub fn ssh(listen_ip: &str, listen_port: u16) -> Self {
        Self {
            name: format!("proxy-ssh-{}", listen_port),
            listen_ip: listen_ip.to_string(),
            listen_port,
            connect_port: 22,
        }
    }
}

/// Input to [`ContainerOrchestrator::provision`](super::ContainerOrchestrator::provision).
#[derive(Debug)]
pub struct ProvisionRequest {
    pub name: String,
    pub ram_mb: u32,
    pub ssh_port: u16,
    pub password: SecretString,
}

/// A unit that reached running + configured state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub name: String,
    pub ssh_port: u16,
    pub proxy_device: String,
    pub created_at: DateTime<Utc>,
}

/// Reversal of one completed provisioning step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    DeleteUnit(String),
    StopUnit(String),
    RemoveDevice { unit: String, device: String },
}

impl Compensation {
    /// The unit this compensation acts on.
    pub fn unit(&self) -> &str {
        match self {
            Compensation::DeleteUnit(unit) | Compensation::StopUnit(unit) => unit,
            Compensation::RemoveDevice { unit, .. } => unit,
        }
    }
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compensation::DeleteUnit(unit) => write!(f, "delete unit {}", unit),
            Compensation::StopUnit(unit) => write!(f, "stop unit {}", unit),
            Compensation::RemoveDevice { unit, device } => {
                write!(f, "remove device {} from {}", device, unit)
            }
        }
    }
}

/// Knobs the orchestrator applies to every unit it builds.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub base_image: String,
    pub cpu_limit: u32,
    pub host_ip: String,
    pub ssh_username: String,
    pub step_timeout: Duration,
    pub bootstrap_timeout: Duration,
}

/// A compensation that could not be carried out while unwinding.
#[derive(Debug)]
pub struct TeardownFailure {
    pub action: Compensation,
    pub cause: crate::error_handling::types::HypervisorError,
}

impl TeardownFailure {
    /// A failed delete may leave the whole unit, and its port, on the host.
    /// Other failed compensations are cleaned up by a later delete.
    pub fn leaves_unit(&self) -> bool {
        matches!(self.action, Compensation::DeleteUnit(_))
    }
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.action, self.cause)
    }
}

/// Aggregate counters describing what the orchestrator has done since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct OrchestratorStats {
    /// Units that reached running + configured state.
    pub provisioned: u64,
    /// Bring-ups aborted at some step.
    pub failed: u64,
    /// Units removed by decommissioning.
    pub destroyed: u64,
    /// Units left behind because a compensation failed.
    pub orphaned: u64,
}
