//! Provisioning subsystem.
//!
//! [`ProvisioningCoordinator`] ties allocation, secrets, the orchestrator and
//! the ledger into one "create VPS" operation and owns what happens when any
//! part of it fails.

pub mod coordinator;
pub mod types;

pub use coordinator::ProvisioningCoordinator;
pub use types::{CoordinatorSettings, EngineInfo, ProvisionedVps};
