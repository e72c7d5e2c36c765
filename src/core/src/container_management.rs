//! Container management subsystem.
//!
//! Brings compute units up on the hypervisor and tears them down again. The
//! hypervisor itself sits behind the [`Hypervisor`] trait; [`LxcHypervisor`]
//! drives LXD through the `lxc` client.
//!
//! Re-exports:
//! - [`ContainerOrchestrator`]: step-by-step bring-up with compensations.
//! - [`Rollback`]: the compensation stack filled during bring-up.
//! - [`ContainerHandle`], [`ProvisionRequest`], [`ProvisionStep`]: core types.
//!
//! Example (non-running):
//! ```ignore
//! use std::sync::Arc;
//! use vpsforge::container_management::{ContainerOrchestrator, LxcHypervisor, Rollback};
//!
//! let orchestrator = ContainerOrchestrator::from_config(
//!     Arc::new(LxcHypervisor::from_config(&config.hypervisor)),
//!     &config,
//! );
//! let mut rollback = Rollback::new();
//! match orchestrator.provision(&request, &mut rollback).await {
//!     Ok(handle) => println!("{} on port {}", handle.name, handle.ssh_port),
//!     Err(e) => {
//!         orchestrator.unwind(rollback).await;
//!         eprintln!("{}", e);
//!     }
//! }
//! ```

pub mod container_manager;
#[cfg(test)]
pub mod fake;
pub mod hypervisor;
pub mod lxc_hypervisor;
pub mod rollback;
pub mod types;

pub use container_manager::ContainerOrchestrator;
pub use hypervisor::Hypervisor;
pub use lxc_hypervisor::LxcHypervisor;
pub use rollback::Rollback;
pub use types::{
    Compensation, ContainerHandle, OrchestratorStats, ProvisionRequest, ProvisionStep,
    TeardownFailure,
};
