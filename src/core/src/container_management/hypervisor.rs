use async_trait::async_trait;

use crate::container_management::types::{ProxyDevice, UnitSpec};
use crate::error_handling::types::HypervisorError;

/// Client for the container hypervisor.
///
/// Every call returns once the hypervisor has acknowledged the operation.
/// Implementations are shared between concurrent provisioning tasks; each
/// task addresses its own unit name.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn create_unit(&self, spec: &UnitSpec) -> Result<(), HypervisorError>;

    async fn start_unit(&self, name: &str) -> Result<(), HypervisorError>;

    /// Runs `argv` inside the unit, feeding `stdin` if given. Returns stdout.
    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<String, HypervisorError>;

    /// Attaches a forwarding rule and persists it in the unit's configuration.
    async fn add_proxy_device(&self, name: &str, device: &ProxyDevice)
        -> Result<(), HypervisorError>;

    async fn remove_device(&self, name: &str, device: &str) -> Result<(), HypervisorError>;

    async fn stop_unit(&self, name: &str) -> Result<(), HypervisorError>;

    async fn delete_unit(&self, name: &str) -> Result<(), HypervisorError>;

    async fn unit_exists(&self, name: &str) -> Result<bool, HypervisorError>;

    async fn list_units(&self) -> Result<Vec<String>, HypervisorError>;
}
