use log::{info, warn};
use std::sync::Arc;

use crate::configuration::Config;
use crate::container_management::{Hypervisor, LxcHypervisor};
use crate::controller::authorizer::{AdminList, Authorizer};
use crate::error_handling::types::ControllerError;
use crate::provisioning::{EngineInfo, ProvisionedVps, ProvisioningCoordinator};
use crate::storage::{DatabaseLedger, VpsInstance};

/// Entry point for callers: routes each command to the coordinator after
/// checking what the requester is allowed to do.
///
/// Results come back as plain structured values; turning them into messages
/// is up to whoever sits in front of this.
pub struct Controller {
    coordinator: ProvisioningCoordinator,
    authorizer: Arc<dyn Authorizer>,
}

impl Controller {
    pub fn new(coordinator: ProvisioningCoordinator, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            coordinator,
            authorizer,
        }
    }

    /// Builds the production engine: SQLite ledger and the `lxc` CLI.
    pub async fn from_config(config: &Config) -> Result<Self, ControllerError> {
        let hypervisor = Arc::new(LxcHypervisor::from_config(&config.hypervisor));
        Self::with_hypervisor(config, hypervisor).await
    }

    pub async fn with_hypervisor(
        config: &Config,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Result<Self, ControllerError> {
        info!("Opening ledger at {}", config.ledger.database_path);
        let ledger = DatabaseLedger::from_config(&config.ledger).await?;
        let coordinator = ProvisioningCoordinator::from_config(config, Arc::new(ledger), hypervisor);
        let admins = AdminList::from(&config.access);
        if admins.is_empty() {
            warn!("No admin ids configured, privileged commands are disabled");
        }
        Ok(Self::new(coordinator, Arc::new(admins)))
    }

    pub fn coordinator(&self) -> &ProvisioningCoordinator {
        &self.coordinator
    }

    fn require_admin(&self, requester: u64) -> Result<(), ControllerError> {
        if self.authorizer.is_admin(requester) {
            Ok(())
        } else {
            warn!("Denied privileged command to principal {}", requester);
            Err(ControllerError::Forbidden(requester))
        }
    }

    pub async fn create(
        &self,
        requester: u64,
        ram_mb: i64,
    ) -> Result<ProvisionedVps, ControllerError> {
        Ok(self.coordinator.create_vps(requester, ram_mb).await?)
    }

    pub async fn list_own(&self, requester: u64) -> Result<Vec<VpsInstance>, ControllerError> {
        Ok(self.coordinator.list_own(requester).await?)
    }

    pub async fn list_all(&self, requester: u64) -> Result<Vec<VpsInstance>, ControllerError> {
        self.require_admin(requester)?;
        Ok(self.coordinator.list_all().await?)
    }

    pub async fn info(&self) -> Result<EngineInfo, ControllerError> {
        Ok(self.coordinator.info().await?)
    }

    /// Owners may remove their own instances, admins any instance.
    pub async fn decommission(
        &self,
        requester: u64,
        id: i64,
    ) -> Result<VpsInstance, ControllerError> {
        let owner = if self.authorizer.is_admin(requester) {
            None
        } else {
            Some(requester)
        };
        Ok(self.coordinator.decommission_vps(id, owner).await?)
    }

    pub async fn orphans(&self, requester: u64) -> Result<Vec<String>, ControllerError> {
        self.require_admin(requester)?;
        Ok(self.coordinator.orphaned_units().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::types::PortRange;
    use crate::container_management::fake::{FakeHypervisor, FakeOp};
    use crate::error_handling::types::ProvisioningError;
    use crate::storage::memory_storage::MemoryLedger;
    use std::str::FromStr;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    const ADMIN: u64 = 1000;

    fn controller() -> (Controller, Arc<FakeHypervisor>) {
        let config = Config::from_str(
            r#"
            [host]
            public_ip = "203.0.113.10"

            [provisioning]
            password_hash_cost = 4
            "#,
        )
        .unwrap();
        let fake = Arc::new(FakeHypervisor::new());
        let coordinator = ProvisioningCoordinator::from_config(
            &config,
            Arc::new(MemoryLedger::new()),
            fake.clone(),
        );
        (
            Controller::new(coordinator, Arc::new(AdminList::new([ADMIN]))),
            fake,
        )
    }

    #[tokio::test]
    async fn test_create_then_list_own() {
        let (controller, _fake) = controller();
        let vps = assert_ok!(controller.create(42, 512).await);
        assert_eq!(vps.instance.ssh_port, 2222);

        let own = assert_ok!(controller.list_own(42).await);
        assert_eq!(own, vec![vps.instance]);
        assert!(assert_ok!(controller.list_own(7).await).is_empty());
    }

    #[tokio::test]
    async fn test_list_all_requires_admin() {
        let (controller, _fake) = controller();
        controller.create(42, 512).await.unwrap();
        controller.create(7, 512).await.unwrap();

        let err = assert_err!(controller.list_all(42).await);
        assert!(matches!(err, ControllerError::Forbidden(42)));
        assert_eq!(assert_ok!(controller.list_all(ADMIN).await).len(), 2);
    }

    #[tokio::test]
    async fn test_decommission_scoping() {
        let (controller, fake) = controller();
        let mine = controller.create(42, 512).await.unwrap().instance;
        let theirs = controller.create(7, 512).await.unwrap().instance;

        let err = assert_err!(controller.decommission(42, theirs.id).await);
        assert!(matches!(
            err,
            ControllerError::ProvisioningError(ProvisioningError::NotFound(_))
        ));

        assert_ok!(controller.decommission(42, mine.id).await);
        assert_ok!(controller.decommission(ADMIN, theirs.id).await);
        assert!(fake.units().is_empty());
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        let (controller, fake) = controller();
        fake.fail_on(FakeOp::Start);
        let err = assert_err!(controller.create(42, 512).await);
        assert!(matches!(
            err,
            ControllerError::ProvisioningError(ProvisioningError::Orchestration(_))
        ));
        assert!(matches!(
            assert_err!(controller.create(42, 0).await),
            ControllerError::ProvisioningError(ProvisioningError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_orphans_are_admin_only() {
        let (controller, fake) = controller();
        fake.fail_on(FakeOp::Exec);
        fake.fail_on(FakeOp::Delete);
        controller.create(42, 512).await.unwrap_err();

        assert!(matches!(
            assert_err!(controller.orphans(42).await),
            ControllerError::Forbidden(42)
        ));
        assert_eq!(assert_ok!(controller.orphans(ADMIN).await).len(), 1);
    }

    #[tokio::test]
    async fn test_with_hypervisor_uses_sqlite_ledger() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("ledger").join("vps.sqlite3");
        let config = Config::from_str(&format!(
            r#"
            [host]
            public_ip = "203.0.113.10"

            [ports]
            start = 4000
            end = 4002

            [ledger]
            database_path = "{}"

            [provisioning]
            password_hash_cost = 4

            [access]
            admin_ids = [{}]
            "#,
            db.display(),
            ADMIN
        ))
        .unwrap();
        let fake = Arc::new(FakeHypervisor::new());
        let controller = Controller::with_hypervisor(&config, fake.clone())
            .await
            .unwrap();

        let vps = controller.create(42, 256).await.unwrap();
        assert_eq!(vps.instance.ssh_port, 4000);
        assert!(db.exists());

        let info = controller.info().await.unwrap();
        assert_eq!(info.port_range, PortRange::new(4000, 4002));
        assert_eq!(info.active_instances, 1);
        assert_eq!(info.free_ports, 1);

        // a second engine on the same file sees the committed record
        let reopened = Controller::with_hypervisor(&config, fake).await.unwrap();
        assert_eq!(reopened.list_all(ADMIN).await.unwrap(), vec![vps.instance]);
    }
}
