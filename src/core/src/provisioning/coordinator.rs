use log::{debug, error, info, warn};
use secrecy::SecretString;
use std::collections::HashSet;
use std::sync::Arc;

use crate::allocation::{PortAllocator, Reservation};
use crate::configuration::Config;
use crate::container_management::{
    ContainerOrchestrator, Hypervisor, ProvisionRequest, Rollback, TeardownFailure,
};
use crate::error_handling::types::{HypervisorError, LedgerError, ProvisioningError};
use crate::provisioning::types::{CoordinatorSettings, EngineInfo, ProvisionedVps};
use crate::secrets;
use crate::storage::{Ledger, NewVpsInstance, VpsInstance};

/// Turns "owner X wants a VPS with N MB" into a running, recorded instance.
///
/// # Fields Overview
///
/// - `ledger`: the durable record, and the final judge of port/name uniqueness
/// - `allocator`: claims on ports and names for attempts in progress
/// - `orchestrator`: hypervisor bring-up and teardown
/// - `settings`: retry budget, RAM ceiling, credential policy
///
/// A record only reaches the ledger once its unit is running and exposed.
/// Every failure after the unit exists unwinds it before returning.
pub struct ProvisioningCoordinator {
    ledger: Arc<dyn Ledger>,
    allocator: PortAllocator,
    orchestrator: ContainerOrchestrator,
    settings: CoordinatorSettings,
}

impl ProvisioningCoordinator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        allocator: PortAllocator,
        orchestrator: ContainerOrchestrator,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            ledger,
            allocator,
            orchestrator,
            settings,
        }
    }

    pub fn from_config(
        config: &Config,
        ledger: Arc<dyn Ledger>,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Self {
        let allocator = PortAllocator::new(
            ledger.clone(),
            config.ports,
            config.hypervisor.name_prefix.clone(),
        );
        let orchestrator = ContainerOrchestrator::from_config(hypervisor, config);
        Self::new(ledger, allocator, orchestrator, CoordinatorSettings::from(config))
    }

    pub async fn create_vps(
        &self,
        owner_id: u64,
        ram_mb: i64,
    ) -> Result<ProvisionedVps, ProvisioningError> {
        info!("Provisioning request from owner {}: {} MB", owner_id, ram_mb);
        let ram_mb = self.validate_ram(ram_mb)?;
        let attempts = self.settings.max_allocation_attempts;

        for attempt in 1..=attempts {
            let reservation = self.allocator.reserve(owner_id).await?;
            let secret = match secrets::generate_password(self.settings.password_length) {
                Ok(secret) => self.hash(secret).await,
                Err(e) => Err(e.into()),
            };
            let (password, password_hash) = match secret {
                Ok(pair) => pair,
                Err(e) => {
                    reservation.release().await;
                    return Err(e);
                }
            };

            let request = ProvisionRequest {
                name: reservation.name().to_string(),
                ram_mb,
                ssh_port: reservation.port(),
                password,
            };
            let mut rollback = Rollback::new();
            if let Err(e) = self.orchestrator.provision(&request, &mut rollback).await {
                let host_conflict = matches!(e.cause, HypervisorError::Rejected(_));
                if let Some(reservation) = self.teardown(rollback, reservation).await {
                    if host_conflict {
                        reservation.retire();
                    } else {
                        reservation.release().await;
                    }
                }
                if host_conflict {
                    // the host holds this port or name outside the ledger
                    warn!(
                        "Attempt {}/{} for owner {} collided with host state, retrying: {}",
                        attempt, attempts, owner_id, e
                    );
                    continue;
                }
                return Err(e.into());
            }

            let record = NewVpsInstance {
                owner_id,
                name: request.name.clone(),
                ip: self.settings.host_ip.clone(),
                ram_mb,
                ssh_port: request.ssh_port,
                password_hash,
            };
            match self.ledger.insert(record).await {
                Ok(instance) => {
                    reservation.commit();
                    info!(
                        "VPS {} created for owner {}: {}:{} ({} MB)",
                        instance.name, owner_id, instance.ip, instance.ssh_port, instance.ram_mb
                    );
                    return Ok(ProvisionedVps::new(
                        instance,
                        self.settings.ssh_username.clone(),
                        request.password,
                    ));
                }
                Err(LedgerError::Duplicate(field)) => {
                    warn!(
                        "Attempt {}/{} for owner {} lost a race on {}, retrying",
                        attempt, attempts, owner_id, field
                    );
                    if let Some(reservation) = self.teardown(rollback, reservation).await {
                        reservation.release().await;
                    }
                }
                Err(e) => {
                    error!(
                        "Unit {} is up but could not be recorded: {}",
                        request.name, e
                    );
                    if let Some(reservation) = self.teardown(rollback, reservation).await {
                        reservation.release().await;
                    }
                    return Err(ProvisioningError::Persistence(e));
                }
            }
        }

        error!(
            "Giving up on owner {} after {} allocation conflict(s)",
            owner_id, attempts
        );
        Err(ProvisioningError::AllocationConflict { attempts })
    }

    fn validate_ram(&self, ram_mb: i64) -> Result<u32, ProvisioningError> {
        if ram_mb <= 0 {
            return Err(ProvisioningError::InvalidRequest(format!(
                "ram_mb must be positive, got {}",
                ram_mb
            )));
        }
        match u32::try_from(ram_mb) {
            Ok(ram) if ram <= self.settings.max_ram_mb => Ok(ram),
            _ => Err(ProvisioningError::InvalidRequest(format!(
                "ram_mb {} exceeds the {} MB limit",
                ram_mb, self.settings.max_ram_mb
            ))),
        }
    }

    /// bcrypt blocks for the whole hash; keep it off the async workers.
    async fn hash(
        &self,
        password: SecretString,
    ) -> Result<(SecretString, String), ProvisioningError> {
        let cost = self.settings.password_hash_cost;
        let (password, hashed) = tokio::task::spawn_blocking(move || {
            let hashed = secrets::hash_password(&password, cost);
            (password, hashed)
        })
        .await
        .map_err(|e| ProvisioningError::Internal(format!("hashing task failed: {}", e)))?;
        Ok((password, hashed?))
    }

    /// Unwinds a failed attempt. Hands the reservation back once the unit is
    /// gone; if the delete itself failed, the unit may still hold the port,
    /// so the reservation is quarantined instead.
    async fn teardown(&self, rollback: Rollback, reservation: Reservation) -> Option<Reservation> {
        let failures = self.orchestrator.unwind(rollback).await;
        if failures.is_empty() {
            debug!("Unit {} fully unwound", reservation.name());
            return Some(reservation);
        }
        let detail: Vec<String> = failures.iter().map(|f| f.to_string()).collect();
        if failures.iter().any(TeardownFailure::leaves_unit) {
            error!(
                "ORPHANED unit {} (port {}) needs manual cleanup: {}",
                reservation.name(),
                reservation.port(),
                detail.join("; ")
            );
            reservation.quarantine().await;
            return None;
        }
        warn!(
            "Unit {} deleted, but earlier cleanup steps failed: {}",
            reservation.name(),
            detail.join("; ")
        );
        Some(reservation)
    }

    pub async fn list_own(&self, owner_id: u64) -> Result<Vec<VpsInstance>, ProvisioningError> {
        Ok(self.ledger.list_by_owner(owner_id).await?)
    }

    pub async fn list_all(&self) -> Result<Vec<VpsInstance>, ProvisioningError> {
        Ok(self.ledger.list_all().await?)
    }

    /// Looks up an active instance, optionally requiring it to belong to `owner`.
    pub async fn find_active(
        &self,
        id: i64,
        owner: Option<u64>,
    ) -> Result<VpsInstance, ProvisioningError> {
        match self.ledger.get(id).await? {
            Some(record) if record.is_active() && owner.map_or(true, |o| o == record.owner_id) => {
                Ok(record)
            }
            _ => Err(ProvisioningError::NotFound(id)),
        }
    }

    /// Tears an instance down and releases its port and name.
    ///
    /// With `owner` set, instances of other owners are reported as not found.
    /// The unit goes first; if that fails the record stays so the
    /// operation can be repeated.
    pub async fn decommission_vps(
        &self,
        id: i64,
        owner: Option<u64>,
    ) -> Result<VpsInstance, ProvisioningError> {
        let record = self.find_active(id, owner).await?;
        info!("Decommissioning VPS {} ({})", record.id, record.name);

        self.orchestrator.destroy(&record.name).await?;
        if !self.ledger.decommission(id).await? {
            warn!("VPS {} was decommissioned concurrently", id);
            return Err(ProvisioningError::NotFound(id));
        }

        let released = self.ledger.get(id).await?.unwrap_or(record);
        info!(
            "VPS {} decommissioned, port {} released",
            released.name, released.ssh_port
        );
        Ok(released)
    }

    /// Units on the hypervisor that carry this engine's name prefix but have
    /// neither an active record nor an attempt in progress. Units behind a
    /// quarantined claim are reported; live claims of any engine sharing the
    /// ledger are not.
    pub async fn orphaned_units(&self) -> Result<Vec<String>, ProvisioningError> {
        let prefix = format!("{}-", self.allocator.name_prefix());
        let mut accounted: HashSet<String> = self
            .ledger
            .list_all()
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect();
        accounted.extend(
            self.ledger
                .list_claims()
                .await?
                .into_iter()
                .filter(|c| !c.quarantined)
                .map(|c| c.name),
        );
        let units = self.orchestrator.list_units().await?;
        Ok(units
            .into_iter()
            .filter(|u| u.starts_with(&prefix))
            .filter(|u| !accounted.contains(u) && !self.allocator.holds_name(u))
            .collect())
    }

    pub async fn info(&self) -> Result<EngineInfo, ProvisioningError> {
        Ok(EngineInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            host_ip: self.settings.host_ip.clone(),
            port_range: self.allocator.range(),
            active_instances: self.ledger.count_active().await?,
            free_ports: self.allocator.free_ports().await?,
            in_flight: self.allocator.in_flight(),
            orchestrator: self.orchestrator.stats(),
        })
    }
}
