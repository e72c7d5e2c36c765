use chrono::Utc;
use log::{debug, error, info, warn};
use secrecy::{ExposeSecret, SecretString};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::configuration::Config;
use crate::container_management::hypervisor::Hypervisor;
use crate::container_management::rollback::Rollback;
use crate::container_management::types::{
    Compensation, ContainerHandle, OrchestratorSettings, OrchestratorStats, ProvisionRequest,
    ProvisionStep, ProxyDevice, TeardownFailure, UnitSpec,
};
use crate::error_handling::types::{HypervisorError, OrchestrationError};

/// Drives the hypervisor through the bring-up of one compute unit.
///
/// A unit goes create -> start -> bootstrap -> expose. Each step waits for the
/// hypervisor's acknowledgment under a bounded timeout, and each step that
/// leaves something behind records its reversal in the caller's [`Rollback`].
/// The orchestrator never retries and never unwinds on its own: the caller
/// decides whether to commit or to call [`ContainerOrchestrator::unwind`].
///
/// Distinct units share nothing here, so one orchestrator serves any number
/// of concurrent bring-ups.
pub struct ContainerOrchestrator {
    hypervisor: Arc<dyn Hypervisor>,
    settings: OrchestratorSettings,
    provisioned: AtomicU64,
    failed: AtomicU64,
    destroyed: AtomicU64,
    orphaned: AtomicU64,
}

impl ContainerOrchestrator {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, settings: OrchestratorSettings) -> Self {
        info!(
            "Initializing ContainerOrchestrator (image {}, {} cpu, step timeout {}s, bootstrap timeout {}s)",
            settings.base_image,
            settings.cpu_limit,
            settings.step_timeout.as_secs(),
            settings.bootstrap_timeout.as_secs()
        );
        Self {
            hypervisor,
            settings,
            provisioned: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            orphaned: AtomicU64::new(0),
        }
    }

    pub fn from_config(hypervisor: Arc<dyn Hypervisor>, config: &Config) -> Self {
        Self::new(
            hypervisor,
            OrchestratorSettings {
                base_image: config.hypervisor.base_image.clone(),
                cpu_limit: config.hypervisor.cpu_limit,
                host_ip: config.host.public_ip.clone(),
                ssh_username: config.provisioning.ssh_username.clone(),
                step_timeout: Duration::from_secs(config.hypervisor.step_timeout_secs),
                bootstrap_timeout: Duration::from_secs(config.hypervisor.bootstrap_timeout_secs),
            },
        )
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Brings a unit to running + configured state.
    ///
    /// On error the unit may be partially built; `rollback` holds exactly the
    /// compensations needed to remove what was built.
    pub async fn provision(
        &self,
        request: &ProvisionRequest,
        rollback: &mut Rollback,
    ) -> Result<ContainerHandle, OrchestrationError> {
        let result = self.bring_up(request, rollback).await;
        match &result {
            Ok(handle) => {
                self.provisioned.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Unit {} is running and reachable on port {}",
                    handle.name, handle.ssh_port
                );
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!("Bring-up of unit {} aborted: {}", request.name, e);
            }
        }
        result
    }

    async fn bring_up(
        &self,
        request: &ProvisionRequest,
        rollback: &mut Rollback,
    ) -> Result<ContainerHandle, OrchestrationError> {
        let name = request.name.as_str();
        let hv = &self.hypervisor;

        let spec = UnitSpec {
            name: name.to_string(),
            image: self.settings.base_image.clone(),
            ram_mb: request.ram_mb,
            cpu_limit: self.settings.cpu_limit,
        };
        match self
            .step(name, ProvisionStep::Create, self.settings.step_timeout, hv.create_unit(&spec))
            .await
        {
            Ok(()) => rollback.push(Compensation::DeleteUnit(name.to_string())),
            Err(e) => {
                // A timed out create may still complete on the hypervisor side.
                if matches!(e.cause, HypervisorError::Timeout(_)) {
                    rollback.push(Compensation::DeleteUnit(name.to_string()));
                }
                return Err(e);
            }
        }

        self.step(name, ProvisionStep::Start, self.settings.step_timeout, hv.start_unit(name))
            .await?;
        rollback.push(Compensation::StopUnit(name.to_string()));

        let argv = vec![
            "bash".to_string(),
            "-c".to_string(),
            bootstrap_script(&self.settings.ssh_username, request.ssh_port),
        ];
        let stdin = SecretString::new(format!("{}\n", request.password.expose_secret()));
        self.step(
            name,
            ProvisionStep::Bootstrap,
            self.settings.bootstrap_timeout,
            hv.exec(name, &argv, Some(stdin.expose_secret().as_bytes())),
        )
        .await?;

        let device = ProxyDevice::ssh(&self.settings.host_ip, request.ssh_port);
        self.step(
            name,
            ProvisionStep::Expose,
            self.settings.step_timeout,
            hv.add_proxy_device(name, &device),
        )
        .await?;
        rollback.push(Compensation::RemoveDevice {
            unit: name.to_string(),
            device: device.name.clone(),
        });

        Ok(ContainerHandle {
            name: name.to_string(),
            ssh_port: request.ssh_port,
            proxy_device: device.name,
            created_at: Utc::now(),
        })
    }

    /// Runs every compensation in `rollback`, newest first, and keeps going
    /// past failures. Returns the compensations that could not be carried out.
    ///
    /// A unit the hypervisor reports missing, and that is confirmed absent,
    /// counts as already compensated.
    pub async fn unwind(&self, mut rollback: Rollback) -> Vec<TeardownFailure> {
        let mut failures = Vec::new();
        if rollback.is_empty() {
            return failures;
        }
        info!("Unwinding {} provisioning step(s)", rollback.len());

        for action in rollback.drain_reversed() {
            let hv = &self.hypervisor;
            let limit = self.settings.step_timeout;
            let result = match &action {
                Compensation::DeleteUnit(unit) => bounded(limit, hv.delete_unit(unit)).await,
                Compensation::StopUnit(unit) => bounded(limit, hv.stop_unit(unit)).await,
                Compensation::RemoveDevice { unit, device } => {
                    bounded(limit, hv.remove_device(unit, device)).await
                }
            };
            match result {
                Ok(()) => debug!("Compensation done: {}", action),
                Err(HypervisorError::UnitNotFound(reported)) => {
                    if self.confirm_gone(action.unit()).await {
                        debug!("Compensation not needed, unit is gone: {}", action);
                    } else {
                        warn!(
                            "Compensation failed: {}: reported missing but still listed",
                            action
                        );
                        failures.push(TeardownFailure {
                            action,
                            cause: HypervisorError::UnitNotFound(reported),
                        });
                    }
                }
                Err(cause) => {
                    warn!("Compensation failed: {}: {}", action, cause);
                    failures.push(TeardownFailure { action, cause });
                }
            }
        }

        if failures.iter().any(TeardownFailure::leaves_unit) {
            self.orphaned.fetch_add(1, Ordering::Relaxed);
        }
        failures
    }

    /// Stops and deletes a committed unit. Stop failures are tolerated since a
    /// forced delete also removes a running unit; a unit confirmed absent
    /// counts as destroyed.
    pub async fn destroy(&self, name: &str) -> Result<(), OrchestrationError> {
        info!("Destroying unit {}", name);
        let limit = self.settings.step_timeout;

        match bounded(limit, self.hypervisor.stop_unit(name)).await {
            Ok(()) => debug!("Unit {} stopped", name),
            Err(HypervisorError::UnitNotFound(_)) => {
                if self.confirm_gone(name).await {
                    warn!("Unit {} was already gone", name);
                    self.destroyed.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                warn!("Unit {} reported missing on stop but still listed, deleting", name);
            }
            Err(e) => warn!("Failed to stop unit {}, deleting anyway: {}", name, e),
        }

        match bounded(limit, self.hypervisor.delete_unit(name)).await {
            Ok(()) => {}
            Err(HypervisorError::UnitNotFound(reported)) => {
                if !self.confirm_gone(name).await {
                    error!("Failed to delete unit {}: reported missing but still listed", name);
                    return Err(OrchestrationError::new(
                        ProvisionStep::Teardown,
                        HypervisorError::UnitNotFound(reported),
                    ));
                }
                debug!("Unit {} vanished before delete", name);
            }
            Err(e) => {
                error!("Failed to delete unit {}: {}", name, e);
                return Err(OrchestrationError::new(ProvisionStep::Teardown, e));
            }
        }
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        info!("Unit {} destroyed", name);
        Ok(())
    }

    /// Whether the hypervisor positively lists `unit` as absent. Errors and
    /// timeouts count as "maybe still there".
    async fn confirm_gone(&self, unit: &str) -> bool {
        match bounded(self.settings.step_timeout, self.hypervisor.unit_exists(unit)).await {
            Ok(exists) => !exists,
            Err(e) => {
                warn!("Could not confirm that unit {} is gone: {}", unit, e);
                false
            }
        }
    }

    /// Names of every unit the hypervisor currently holds.
    pub async fn list_units(&self) -> Result<Vec<String>, OrchestrationError> {
        bounded(self.settings.step_timeout, self.hypervisor.list_units())
            .await
            .map_err(|e| OrchestrationError::new(ProvisionStep::Teardown, e))
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            provisioned: self.provisioned.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
        }
    }

    async fn step<T, F>(
        &self,
        unit: &str,
        step: ProvisionStep,
        limit: Duration,
        call: F,
    ) -> Result<T, OrchestrationError>
    where
        F: Future<Output = Result<T, HypervisorError>>,
    {
        debug!("Unit {}: step {} started", unit, step);
        match bounded(limit, call).await {
            Ok(value) => {
                debug!("Unit {}: step {} acknowledged", unit, step);
                Ok(value)
            }
            Err(cause) => {
                error!("Unit {}: step {} failed: {}", unit, step, cause);
                Err(OrchestrationError::new(step, cause))
            }
        }
    }
}

/// Awaits `call`, giving up after `limit`. Dropping the call kills any child
/// process it spawned.
async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, HypervisorError>
where
    F: Future<Output = Result<T, HypervisorError>>,
{
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(HypervisorError::Timeout(limit)),
    }
}

/// Shell run inside a fresh unit. The account password arrives as the first
/// line of stdin so it never shows up in a process listing.
///
/// The proxy device targets port 22 inside the unit, so sshd keeps listening
/// there in addition to the instance's own port.
pub(crate) fn bootstrap_script(username: &str, ssh_port: u16) -> String {
    format!(
        r#"set -eu
IFS= read -r VPS_PASSWORD
export DEBIAN_FRONTEND=noninteractive
apt-get update -q
apt-get install -y -q openssh-server
id -u {user} >/dev/null 2>&1 || useradd -m -s /bin/bash {user}
printf '%s:%s\n' '{user}' "$VPS_PASSWORD" | chpasswd
unset VPS_PASSWORD
printf 'Port 22\nPort {port}\n' >> /etc/ssh/sshd_config
mkdir -p /etc/ssh/sshd_config.d
printf 'PasswordAuthentication yes\n' > /etc/ssh/sshd_config.d/10-vpsforge.conf
service ssh restart
"#,
        user = username,
        port = ssh_port
    )
}
