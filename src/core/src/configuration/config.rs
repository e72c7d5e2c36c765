use super::types::*;
use crate::error_handling::types::ConfigError;
use log::{debug, info};
use regex::Regex;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

/// Application configuration structure that defines all runtime parameters.
///
/// Loaded from a TOML file with [`Config::from_file`]; every section except
/// `[host]` falls back to defaults. Selected values can then be overridden
/// from the environment or the command line through [`ConfigOverrides`].
///
/// ```toml
/// [host]
/// public_ip = "203.0.113.10"
///
/// [ports]
/// start = 2222
/// end = 3000
///
/// [hypervisor]
/// base_image = "ubuntu/20.04"
///
/// [access]
/// admin_ids = [42]
/// ```
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct Config {
    pub host: HostConfig,
    #[serde(default)]
    pub ports: PortRange,
    #[serde(default)]
    pub hypervisor: HypervisorConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub access: AccessConfig,
}

/// Values that take precedence over the file, usually fed from `clap` with
/// environment fallbacks.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub public_ip: Option<String>,
    pub database_path: Option<String>,
    pub base_image: Option<String>,
    pub lxc_remote: Option<String>,
}

// Unit names are `<prefix>-<owner>-<unix secs>[-n]` and LXD caps them at 63
// characters, so the prefix stays short.
const NAME_PREFIX_PATTERN: &str = r"^[A-Za-z][A-Za-z0-9-]{0,15}$";
const ACCOUNT_NAME_PATTERN: &str = r"^[a-z_][a-z0-9_-]{0,31}$";

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Reading configuration from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        Self::from_str(&raw)
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) -> Result<(), ConfigError> {
        if let Some(ip) = overrides.public_ip {
            debug!("Overriding host.public_ip");
            self.host.public_ip = ip;
        }
        if let Some(path) = overrides.database_path {
            debug!("Overriding ledger.database_path");
            self.ledger.database_path = path;
        }
        if let Some(image) = overrides.base_image {
            debug!("Overriding hypervisor.base_image");
            self.hypervisor.base_image = image;
        }
        if let Some(remote) = overrides.lxc_remote {
            debug!("Overriding hypervisor.remote");
            self.hypervisor.remote = Some(remote);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        IpAddr::from_str(&self.host.public_ip).map_err(|e| {
            ConfigError::BadIPFormatting(format!("{}: {}", self.host.public_ip, e))
        })?;

        if self.ports.start == 0 || self.ports.start >= self.ports.end {
            return Err(ConfigError::BadPortsRange(format!(
                "expected 0 < start < end, got [{}, {})",
                self.ports.start, self.ports.end
            )));
        }

        if self.hypervisor.cpu_limit == 0 {
            return Err(ConfigError::NotInRange("hypervisor.cpu_limit must be >= 1".into()));
        }
        if self.hypervisor.step_timeout_secs == 0 || self.hypervisor.bootstrap_timeout_secs == 0 {
            return Err(ConfigError::NotInRange("hypervisor timeouts must be > 0".into()));
        }
        if self.hypervisor.base_image.trim().is_empty() {
            return Err(ConfigError::BadName("hypervisor.base_image is empty".into()));
        }

        let prefix_re = Regex::new(NAME_PREFIX_PATTERN)
            .map_err(|e| ConfigError::BadName(e.to_string()))?;
        if !prefix_re.is_match(&self.hypervisor.name_prefix) {
            return Err(ConfigError::BadName(format!(
                "hypervisor.name_prefix '{}' must be 1-16 letters, digits or '-', starting with a letter",
                self.hypervisor.name_prefix
            )));
        }

        if self.ledger.max_connections == 0 {
            return Err(ConfigError::NotInRange("ledger.max_connections must be >= 1".into()));
        }
        // a claim must outlive the slowest possible bring-up and its unwind
        let longest_attempt = self
            .hypervisor
            .step_timeout_secs
            .saturating_mul(6)
            .saturating_add(self.hypervisor.bootstrap_timeout_secs);
        if self.ledger.claim_ttl_secs <= longest_attempt {
            return Err(ConfigError::NotInRange(format!(
                "ledger.claim_ttl_secs {} must exceed {}s, the longest a provisioning attempt can take",
                self.ledger.claim_ttl_secs, longest_attempt
            )));
        }

        let p = &self.provisioning;
        if !(8..=72).contains(&p.password_length) {
            return Err(ConfigError::NotInRange(format!(
                "provisioning.password_length {} not in 8..=72",
                p.password_length
            )));
        }
        if !(4..=31).contains(&p.password_hash_cost) {
            return Err(ConfigError::NotInRange(format!(
                "provisioning.password_hash_cost {} not in 4..=31",
                p.password_hash_cost
            )));
        }
        if p.max_allocation_attempts == 0 {
            return Err(ConfigError::NotInRange(
                "provisioning.max_allocation_attempts must be >= 1".into(),
            ));
        }
        if p.max_ram_mb == 0 {
            return Err(ConfigError::NotInRange("provisioning.max_ram_mb must be >= 1".into()));
        }
        let account_re = Regex::new(ACCOUNT_NAME_PATTERN)
            .map_err(|e| ConfigError::BadName(e.to_string()))?;
        if !account_re.is_match(&p.ssh_username) {
            return Err(ConfigError::BadName(format!(
                "provisioning.ssh_username '{}' is not a valid account name",
                p.ssh_username
            )));
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let config: Config =
            toml::from_str(raw).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
