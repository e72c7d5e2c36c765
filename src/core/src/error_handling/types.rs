use std::fmt;
use std::time::Duration;

use crate::container_management::types::ProvisionStep;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    BadIPFormatting(String),
    BadPortsRange(String),
    NotInRange(String),
    BadName(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::BadIPFormatting(e) => write!(f, "IP formatting error: {}", e),
            ConfigError::BadPortsRange(e) => write!(f, "Port range error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
            ConfigError::BadName(e) => write!(f, "Invalid name: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

#[derive(Debug)]
pub enum SecretError {
    /// The operating system's secure randomness source failed.
    EntropyUnavailable(String),
    InvalidLength(usize),
    HashingFailed(String),
}

impl fmt::Display for SecretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretError::EntropyUnavailable(e) => {
                write!(f, "Secure randomness source unavailable: {}", e)
            }
            SecretError::InvalidLength(n) => write!(f, "Invalid password length: {}", n),
            SecretError::HashingFailed(e) => write!(f, "Password hashing failed: {}", e),
        }
    }
}

impl std::error::Error for SecretError {}

/// Column protected by a uniqueness constraint among active ledger records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueField {
    SshPort,
    Name,
}

impl fmt::Display for UniqueField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UniqueField::SshPort => write!(f, "ssh_port"),
            UniqueField::Name => write!(f, "name"),
        }
    }
}

#[derive(Debug)]
pub enum LedgerError {
    ConnectionFailed(String),
    WriteFailed(String),
    ReadFailed(String),
    Duplicate(UniqueField),
    Corrupt(String),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::ConnectionFailed(e) => write!(f, "Ledger connection failed: {}", e),
            LedgerError::WriteFailed(e) => write!(f, "Ledger write failed: {}", e),
            LedgerError::ReadFailed(e) => write!(f, "Ledger read failed: {}", e),
            LedgerError::Duplicate(field) => {
                write!(f, "Ledger already holds an active record with this {}", field)
            }
            LedgerError::Corrupt(e) => write!(f, "Ledger record is corrupt: {}", e),
        }
    }
}

impl std::error::Error for LedgerError {}

#[derive(Debug)]
pub enum AllocationError {
    /// Every port in the configured range is active or in flight.
    NoCapacity,
    Ledger(LedgerError),
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationError::NoCapacity => write!(f, "No SSH port available in the configured range"),
            AllocationError::Ledger(e) => write!(f, "Allocation could not read the ledger: {}", e),
        }
    }
}

impl std::error::Error for AllocationError {}

impl From<LedgerError> for AllocationError {
    fn from(err: LedgerError) -> Self {
        AllocationError::Ledger(err)
    }
}

#[derive(Debug)]
pub enum HypervisorError {
    Spawn(std::io::Error),
    CommandFailed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
    Timeout(Duration),
    UnitNotFound(String),
    Rejected(String),
}

impl fmt::Display for HypervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HypervisorError::Spawn(e) => write!(f, "Failed to spawn hypervisor client: {}", e),
            HypervisorError::CommandFailed {
                program,
                status,
                stderr,
            } => match status {
                Some(code) => write!(f, "{} exited with status {}: {}", program, code, stderr),
                None => write!(f, "{} terminated by signal: {}", program, stderr),
            },
            HypervisorError::Timeout(d) => {
                write!(f, "Hypervisor did not acknowledge within {}s", d.as_secs())
            }
            HypervisorError::UnitNotFound(name) => write!(f, "Compute unit {} not found", name),
            HypervisorError::Rejected(e) => write!(f, "Hypervisor rejected the request: {}", e),
        }
    }
}

impl std::error::Error for HypervisorError {}

impl From<std::io::Error> for HypervisorError {
    fn from(err: std::io::Error) -> Self {
        HypervisorError::Spawn(err)
    }
}

/// A hypervisor step that failed, with the underlying cause.
#[derive(Debug)]
pub struct OrchestrationError {
    pub step: ProvisionStep,
    pub cause: HypervisorError,
}

impl OrchestrationError {
    pub fn new(step: ProvisionStep, cause: HypervisorError) -> Self {
        Self { step, cause }
    }
}

impl fmt::Display for OrchestrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step '{}' failed: {}", self.step, self.cause)
    }
}

impl std::error::Error for OrchestrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Who can act on a provisioning failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The caller can wait, or ask for less.
    CallerCorrectable,
    /// The hypervisor or storage needs an operator.
    OperatorActionable,
    /// Should never happen; a bug.
    Internal,
}

#[derive(Debug)]
pub enum ProvisioningError {
    NoCapacity,
    AllocationConflict { attempts: u32 },
    Orchestration(OrchestrationError),
    Persistence(LedgerError),
    Internal(String),
    InvalidRequest(String),
    NotFound(i64),
}

impl ProvisioningError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProvisioningError::NoCapacity
            | ProvisioningError::AllocationConflict { .. }
            | ProvisioningError::InvalidRequest(_)
            | ProvisioningError::NotFound(_) => FailureKind::CallerCorrectable,
            ProvisioningError::Orchestration(_) | ProvisioningError::Persistence(_) => {
                FailureKind::OperatorActionable
            }
            ProvisioningError::Internal(_) => FailureKind::Internal,
        }
    }

    /// Whether the same request may succeed later without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProvisioningError::NoCapacity | ProvisioningError::AllocationConflict { .. }
        )
    }
}

impl fmt::Display for ProvisioningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningError::NoCapacity => {
                write!(f, "No capacity: every SSH port is in use, try again later")
            }
            ProvisioningError::AllocationConflict { attempts } => write!(
                f,
                "Allocation conflict persisted after {} attempt(s), try again",
                attempts
            ),
            ProvisioningError::Orchestration(e) => write!(f, "Hypervisor error: {}", e),
            ProvisioningError::Persistence(e) => write!(f, "Persistence error: {}", e),
            ProvisioningError::Internal(e) => write!(f, "Internal error: {}", e),
            ProvisioningError::InvalidRequest(e) => write!(f, "Invalid request: {}", e),
            ProvisioningError::NotFound(id) => write!(f, "VPS instance {} not found", id),
        }
    }
}

impl std::error::Error for ProvisioningError {}

impl From<OrchestrationError> for ProvisioningError {
    fn from(err: OrchestrationError) -> Self {
        ProvisioningError::Orchestration(err)
    }
}

impl From<LedgerError> for ProvisioningError {
    fn from(err: LedgerError) -> Self {
        ProvisioningError::Persistence(err)
    }
}

impl From<SecretError> for ProvisioningError {
    fn from(err: SecretError) -> Self {
        ProvisioningError::Internal(err.to_string())
    }
}

impl From<AllocationError> for ProvisioningError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::NoCapacity => ProvisioningError::NoCapacity,
            AllocationError::Ledger(e) => ProvisioningError::Persistence(e),
        }
    }
}

#[derive(Debug)]
pub enum ControllerError {
    ConfigurationError(ConfigError),
    StorageError(LedgerError),
    ProvisioningError(ProvisioningError),
    Forbidden(u64),
    InitializationFailed(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::ConfigurationError(e) => write!(f, "Configuration error: {}", e),
            ControllerError::StorageError(e) => write!(f, "Storage error: {}", e),
            ControllerError::ProvisioningError(e) => write!(f, "{}", e),
            ControllerError::Forbidden(who) => {
                write!(f, "Principal {} is not allowed to perform this operation", who)
            }
            ControllerError::InitializationFailed(e) => write!(f, "Initialization failed: {}", e),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<ProvisioningError> for ControllerError {
    fn from(err: ProvisioningError) -> Self {
        ControllerError::ProvisioningError(err)
    }
}

impl From<ConfigError> for ControllerError {
    fn from(err: ConfigError) -> Self {
        ControllerError::ConfigurationError(err)
    }
}

impl From<LedgerError> for ControllerError {
    fn from(err: LedgerError) -> Self {
        ControllerError::StorageError(err)
    }
}
