//! Ledger Trait
//!
//! This module defines the `Ledger` trait, the durable record of VPS instances
//! and the authority on which SSH ports and unit names are taken.
//!
//! Implementors of this trait are responsible for:
//! - Enforcing uniqueness of `ssh_port` and `name` across active records and
//!   port claims, atomically with the insert or the claim
//! - Returning listings in creation order
//! - Keeping decommissioned records out of every "active" view
//!
//! All methods must be safe to call from concurrent tasks.

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::error_handling::types::LedgerError;
use crate::storage::types::{NewVpsInstance, PortClaim, VpsInstance};

#[async_trait]
pub trait Ledger: Send + Sync {
    /// SSH ports held by active records or by claims.
    async fn used_ports(&self) -> Result<BTreeSet<u16>, LedgerError>;

    /// Whether an active record or a claim already carries `name`.
    async fn name_in_use(&self, name: &str) -> Result<bool, LedgerError>;

    /// Holds `ssh_port` and `name` for an attempt that is still building its
    /// unit.
    ///
    /// Fails with [`LedgerError::Duplicate`] when either is held by an active
    /// record or another claim.
    async fn claim(&self, ssh_port: u16, name: &str) -> Result<PortClaim, LedgerError>;

    /// Drops a claim. Returns `false` if there was none.
    async fn release_claim(&self, ssh_port: u16, name: &str) -> Result<bool, LedgerError>;

    /// Pins a claim whose unit could not be torn down. Returns `false` if
    /// there was none.
    async fn quarantine_claim(&self, ssh_port: u16, name: &str) -> Result<bool, LedgerError>;

    /// Every claim, lowest port first.
    async fn list_claims(&self) -> Result<Vec<PortClaim>, LedgerError>;

    /// Records a new instance and assigns its id and creation time. A claim
    /// on the same port and name is consumed in the same transaction.
    ///
    /// Fails with [`LedgerError::Duplicate`] when the port or the name is
    /// already held by an active record.
    async fn insert(&self, record: NewVpsInstance) -> Result<VpsInstance, LedgerError>;

    /// Looks a record up by id, decommissioned or not.
    async fn get(&self, id: i64) -> Result<Option<VpsInstance>, LedgerError>;

    /// Active records owned by `owner_id`, oldest first.
    async fn list_by_owner(&self, owner_id: u64) -> Result<Vec<VpsInstance>, LedgerError>;

    /// Every active record, oldest first.
    async fn list_all(&self) -> Result<Vec<VpsInstance>, LedgerError>;

    /// Marks an active record decommissioned, releasing its port and name.
    /// Returns `false` if no active record has this id.
    async fn decommission(&self, id: i64) -> Result<bool, LedgerError>;

    async fn count_active(&self) -> Result<u64, LedgerError>;
}
