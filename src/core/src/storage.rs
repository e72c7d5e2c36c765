//! Storage subsystem
//!
//! The ledger of VPS instances: the durable record of who owns what, and the
//! authority on which SSH ports and unit names are taken.
//!
//! Components:
//! - `storage_trait`: the Ledger trait defining a uniform API.
//! - `types`: record types shared by ledger backends.
//! - `database_storage`: ORM-based SQLite implementation using SeaORM.
//! - `db_entities`: SeaORM entity model for the database backend.
//! - `memory_storage`: in-process implementation used by tests.

pub mod database_storage;
pub mod db_entities;
#[cfg(test)]
pub mod memory_storage;
pub mod storage_trait;
pub mod types;

pub use database_storage::DatabaseLedger;
pub use storage_trait::Ledger;
pub use types::{NewVpsInstance, PortClaim, VpsInstance};
