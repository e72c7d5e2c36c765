//! SeaORM entity model used by the database ledger.
//!
//! Maps to the `vps_instances` table created by `database_storage`.

use sea_orm::entity::prelude::*;

/// VPS instances table entity model.
///
/// Timestamps are stored as RFC3339 strings for portability.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "vps_instances")]
pub struct Model {
    /// Auto-increment surrogate id
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Owner principal, stored bit-for-bit as a signed integer
    pub owner_id: i64,
    pub name: String,
    pub ip: String,
    pub ram_mb: i64,
    pub ssh_port: i32,
    /// bcrypt hash
    pub password_hash: String,
    /// RFC3339 creation timestamp
    pub created_at: String,
    /// RFC3339 decommission timestamp; NULL while active
    pub decommissioned_at: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
