use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info, warn};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database,
    DatabaseConnection, DbBackend, DbErr, EntityTrait, FromQueryResult, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, Statement, TransactionTrait, Value,
};

use crate::configuration::types::LedgerConfig;
use crate::error_handling::types::{LedgerError, UniqueField};
use crate::storage::db_entities as vps;
use crate::storage::storage_trait::Ledger;
use crate::storage::types::{NewVpsInstance, PortClaim, VpsInstance};

// Uniqueness only binds active rows, so a decommissioned instance frees its
// port and name for reuse.
const SCHEMA: &[&str] = &[
    "PRAGMA journal_mode = WAL;",
    "CREATE TABLE IF NOT EXISTS vps_instances (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        ip TEXT NOT NULL,
        ram_mb INTEGER NOT NULL CHECK (ram_mb > 0),
        ssh_port INTEGER NOT NULL,
        password_hash TEXT NOT NULL,
        created_at TEXT NOT NULL,
        decommissioned_at TEXT
    );",
    "CREATE UNIQUE INDEX IF NOT EXISTS vps_instances_active_ssh_port
        ON vps_instances(ssh_port) WHERE decommissioned_at IS NULL;",
    "CREATE UNIQUE INDEX IF NOT EXISTS vps_instances_active_name
        ON vps_instances(name) WHERE decommissioned_at IS NULL;",
    "CREATE INDEX IF NOT EXISTS vps_instances_owner ON vps_instances(owner_id);",
    "CREATE TABLE IF NOT EXISTS port_claims (
        ssh_port INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        claimed_at TEXT NOT NULL,
        quarantined INTEGER NOT NULL DEFAULT 0
    );",
];

// Single statement, so the check against active records and the insert are
// one atomic step.
const CLAIM_SQL: &str = "INSERT INTO port_claims (ssh_port, name, claimed_at, quarantined)
    SELECT ?, ?, ?, 0
    WHERE NOT EXISTS (
        SELECT 1 FROM vps_instances
        WHERE decommissioned_at IS NULL AND (ssh_port = ? OR name = ?)
    )";

#[derive(Debug, FromQueryResult)]
struct ClaimRow {
    ssh_port: i32,
    name: String,
    claimed_at: String,
    quarantined: i64,
}

/// [`Ledger`] stored in a SQLite file through SeaORM.
pub struct DatabaseLedger {
    db: DatabaseConnection,
    claim_ttl: Duration,
}

impl DatabaseLedger {
    /// Default database filename used in the application's working directory
    pub const DEFAULT_DB_FILE: &'static str = "vps_database.sqlite3";
    pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(3600);

    pub async fn from_config(config: &LedgerConfig) -> Result<Self, LedgerError> {
        Ok(Self::open(&config.database_path, config.max_connections)
            .await?
            .with_claim_ttl(Duration::from_secs(config.claim_ttl_secs)))
    }

    /// Claims older than `ttl` that are not quarantined are treated as left
    /// behind by a dead process and removed on the next claim.
    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    /// Opens the database at `path`, creating the file and schema if needed.
    pub async fn open<P: AsRef<Path>>(path: P, max_connections: u32) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LedgerError::ConnectionFailed(e.to_string()))?;
            }
        }

        info!("Opening ledger database {}", path.display());
        let mut opts = ConnectOptions::new(format!("sqlite://{}?mode=rwc", path.display()));
        opts.max_connections(max_connections).sqlx_logging(false);
        let db = Database::connect(opts)
            .await
            .map_err(|e| LedgerError::ConnectionFailed(e.to_string()))?;

        for statement in SCHEMA {
            db.execute_unprepared(statement)
                .await
                .map_err(|e| LedgerError::WriteFailed(e.to_string()))?;
        }
        debug!("Ledger schema ready");
        Ok(Self {
            db,
            claim_ttl: Self::DEFAULT_CLAIM_TTL,
        })
    }

    fn statement(sql: &str, values: Vec<Value>) -> Statement {
        Statement::from_sql_and_values(DbBackend::Sqlite, sql, values)
    }

    async fn purge_stale_claims(&self) -> Result<(), LedgerError> {
        let ttl = chrono::Duration::from_std(self.claim_ttl)
            .map_err(|e| LedgerError::WriteFailed(format!("claim ttl out of range: {}", e)))?;
        let cutoff = claim_time(Utc::now() - ttl);
        let result = self
            .db
            .execute(Self::statement(
                "DELETE FROM port_claims WHERE quarantined = 0 AND claimed_at < ?",
                vec![cutoff.into()],
            ))
            .await
            .map_err(write_error)?;
        if result.rows_affected() > 0 {
            warn!(
                "Removed {} port claim(s) older than {}s",
                result.rows_affected(),
                self.claim_ttl.as_secs()
            );
        }
        Ok(())
    }

    /// Which field made a claim lose against an active record.
    async fn held_by_record(&self, ssh_port: u16) -> Result<UniqueField, LedgerError> {
        let port_taken = vps::Entity::find()
            .filter(vps::Column::SshPort.eq(i32::from(ssh_port)))
            .filter(vps::Column::DecommissionedAt.is_null())
            .count(&self.db)
            .await
            .map_err(read_error)?;
        Ok(if port_taken > 0 {
            UniqueField::SshPort
        } else {
            UniqueField::Name
        })
    }
}

// Fixed width, so text comparison orders claims by time.
fn claim_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn into_claim(row: ClaimRow) -> Result<PortClaim, LedgerError> {
    Ok(PortClaim {
        ssh_port: u16::try_from(row.ssh_port)
            .map_err(|_| LedgerError::Corrupt(format!("claimed port {} out of range", row.ssh_port)))?,
        claimed_at: parse_time(&row.claimed_at)?,
        name: row.name,
        quarantined: row.quarantined != 0,
    })
}

fn read_error(err: DbErr) -> LedgerError {
    LedgerError::ReadFailed(err.to_string())
}

fn write_error(err: DbErr) -> LedgerError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(msg)) => {
            if msg.contains("ssh_port") {
                LedgerError::Duplicate(UniqueField::SshPort)
            } else if msg.contains("name") {
                LedgerError::Duplicate(UniqueField::Name)
            } else {
                LedgerError::WriteFailed(msg)
            }
        }
        _ => LedgerError::WriteFailed(err.to_string()),
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LedgerError::Corrupt(format!("bad timestamp '{}': {}", raw, e)))
}

fn into_instance(row: vps::Model) -> Result<VpsInstance, LedgerError> {
    Ok(VpsInstance {
        id: row.id,
        owner_id: row.owner_id as u64,
        ram_mb: u32::try_from(row.ram_mb)
            .map_err(|_| LedgerError::Corrupt(format!("ram_mb {} out of range", row.ram_mb)))?,
        ssh_port: u16::try_from(row.ssh_port)
            .map_err(|_| LedgerError::Corrupt(format!("ssh_port {} out of range", row.ssh_port)))?,
        created_at: parse_time(&row.created_at)?,
        decommissioned_at: row.decommissioned_at.as_deref().map(parse_time).transpose()?,
        name: row.name,
        ip: row.ip,
        password_hash: row.password_hash,
    })
}

fn into_instances(rows: Vec<vps::Model>) -> Result<Vec<VpsInstance>, LedgerError> {
    rows.into_iter().map(into_instance).collect()
}

#[async_trait]
impl Ledger for DatabaseLedger {
    async fn used_ports(&self) -> Result<BTreeSet<u16>, LedgerError> {
        let ports: Vec<i32> = vps::Entity::find()
            .select_only()
            .column(vps::Column::SshPort)
            .filter(vps::Column::DecommissionedAt.is_null())
            .into_tuple::<i32>()
            .all(&self.db)
            .await
            .map_err(read_error)?;
        let claimed = self.list_claims().await?;
        ports
            .into_iter()
            .map(|p| {
                u16::try_from(p)
                    .map_err(|_| LedgerError::Corrupt(format!("ssh_port {} out of range", p)))
            })
            .chain(claimed.into_iter().map(|c| Ok(c.ssh_port)))
            .collect()
    }

    async fn name_in_use(&self, name: &str) -> Result<bool, LedgerError> {
        let count = vps::Entity::find()
            .filter(vps::Column::Name.eq(name))
            .filter(vps::Column::DecommissionedAt.is_null())
            .count(&self.db)
            .await
            .map_err(read_error)?;
        if count > 0 {
            return Ok(true);
        }
        Ok(self.list_claims().await?.iter().any(|c| c.name == name))
    }

    async fn claim(&self, ssh_port: u16, name: &str) -> Result<PortClaim, LedgerError> {
        self.purge_stale_claims().await?;
        let claimed_at = Utc::now();
        let port = i32::from(ssh_port);
        let result = self
            .db
            .execute(Self::statement(
                CLAIM_SQL,
                vec![
                    port.into(),
                    name.into(),
                    claim_time(claimed_at).into(),
                    port.into(),
                    name.into(),
                ],
            ))
            .await
            .map_err(write_error)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::Duplicate(self.held_by_record(ssh_port).await?));
        }
        debug!("Ledger claimed port {} for {}", ssh_port, name);
        Ok(PortClaim {
            ssh_port,
            name: name.to_string(),
            claimed_at: parse_time(&claim_time(claimed_at))?,
            quarantined: false,
        })
    }

    async fn release_claim(&self, ssh_port: u16, name: &str) -> Result<bool, LedgerError> {
        let result = self
            .db
            .execute(Self::statement(
                "DELETE FROM port_claims WHERE ssh_port = ? AND name = ?",
                vec![i32::from(ssh_port).into(), name.into()],
            ))
            .await
            .map_err(write_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn quarantine_claim(&self, ssh_port: u16, name: &str) -> Result<bool, LedgerError> {
        let result = self
            .db
            .execute(Self::statement(
                "UPDATE port_claims SET quarantined = 1 WHERE ssh_port = ? AND name = ?",
                vec![i32::from(ssh_port).into(), name.into()],
            ))
            .await
            .map_err(write_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_claims(&self) -> Result<Vec<PortClaim>, LedgerError> {
        let rows = ClaimRow::find_by_statement(Self::statement(
            "SELECT ssh_port, name, claimed_at, quarantined FROM port_claims ORDER BY ssh_port",
            vec![],
        ))
        .all(&self.db)
        .await
        .map_err(read_error)?;
        rows.into_iter().map(into_claim).collect()
    }

    async fn insert(&self, record: NewVpsInstance) -> Result<VpsInstance, LedgerError> {
        let row = vps::ActiveModel {
            // owner ids are stored bit-for-bit in the signed column
            owner_id: Set(record.owner_id as i64),
            name: Set(record.name),
            ip: Set(record.ip),
            ram_mb: Set(i64::from(record.ram_mb)),
            ssh_port: Set(i32::from(record.ssh_port)),
            password_hash: Set(record.password_hash),
            created_at: Set(Utc::now().to_rfc3339()),
            decommissioned_at: Set(None),
            ..Default::default()
        };
        let txn = self.db.begin().await.map_err(write_error)?;
        let inserted = row.insert(&txn).await.map_err(write_error)?;
        txn.execute(Self::statement(
            "DELETE FROM port_claims WHERE ssh_port = ? AND name = ?",
            vec![inserted.ssh_port.into(), inserted.name.clone().into()],
        ))
        .await
        .map_err(write_error)?;
        txn.commit().await.map_err(write_error)?;
        debug!(
            "Ledger recorded instance {} ({}, port {})",
            inserted.id, inserted.name, inserted.ssh_port
        );
        into_instance(inserted)
    }

    async fn get(&self, id: i64) -> Result<Option<VpsInstance>, LedgerError> {
        vps::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(read_error)?
            .map(into_instance)
            .transpose()
    }

    async fn list_by_owner(&self, owner_id: u64) -> Result<Vec<VpsInstance>, LedgerError> {
        let rows = vps::Entity::find()
            .filter(vps::Column::OwnerId.eq(owner_id as i64))
            .filter(vps::Column::DecommissionedAt.is_null())
            .order_by_asc(vps::Column::Id)
            .all(&self.db)
            .await
            .map_err(read_error)?;
        into_instances(rows)
    }

    async fn list_all(&self) -> Result<Vec<VpsInstance>, LedgerError> {
        let rows = vps::Entity::find()
            .filter(vps::Column::DecommissionedAt.is_null())
            .order_by_asc(vps::Column::Id)
            .all(&self.db)
            .await
            .map_err(read_error)?;
        into_instances(rows)
    }

    async fn decommission(&self, id: i64) -> Result<bool, LedgerError> {
        let result = vps::Entity::update_many()
            .col_expr(vps::Column::DecommissionedAt, Expr::value(Utc::now().to_rfc3339()))
            .filter(vps::Column::Id.eq(id))
            .filter(vps::Column::DecommissionedAt.is_null())
            .exec(&self.db)
            .await
            .map_err(write_error)?;
        Ok(result.rows_affected > 0)
    }

    async fn count_active(&self) -> Result<u64, LedgerError> {
        vps::Entity::find()
            .filter(vps::Column::DecommissionedAt.is_null())
            .count(&self.db)
            .await
            .map_err(read_error)
    }
}
