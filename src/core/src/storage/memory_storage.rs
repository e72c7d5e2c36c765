//! In-process [`Ledger`] with the same uniqueness rules as the database one.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::error_handling::types::{LedgerError, UniqueField};
use crate::storage::storage_trait::Ledger;
use crate::storage::types::{NewVpsInstance, PortClaim, VpsInstance};

#[derive(Default)]
struct State {
    next_id: i64,
    rows: Vec<VpsInstance>,
    claims: Vec<PortClaim>,
    insert_faults: VecDeque<LedgerError>,
    read_fault: Option<String>,
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The next insert fails with `err` instead of committing.
    pub fn fail_next_insert(&self, err: LedgerError) {
        self.state().insert_faults.push_back(err);
    }

    /// Every read fails until cleared with `None`.
    pub fn fail_reads(&self, reason: Option<&str>) {
        self.state().read_fault = reason.map(str::to_string);
    }

    /// Every row ever inserted, decommissioned ones included.
    pub fn rows(&self) -> Vec<VpsInstance> {
        self.state().rows.clone()
    }

    fn check_read(state: &State) -> Result<(), LedgerError> {
        match &state.read_fault {
            Some(reason) => Err(LedgerError::ReadFailed(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn used_ports(&self) -> Result<BTreeSet<u16>, LedgerError> {
        let state = self.state();
        Self::check_read(&state)?;
        Ok(state
            .rows
            .iter()
            .filter(|r| r.is_active())
            .map(|r| r.ssh_port)
            .chain(state.claims.iter().map(|c| c.ssh_port))
            .collect())
    }

    async fn name_in_use(&self, name: &str) -> Result<bool, LedgerError> {
        let state = self.state();
        Self::check_read(&state)?;
        Ok(state.rows.iter().any(|r| r.is_active() && r.name == name)
            || state.claims.iter().any(|c| c.name == name))
    }

    async fn claim(&self, ssh_port: u16, name: &str) -> Result<PortClaim, LedgerError> {
        let mut state = self.state();
        let active = || state.rows.iter().filter(|r| r.is_active());
        if active().any(|r| r.ssh_port == ssh_port)
            || state.claims.iter().any(|c| c.ssh_port == ssh_port)
        {
            return Err(LedgerError::Duplicate(UniqueField::SshPort));
        }
        if active().any(|r| r.name == name) || state.claims.iter().any(|c| c.name == name) {
            return Err(LedgerError::Duplicate(UniqueField::Name));
        }
        let claim = PortClaim {
            ssh_port,
            name: name.to_string(),
            claimed_at: Utc::now(),
            quarantined: false,
        };
        state.claims.push(claim.clone());
        Ok(claim)
    }

    async fn release_claim(&self, ssh_port: u16, name: &str) -> Result<bool, LedgerError> {
        let mut state = self.state();
        let before = state.claims.len();
        state
            .claims
            .retain(|c| !(c.ssh_port == ssh_port && c.name == name));
        Ok(state.claims.len() < before)
    }

    async fn quarantine_claim(&self, ssh_port: u16, name: &str) -> Result<bool, LedgerError> {
        let mut state = self.state();
        match state
            .claims
            .iter_mut()
            .find(|c| c.ssh_port == ssh_port && c.name == name)
        {
            Some(claim) => {
                claim.quarantined = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_claims(&self) -> Result<Vec<PortClaim>, LedgerError> {
        let state = self.state();
        Self::check_read(&state)?;
        let mut claims = state.claims.clone();
        claims.sort_by_key(|c| c.ssh_port);
        Ok(claims)
    }

    async fn insert(&self, record: NewVpsInstance) -> Result<VpsInstance, LedgerError> {
        let mut state = self.state();
        if let Some(err) = state.insert_faults.pop_front() {
            return Err(err);
        }
        let active = || state.rows.iter().filter(|r| r.is_active());
        if active().any(|r| r.ssh_port == record.ssh_port) {
            return Err(LedgerError::Duplicate(UniqueField::SshPort));
        }
        if active().any(|r| r.name == record.name) {
            return Err(LedgerError::Duplicate(UniqueField::Name));
        }

        state
            .claims
            .retain(|c| !(c.ssh_port == record.ssh_port && c.name == record.name));
        state.next_id += 1;
        let instance = VpsInstance {
            id: state.next_id,
            owner_id: record.owner_id,
            name: record.name,
            ip: record.ip,
            ram_mb: record.ram_mb,
            ssh_port: record.ssh_port,
            password_hash: record.password_hash,
            created_at: Utc::now(),
            decommissioned_at: None,
        };
        state.rows.push(instance.clone());
        Ok(instance)
    }

    async fn get(&self, id: i64) -> Result<Option<VpsInstance>, LedgerError> {
        let state = self.state();
        Self::check_read(&state)?;
        Ok(state.rows.iter().find(|r| r.id == id).cloned())
    }

    async fn list_by_owner(&self, owner_id: u64) -> Result<Vec<VpsInstance>, LedgerError> {
        let state = self.state();
        Self::check_read(&state)?;
        Ok(state
            .rows
            .iter()
            .filter(|r| r.is_active() && r.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<VpsInstance>, LedgerError> {
        let state = self.state();
        Self::check_read(&state)?;
        Ok(state.rows.iter().filter(|r| r.is_active()).cloned().collect())
    }

    async fn decommission(&self, id: i64) -> Result<bool, LedgerError> {
        let mut state = self.state();
        match state.rows.iter_mut().find(|r| r.id == id && r.is_active()) {
            Some(row) => {
                row.decommissioned_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_active(&self) -> Result<u64, LedgerError> {
        let state = self.state();
        Self::check_read(&state)?;
        Ok(state.rows.iter().filter(|r| r.is_active()).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(owner_id: u64, name: &str, port: u16) -> NewVpsInstance {
        NewVpsInstance {
            owner_id,
            name: name.to_string(),
            ip: "203.0.113.10".to_string(),
            ram_mb: 256,
            ssh_port: port,
            password_hash: "hash".to_string(),
        }
    }

    #[tokio::test]
    async fn test_matches_database_uniqueness_rules() {
        let ledger = MemoryLedger::new();
        let a = ledger.insert(record(1, "vps-a", 2222)).await.unwrap();
        assert!(matches!(
            ledger.insert(record(2, "vps-b", 2222)).await,
            Err(LedgerError::Duplicate(UniqueField::SshPort))
        ));
        assert!(matches!(
            ledger.insert(record(2, "vps-a", 2223)).await,
            Err(LedgerError::Duplicate(UniqueField::Name))
        ));

        assert!(ledger.decommission(a.id).await.unwrap());
        let b = ledger.insert(record(2, "vps-a", 2222)).await.unwrap();
        assert_eq!(b.id, a.id + 1);
        assert_eq!(ledger.list_all().await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn test_claims_block_ports_and_names_until_committed() {
        let ledger = MemoryLedger::new();
        ledger.claim(2222, "vps-a").await.unwrap();
        assert!(matches!(
            ledger.claim(2222, "vps-b").await,
            Err(LedgerError::Duplicate(UniqueField::SshPort))
        ));
        assert!(matches!(
            ledger.claim(2223, "vps-a").await,
            Err(LedgerError::Duplicate(UniqueField::Name))
        ));
        assert!(ledger.used_ports().await.unwrap().contains(&2222));
        assert!(ledger.name_in_use("vps-a").await.unwrap());

        ledger.insert(record(1, "vps-a", 2222)).await.unwrap();
        assert!(ledger.list_claims().await.unwrap().is_empty());
        assert!(matches!(
            ledger.claim(2222, "vps-c").await,
            Err(LedgerError::Duplicate(UniqueField::SshPort))
        ));
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let ledger = MemoryLedger::new();
        ledger.fail_next_insert(LedgerError::WriteFailed("disk full".into()));
        assert!(matches!(
            ledger.insert(record(1, "vps-a", 2222)).await,
            Err(LedgerError::WriteFailed(_))
        ));
        ledger.insert(record(1, "vps-a", 2222)).await.unwrap();

        ledger.fail_reads(Some("locked"));
        assert!(ledger.used_ports().await.is_err());
        ledger.fail_reads(None);
        assert_eq!(ledger.used_ports().await.unwrap().len(), 1);
    }
}
