use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::allocation::naming;
use crate::configuration::types::PortRange;
use crate::error_handling::types::{AllocationError, LedgerError, UniqueField};
use crate::storage::Ledger;

/// Source of the current time used in unit names.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Lowest port in `range` that is not in `used`.
pub fn allocate_port(used: &BTreeSet<u16>, range: PortRange) -> Option<u16> {
    range.iter().find(|port| !used.contains(port))
}

#[derive(Debug, Default)]
struct InFlight {
    ports: BTreeSet<u16>,
    names: HashSet<String>,
    // names handed out by this process and the second they were derived
    // from; names of earlier seconds can no longer come up as candidates
    issued: HashMap<String, i64>,
    // ports whose unit could not be torn down
    quarantined: BTreeSet<u16>,
}

impl InFlight {
    fn prune_issued(&mut self, now: i64) {
        self.issued.retain(|_, at| *at >= now);
    }
}

fn lock(in_flight: &Mutex<InFlight>) -> MutexGuard<'_, InFlight> {
    in_flight.lock().unwrap_or_else(|p| p.into_inner())
}

/// Hands out SSH ports and unit names for provisioning attempts in progress.
///
/// The ledger only gets the instance record once the unit behind it is fully
/// built, which takes minutes. Until then the port and name are held as a
/// claim in the ledger, so engines in other processes sharing the same
/// ledger skip them, and in memory, so attempts in this process skip them
/// without a round trip. The decision itself runs under a short async lock;
/// hypervisor work happens outside it.
pub struct PortAllocator {
    ledger: Arc<dyn Ledger>,
    range: PortRange,
    name_prefix: String,
    clock: Clock,
    decision: tokio::sync::Mutex<()>,
    in_flight: Arc<Mutex<InFlight>>,
}

/// A port and a name held for one provisioning attempt.
///
/// Settle it with [`Reservation::commit`] once the ledger holds the record,
/// with [`Reservation::release`] or [`Reservation::retire`] after a clean
/// unwind, and with [`Reservation::quarantine`] when the unit may still
/// exist. Dropping it unsettled releases the claim in the background.
pub struct Reservation {
    port: u16,
    name: String,
    ledger: Arc<dyn Ledger>,
    in_flight: Arc<Mutex<InFlight>>,
    settled: bool,
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("port", &self.port)
            .field("name", &self.name)
            .field("settled", &self.settled)
            .finish_non_exhaustive()
    }
}

impl Reservation {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ledger record now holds the port and name; its insert consumed
    /// the claim.
    pub fn commit(mut self) {
        self.settled = true;
    }

    /// Gives the port and name back after the unit was removed.
    pub async fn release(mut self) {
        match self.ledger.release_claim(self.port, &self.name).await {
            Ok(true) => {}
            Ok(false) => debug!("Claim on port {} was already gone", self.port),
            Err(e) => warn!(
                "Could not release claim on port {} for {}, it expires on its own: {}",
                self.port, self.name, e
            ),
        }
        self.settled = true;
    }

    /// Leaves the claim in place to expire on its own, for a port or name the
    /// host turned out to be using outside the ledger.
    pub fn retire(mut self) {
        self.settled = true;
        info!(
            "Port {} and name {} left claimed until their claim expires",
            self.port, self.name
        );
    }

    /// Keeps the port out of circulation, for a unit that may still hold it
    /// on the hypervisor. The quarantined claim outlives this process.
    pub async fn quarantine(mut self) {
        if let Err(e) = self.ledger.quarantine_claim(self.port, &self.name).await {
            warn!(
                "Could not quarantine claim on port {} in the ledger: {}",
                self.port, e
            );
        }
        lock(&self.in_flight).quarantined.insert(self.port);
        self.settled = true;
        warn!("Port {} quarantined after failed teardown of {}", self.port, self.name);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        {
            let mut in_flight = lock(&self.in_flight);
            in_flight.ports.remove(&self.port);
            in_flight.names.remove(&self.name);
        }
        if self.settled {
            debug!("Released reservation {} / port {}", self.name, self.port);
            return;
        }

        let (ledger, port, name) = (self.ledger.clone(), self.port, self.name.clone());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = ledger.release_claim(port, &name).await {
                        warn!("Could not release abandoned claim on port {}: {}", port, e);
                    }
                });
            }
            Err(_) => warn!(
                "Claim on port {} for {} abandoned outside a runtime, it expires on its own",
                port, name
            ),
        }
    }
}

impl PortAllocator {
    pub fn new(ledger: Arc<dyn Ledger>, range: PortRange, name_prefix: impl Into<String>) -> Self {
        Self::with_clock(ledger, range, name_prefix, Arc::new(Utc::now))
    }

    pub fn with_clock(
        ledger: Arc<dyn Ledger>,
        range: PortRange,
        name_prefix: impl Into<String>,
        clock: Clock,
    ) -> Self {
        let name_prefix = name_prefix.into();
        info!(
            "PortAllocator serving ports [{}, {}) with name prefix {}",
            range.start, range.end, name_prefix
        );
        Self {
            ledger,
            range,
            name_prefix,
            clock,
            decision: tokio::sync::Mutex::new(()),
            in_flight: Arc::new(Mutex::new(InFlight::default())),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Reserves the lowest free port and a fresh unit name for `owner_id`,
    /// claiming both in the ledger.
    pub async fn reserve(&self, owner_id: u64) -> Result<Reservation, AllocationError> {
        let _decision = self.decision.lock().await;
        let now = (self.clock)();

        // Snapshot before reading the ledger: a port released after this
        // point was committed to the ledger before its release.
        let (held_ports, held_names) = {
            let mut in_flight = lock(&self.in_flight);
            in_flight.prune_issued(now.timestamp());
            let mut ports = in_flight.ports.clone();
            ports.extend(in_flight.quarantined.iter().copied());
            let mut names = in_flight.names.clone();
            names.extend(in_flight.issued.keys().cloned());
            (ports, names)
        };

        let mut used = self.ledger.used_ports().await?;
        used.extend(held_ports);
        let base = naming::base_name(&self.name_prefix, owner_id, now);
        let mut n = 0;

        // Another engine on the same ledger may claim between our read and
        // our claim; a lost claim just moves on to the next candidate.
        let (port, name) = loop {
            let Some(port) = allocate_port(&used, self.range) else {
                warn!(
                    "No SSH port left in [{}, {}) for owner {}",
                    self.range.start, self.range.end, owner_id
                );
                return Err(AllocationError::NoCapacity);
            };
            let candidate = naming::candidate(&base, n);
            if held_names.contains(&candidate) || self.ledger.name_in_use(&candidate).await? {
                n += 1;
                continue;
            }
            match self.ledger.claim(port, &candidate).await {
                Ok(_) => break (port, candidate),
                Err(LedgerError::Duplicate(UniqueField::SshPort)) => {
                    debug!("Port {} was claimed elsewhere, trying the next one", port);
                    used.insert(port);
                }
                Err(LedgerError::Duplicate(UniqueField::Name)) => n += 1,
                Err(e) => return Err(e.into()),
            }
        };

        {
            let mut in_flight = lock(&self.in_flight);
            in_flight.ports.insert(port);
            in_flight.names.insert(name.clone());
            in_flight.issued.insert(name.clone(), now.timestamp());
        }
        debug!("Reserved port {} and name {} for owner {}", port, name, owner_id);

        Ok(Reservation {
            port,
            name,
            ledger: self.ledger.clone(),
            in_flight: self.in_flight.clone(),
            settled: false,
        })
    }

    /// Ports in range not held by a record, a claim, or local quarantine.
    pub async fn free_ports(&self) -> Result<usize, AllocationError> {
        let mut used = self.ledger.used_ports().await?;
        {
            let in_flight = lock(&self.in_flight);
            used.extend(in_flight.ports.iter().copied());
            used.extend(in_flight.quarantined.iter().copied());
        }
        let taken = used.iter().filter(|p| self.range.contains(**p)).count();
        Ok(self.range.len() - taken)
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).ports.len()
    }

    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    /// Whether `name` belongs to an attempt of this process still in progress.
    pub fn holds_name(&self, name: &str) -> bool {
        lock(&self.in_flight).names.contains(name)
    }

    #[cfg(test)]
    fn issued_names(&self) -> usize {
        lock(&self.in_flight).issued.len()
    }
}
