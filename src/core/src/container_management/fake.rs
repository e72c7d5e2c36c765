//! Scriptable in-process [`Hypervisor`] for tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::container_management::hypervisor::Hypervisor;
use crate::container_management::types::{ProxyDevice, UnitSpec};
use crate::error_handling::types::HypervisorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Create,
    Start,
    Exec,
    AddDevice,
    RemoveDevice,
    Stop,
    Delete,
    List,
}

#[derive(Debug, Clone)]
pub struct FakeUnit {
    pub spec: UnitSpec,
    pub running: bool,
    pub devices: Vec<ProxyDevice>,
}

#[derive(Debug, Clone)]
pub struct ExecCall {
    pub unit: String,
    pub argv: Vec<String>,
    pub stdin: Option<String>,
}

#[derive(Default)]
struct State {
    units: BTreeMap<String, FakeUnit>,
    // remaining injected failures per op; u32::MAX means always
    failures: HashMap<FakeOp, u32>,
    hangs: HashSet<FakeOp>,
    // ops answering "not found" while the unit is still there
    misreports: HashSet<FakeOp>,
    calls: Vec<(FakeOp, String)>,
    execs: Vec<ExecCall>,
}

#[derive(Default)]
pub struct FakeHypervisor {
    state: Mutex<State>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Every call to `op` fails from now on.
    pub fn fail_on(&self, op: FakeOp) {
        self.state().failures.insert(op, u32::MAX);
    }

    /// The next `times` calls to `op` fail, later ones succeed.
    pub fn fail_times(&self, op: FakeOp, times: u32) {
        self.state().failures.insert(op, times);
    }

    /// Calls to `op` never complete.
    pub fn hang_on(&self, op: FakeOp) {
        self.state().hangs.insert(op);
    }

    /// Calls to `op` report the unit as missing and leave it untouched.
    pub fn misreport_missing(&self, op: FakeOp) {
        self.state().misreports.insert(op);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.failures.clear();
        state.hangs.clear();
        state.misreports.clear();
    }

    pub fn units(&self) -> BTreeMap<String, FakeUnit> {
        self.state().units.clone()
    }

    pub fn unit(&self, name: &str) -> Option<FakeUnit> {
        self.state().units.get(name).cloned()
    }

    pub fn calls(&self) -> Vec<(FakeOp, String)> {
        self.state().calls.clone()
    }

    pub fn count(&self, op: FakeOp) -> usize {
        self.state().calls.iter().filter(|(o, _)| *o == op).count()
    }

    pub fn execs(&self) -> Vec<ExecCall> {
        self.state().execs.clone()
    }

    /// Records the call, then applies any injected hang or failure.
    async fn enter(&self, op: FakeOp, unit: &str) -> Result<(), HypervisorError> {
        let (hang, fail, misreport) = {
            let mut state = self.state();
            state.calls.push((op, unit.to_string()));
            let hang = state.hangs.contains(&op);
            let fail = match state.failures.get_mut(&op) {
                Some(n) if *n == u32::MAX => true,
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            };
            (hang, fail, state.misreports.contains(&op))
        };
        // interleave concurrent callers
        tokio::task::yield_now().await;
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(HypervisorError::CommandFailed {
                program: format!("fake {:?}", op),
                status: Some(1),
                stderr: "injected failure".to_string(),
            });
        }
        if misreport {
            return Err(HypervisorError::UnitNotFound(unit.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn create_unit(&self, spec: &UnitSpec) -> Result<(), HypervisorError> {
        self.enter(FakeOp::Create, &spec.name).await?;
        let mut state = self.state();
        if state.units.contains_key(&spec.name) {
            return Err(HypervisorError::Rejected(format!(
                "unit {} already exists",
                spec.name
            )));
        }
        state.units.insert(
            spec.name.clone(),
            FakeUnit {
                spec: spec.clone(),
                running: false,
                devices: Vec::new(),
            },
        );
        Ok(())
    }

    async fn start_unit(&self, name: &str) -> Result<(), HypervisorError> {
        self.enter(FakeOp::Start, name).await?;
        let mut state = self.state();
        let unit = state
            .units
            .get_mut(name)
            .ok_or_else(|| HypervisorError::UnitNotFound(name.to_string()))?;
        unit.running = true;
        Ok(())
    }

    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<String, HypervisorError> {
        {
            let mut state = self.state();
            state.execs.push(ExecCall {
                unit: name.to_string(),
                argv: argv.to_vec(),
                stdin: stdin.map(|b| String::from_utf8_lossy(b).into_owned()),
            });
        }
        self.enter(FakeOp::Exec, name).await?;
        let state = self.state();
        match state.units.get(name) {
            Some(unit) if unit.running => Ok(String::new()),
            Some(_) => Err(HypervisorError::Rejected(format!("unit {} is not running", name))),
            None => Err(HypervisorError::UnitNotFound(name.to_string())),
        }
    }

    async fn add_proxy_device(
        &self,
        name: &str,
        device: &ProxyDevice,
    ) -> Result<(), HypervisorError> {
        self.enter(FakeOp::AddDevice, name).await?;
        let mut state = self.state();
        let clash = state.units.values().any(|u| {
            u.devices
                .iter()
                .any(|d| d.listen_ip == device.listen_ip && d.listen_port == device.listen_port)
        });
        if clash {
            return Err(HypervisorError::Rejected(format!(
                "address already in use: {}:{}",
                device.listen_ip, device.listen_port
            )));
        }
        let unit = state
            .units
            .get_mut(name)
            .ok_or_else(|| HypervisorError::UnitNotFound(name.to_string()))?;
        unit.devices.push(device.clone());
        Ok(())
    }

    async fn remove_device(&self, name: &str, device: &str) -> Result<(), HypervisorError> {
        self.enter(FakeOp::RemoveDevice, name).await?;
        let mut state = self.state();
        let unit = state
            .units
            .get_mut(name)
            .ok_or_else(|| HypervisorError::UnitNotFound(name.to_string()))?;
        unit.devices.retain(|d| d.name != device);
        Ok(())
    }

    async fn stop_unit(&self, name: &str) -> Result<(), HypervisorError> {
        self.enter(FakeOp::Stop, name).await?;
        let mut state = self.state();
        let unit = state
            .units
            .get_mut(name)
            .ok_or_else(|| HypervisorError::UnitNotFound(name.to_string()))?;
        unit.running = false;
        Ok(())
    }

    async fn delete_unit(&self, name: &str) -> Result<(), HypervisorError> {
        self.enter(FakeOp::Delete, name).await?;
        self.state()
            .units
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HypervisorError::UnitNotFound(name.to_string()))
    }

    async fn unit_exists(&self, name: &str) -> Result<bool, HypervisorError> {
        Ok(self.state().units.contains_key(name))
    }

    async fn list_units(&self) -> Result<Vec<String>, HypervisorError> {
        self.enter(FakeOp::List, "").await?;
        Ok(self.state().units.keys().cloned().collect())
    }
}
