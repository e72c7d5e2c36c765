use async_trait::async_trait;
use log::debug;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::configuration::types::HypervisorConfig;
use crate::container_management::hypervisor::Hypervisor;
use crate::container_management::types::{ProxyDevice, UnitSpec};
use crate::error_handling::types::HypervisorError;

/// [`Hypervisor`] backed by the LXD `lxc` command line client.
///
/// Each call spawns one `lxc` process and waits for it to exit, which is
/// LXD's own acknowledgment. Children are spawned with `kill_on_drop`, so a
/// caller that times out and drops the future also kills the client.
pub struct LxcHypervisor {
    binary: String,
    remote: Option<String>,
}

impl LxcHypervisor {
    pub fn new(binary: impl Into<String>, remote: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            remote,
        }
    }

    pub fn from_config(config: &HypervisorConfig) -> Self {
        Self::new(config.lxc_binary.clone(), config.remote.clone())
    }

    /// `name` qualified with the configured remote, if any.
    fn target(&self, name: &str) -> String {
        match &self.remote {
            Some(remote) => format!("{}:{}", remote, name),
            None => name.to_string(),
        }
    }

    async fn run(
        &self,
        unit: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<String, HypervisorError> {
        // stdin may carry secrets and is never logged; argv never does.
        debug!("Running {} {}", self.binary, args.join(" "));

        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(input) = stdin {
            if let Some(mut handle) = child.stdin.take() {
                handle.write_all(input).await?;
                handle.shutdown().await?;
            }
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let program = format!("{} {}", self.binary, args.first().map(String::as_str).unwrap_or(""));
        Err(classify(unit, program, output.status.code(), stderr))
    }
}

/// Maps a failed `lxc` invocation onto the error the orchestrator acts on.
fn classify(unit: &str, program: String, status: Option<i32>, stderr: String) -> HypervisorError {
    if names_missing_instance(&stderr) {
        return HypervisorError::UnitNotFound(unit.to_string());
    }
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("already exists") || lower.contains("address already in use") {
        return HypervisorError::Rejected(stderr);
    }
    HypervisorError::CommandFailed {
        program,
        status,
        stderr,
    }
}

/// Whether LXD says the instance itself is unknown. Images, storage pools,
/// networks and profiles have "not found" errors of their own, and those
/// mean the unit may well exist.
fn names_missing_instance(stderr: &str) -> bool {
    stderr.lines().any(|line| {
        let line = line.trim().to_ascii_lowercase();
        line.ends_with("instance not found") || line == "error: not found"
    })
}

fn is_already_stopped(err: &HypervisorError) -> bool {
    matches!(err, HypervisorError::CommandFailed { stderr, .. }
        if stderr.to_ascii_lowercase().contains("already stopped"))
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

pub(crate) fn init_args(target: &str, spec: &UnitSpec) -> Vec<String> {
    vec![
        "init".to_string(),
        spec.image.clone(),
        target.to_string(),
        "-c".to_string(),
        format!("limits.memory={}MB", spec.ram_mb),
        "-c".to_string(),
        format!("limits.cpu={}", spec.cpu_limit),
    ]
}

pub(crate) fn proxy_args(target: &str, device: &ProxyDevice) -> Vec<String> {
    vec![
        "config".to_string(),
        "device".to_string(),
        "add".to_string(),
        target.to_string(),
        device.name.clone(),
        "proxy".to_string(),
        format!("listen=tcp:{}:{}", device.listen_ip, device.listen_port),
        format!("connect=tcp:127.0.0.1:{}", device.connect_port),
    ]
}

#[async_trait]
impl Hypervisor for LxcHypervisor {
    async fn create_unit(&self, spec: &UnitSpec) -> Result<(), HypervisorError> {
        let args = init_args(&self.target(&spec.name), spec);
        self.run(&spec.name, &args, None).await.map(|_| ())
    }

    async fn start_unit(&self, name: &str) -> Result<(), HypervisorError> {
        let target = self.target(name);
        self.run(name, &strings(&["start", &target]), None)
            .await
            .map(|_| ())
    }

    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<String, HypervisorError> {
        let mut args = strings(&["exec", &self.target(name), "--"]);
        args.extend(argv.iter().cloned());
        self.run(name, &args, stdin).await
    }

    async fn add_proxy_device(
        &self,
        name: &str,
        device: &ProxyDevice,
    ) -> Result<(), HypervisorError> {
        let args = proxy_args(&self.target(name), device);
        self.run(name, &args, None).await.map(|_| ())
    }

    async fn remove_device(&self, name: &str, device: &str) -> Result<(), HypervisorError> {
        let target = self.target(name);
        self.run(
            name,
            &strings(&["config", "device", "remove", &target, device]),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn stop_unit(&self, name: &str) -> Result<(), HypervisorError> {
        let target = self.target(name);
        match self
            .run(name, &strings(&["stop", &target, "--force"]), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_already_stopped(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_unit(&self, name: &str) -> Result<(), HypervisorError> {
        let target = self.target(name);
        self.run(name, &strings(&["delete", &target, "--force"]), None)
            .await
            .map(|_| ())
    }

    async fn unit_exists(&self, name: &str) -> Result<bool, HypervisorError> {
        let target = self.target(name);
        match self.run(name, &strings(&["info", &target]), None).await {
            Ok(_) => Ok(true),
            Err(HypervisorError::UnitNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_units(&self) -> Result<Vec<String>, HypervisorError> {
        let mut args = strings(&["list"]);
        if let Some(remote) = &self.remote {
            args.push(format!("{}:", remote));
        }
        args.extend(strings(&["--format", "csv", "-c", "n"]));
        let stdout = self.run("", &args, None).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}
