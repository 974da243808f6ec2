//! Runtime adapter seam
//!
//! The harness never talks to docker directly; everything goes through the
//! [`ContainerRuntime`] trait so tests can substitute an in-memory fake.
//! [`DockerCli`] is the production implementation and shells out to the
//! `docker` binary.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;

/// Request object for launching one container.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Fully-qualified image reference (already namespaced).
    pub image: String,
    /// Command passed after the image name.
    pub command: Vec<String>,
    /// Bind mounts: (host path, container path).
    pub mounts: Vec<(PathBuf, String)>,
    /// Environment variables. Ordered map so argument order is stable.
    pub env: BTreeMap<String, String>,
    /// Extra raw flags (e.g. `--rm`, `--publish=...`).
    pub flags: Vec<String>,
    /// Network to join, if any.
    pub network: Option<String>,
    /// Container name, if pinned.
    pub container_name: Option<String>,
    /// Hostname inside the container; doubles as the network alias when a
    /// network is joined.
    pub host_alias: Option<String>,
    /// Detached launches emit the container id on stdout.
    pub detached: bool,
}

impl LaunchSpec {
    pub fn new(image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            image: image.into(),
            command,
            mounts: Vec::new(),
            env: BTreeMap::new(),
            flags: Vec::new(),
            network: None,
            container_name: None,
            host_alias: None,
            detached: false,
        }
    }

    pub fn mount(mut self, host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        self.mounts.push((host.into(), container.into()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }
}

/// Captured outcome of a successful launch.
#[derive(Debug, Clone)]
pub struct LaunchOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Container lifecycle operations the harness needs.
///
/// Operations that require success return `Err(Error::Runtime)` on a
/// non-zero exit; callers treat that as a hard, unretried failure.
pub trait ContainerRuntime: Send + Sync {
    /// Run a container. For detached launches the returned stdout carries
    /// the container id.
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchOutput>;

    /// Whether a container with this id currently exists.
    fn inspect_container(&self, id: &str) -> Result<bool>;

    /// Stop a running container, allowing it `grace_secs` to exit.
    fn stop_container(&self, id: &str, grace_secs: u32) -> Result<()>;

    /// Remove a stopped container.
    fn remove_container(&self, id: &str) -> Result<()>;

    /// Whether a named network exists.
    fn network_exists(&self, name: &str) -> Result<bool>;

    fn create_network(&self, name: &str) -> Result<()>;

    fn remove_network(&self, name: &str) -> Result<()>;
}

/// Production runtime: drives the `docker` CLI.
#[derive(Debug, Clone, Default)]
pub struct DockerCli;

impl DockerCli {
    pub fn new() -> Self {
        Self
    }

    fn run(&self, args: &[String]) -> Result<std::process::Output> {
        tracing::debug!("[DockerCli] docker {}", args.join(" "));
        let output = Command::new("docker").args(args).output()?;
        Ok(output)
    }

    /// Run and require a zero exit.
    fn run_checked(&self, args: &[String]) -> Result<std::process::Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(Error::Runtime(format!(
                "docker {} exited with {:?}: {}",
                args.join(" "),
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }
}

impl ContainerRuntime for DockerCli {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchOutput> {
        let mut args: Vec<String> = vec!["run".into()];
        args.extend(spec.flags.iter().cloned());
        if spec.detached {
            args.push("-d".into());
        }
        for (host, container) in &spec.mounts {
            args.push("-v".into());
            args.push(format!("{}:{}", host.display(), container));
        }
        for (key, value) in &spec.env {
            args.push("--env".into());
            args.push(format!("{key}={value}"));
        }
        if let Some(name) = &spec.container_name {
            args.push("--name".into());
            args.push(name.clone());
        }
        if let Some(alias) = &spec.host_alias {
            args.push("--hostname".into());
            args.push(alias.clone());
        }
        if let Some(network) = &spec.network {
            args.push("--network".into());
            args.push(network.clone());
            if let Some(alias) = &spec.host_alias {
                args.push("--network-alias".into());
                args.push(alias.clone());
            }
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());

        let output = self.run_checked(&args)?;
        Ok(LaunchOutput {
            exit_code: output.status.code().unwrap_or(0),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn inspect_container(&self, id: &str) -> Result<bool> {
        let output = self.run(&["container".into(), "inspect".into(), id.into()])?;
        Ok(output.status.success())
    }

    fn stop_container(&self, id: &str, grace_secs: u32) -> Result<()> {
        self.run_checked(&[
            "container".into(),
            "stop".into(),
            format!("--time={grace_secs}"),
            id.into(),
        ])?;
        Ok(())
    }

    fn remove_container(&self, id: &str) -> Result<()> {
        self.run_checked(&["container".into(), "rm".into(), id.into()])?;
        Ok(())
    }

    fn network_exists(&self, name: &str) -> Result<bool> {
        let output = self.run(&["network".into(), "inspect".into(), name.into()])?;
        Ok(output.status.success())
    }

    fn create_network(&self, name: &str) -> Result<()> {
        self.run_checked(&["network".into(), "create".into(), name.into()])?;
        Ok(())
    }

    fn remove_network(&self, name: &str) -> Result<()> {
        self.run_checked(&["network".into(), "rm".into(), name.into()])?;
        Ok(())
    }
}
