//! Service instance lifecycle
//!
//! One long-running containerized service with a persistent state directory.
//! Lifecycle state lives on the filesystem so it survives process restarts:
//!
//! - `<dir>/state/`      service data, bind-mounted at `/state`
//! - `<dir>/initialized` marker; presence means setup has run
//! - `<dir>/cid`         container id, present only while running
//!
//! All operations are idempotent; a failed operation is recovered by simply
//! re-invoking it.

use crate::error::{Error, Result};
use crate::namespace::Namespace;
use crate::runtime::{ContainerRuntime, LaunchSpec};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Container port the swtpm service listens on.
pub const SWTPM_PORT: u16 = 9876;

/// Static description of a service: which image, how to set up state, how to
/// run, and how it presents itself on the shared network.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Unqualified image name, resolved through the namespace.
    pub image: String,
    /// One-shot setup command; runs once per instance, in an auto-removed
    /// container with `/state` mounted.
    pub setup_cmd: Vec<String>,
    /// Long-running service command, launched detached.
    pub start_cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Published port mappings: (host port, container port).
    pub ports: Vec<(u16, u16)>,
    pub container_name: Option<String>,
    pub host_alias: Option<String>,
    pub network: Option<String>,
}

/// The swtpm service preset. `index` keeps container names distinct when a
/// bank runs many instances side by side.
pub fn swtpm_service(
    index: usize,
    enroll_hostname: Option<&str>,
    enroll_api: Option<&str>,
    listen_port: Option<u16>,
    network: Option<String>,
) -> ServiceSpec {
    let mut env = BTreeMap::new();
    env.insert("HCP_SWTPMSVC_STATE_PREFIX".into(), "/state".into());
    env.insert(
        "HCP_SWTPMSVC_ENROLL_HOSTNAME".into(),
        enroll_hostname.unwrap_or("nada.nothing.xyz").into(),
    );
    if let Some(api) = enroll_api {
        env.insert("HCP_SWTPMSVC_ENROLL_API".into(), api.into());
    }
    let name = format!("swtpmsvc{index}");
    ServiceSpec {
        image: "swtpmsvc".into(),
        setup_cmd: vec!["/hcp/swtpmsvc/setup_swtpm.sh".into()],
        start_cmd: vec!["/hcp/swtpmsvc/run_swtpm.sh".into()],
        env,
        ports: listen_port.map(|p| (p, SWTPM_PORT)).into_iter().collect(),
        container_name: Some(name.clone()),
        host_alias: Some(name),
        network,
    }
}

/// One containerized service instance backed by a state directory.
#[derive(Debug)]
pub struct ServiceInstance {
    namespace: Namespace,
    spec: ServiceSpec,
    base_dir: PathBuf,
    running: bool,
    running_checked: bool,
}

impl ServiceInstance {
    pub fn new(namespace: Namespace, spec: ServiceSpec, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            namespace,
            spec,
            base_dir: base_dir.into(),
            running: false,
            running_checked: false,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn state_dir(&self) -> PathBuf {
        self.base_dir.join("state")
    }

    fn marker_path(&self) -> PathBuf {
        self.base_dir.join("initialized")
    }

    fn cid_path(&self) -> PathBuf {
        self.base_dir.join("cid")
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    /// Ensure the on-disk layout exists. Called before setup and again
    /// before teardown, since delete may run against a half-removed tree.
    fn materialize_layout(&self) -> Result<()> {
        fs::create_dir_all(self.state_dir())?;
        Ok(())
    }

    pub fn initialized(&self) -> bool {
        self.marker_path().is_file()
    }

    fn base_launch(&self, command: Vec<String>) -> LaunchSpec {
        let mut spec = LaunchSpec::new(self.namespace.image_name(&self.spec.image), command)
            .mount(self.state_dir(), "/state");
        for (key, value) in &self.spec.env {
            spec = spec.env(key.clone(), value.clone());
        }
        spec
    }

    /// Run the setup command once, guarded by the marker file, then perform
    /// the once-per-process running check.
    pub fn initialize(&mut self, runtime: &dyn ContainerRuntime) -> Result<()> {
        if !self.initialized() {
            self.materialize_layout()?;
            let launch = self
                .base_launch(self.spec.setup_cmd.clone())
                .flag("-t")
                .flag("--rm");
            runtime.launch(&launch)?;
            fs::File::create(self.marker_path())?;
            tracing::info!("[Instance] Initialized {}", self.base_dir.display());
        }
        if !self.running_checked {
            self.check_running(runtime)?;
        }
        Ok(())
    }

    /// Out-of-band running check: does the persisted container id still name
    /// a live container? Performed once per process lifetime; afterwards only
    /// start()/stop() update `running`.
    fn check_running(&mut self, runtime: &dyn ContainerRuntime) -> Result<()> {
        if let Some(cid) = self.read_cid()? {
            if runtime.inspect_container(&cid)? {
                self.running = true;
            }
        }
        self.running_checked = true;
        Ok(())
    }

    fn read_cid(&self) -> Result<Option<String>> {
        let path = self.cid_path();
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let cid = content.trim();
        if cid.is_empty() {
            return Ok(None);
        }
        Ok(Some(cid.to_string()))
    }

    pub fn running(&mut self, runtime: &dyn ContainerRuntime) -> Result<bool> {
        if !self.running_checked {
            self.check_running(runtime)?;
        }
        Ok(self.running)
    }

    /// Launch the service container detached. Implies initialize; no-op when
    /// already running.
    pub fn start(&mut self, runtime: &dyn ContainerRuntime) -> Result<()> {
        self.initialize(runtime)?;
        if self.running {
            return Ok(());
        }
        let mut launch = self.base_launch(self.spec.start_cmd.clone()).flag("-t");
        for (host, container) in &self.spec.ports {
            launch = launch.flag(format!("--publish={host}:{container}"));
        }
        // Container names resolve through the namespace so deployments with
        // different prefixes never collide; the alias stays raw, it is only
        // visible inside the shared network.
        launch.container_name = self
            .spec
            .container_name
            .as_deref()
            .map(|name| self.namespace.object_name(name));
        launch.host_alias = self.spec.host_alias.clone();
        launch.network = self.spec.network.clone();
        launch.detached = true;
        let output = runtime.launch(&launch)?;
        let cid = output.stdout.trim().to_string();
        if cid.is_empty() {
            return Err(Error::Runtime(format!(
                "detached launch of {} emitted no container id",
                self.spec.image
            )));
        }
        fs::write(self.cid_path(), &cid)?;
        self.running = true;
        tracing::info!("[Instance] Started {} ({cid})", self.base_dir.display());
        Ok(())
    }

    /// Stop and remove the service container. Implies initialize; no-op when
    /// not running.
    pub fn stop(&mut self, runtime: &dyn ContainerRuntime) -> Result<()> {
        self.initialize(runtime)?;
        if !self.running {
            return Ok(());
        }
        let cid = self.read_cid()?.ok_or_else(|| {
            Error::Runtime(format!(
                "instance {} is marked running but has no cid file",
                self.base_dir.display()
            ))
        })?;
        runtime.stop_container(&cid, 1)?;
        runtime.remove_container(&cid)?;
        fs::remove_file(self.cid_path())?;
        self.running = false;
        tracing::info!("[Instance] Stopped {}", self.base_dir.display());
        Ok(())
    }

    /// Tear down all persistent state.
    ///
    /// The state directory is emptied from inside a container because its
    /// contents may be owned by the container's users. A never-initialized
    /// instance degrades to base-directory removal.
    pub fn delete(&mut self, runtime: &dyn ContainerRuntime) -> Result<()> {
        if self.initialized() {
            self.materialize_layout()?;
            let launch = self
                .base_launch(vec![
                    "bash".into(),
                    "-c".into(),
                    "cd /state && rm -rf *".into(),
                ])
                .flag("-t")
                .flag("--rm");
            runtime.launch(&launch)?;
            fs::remove_dir(self.state_dir())?;
            fs::remove_file(self.marker_path())?;
        }
        if self.cid_path().is_file() {
            fs::remove_file(self.cid_path())?;
        }
        if self.base_dir.is_dir() {
            fs::remove_dir(&self.base_dir)?;
        }
        tracing::info!("[Instance] Deleted {}", self.base_dir.display());
        Ok(())
    }
}
