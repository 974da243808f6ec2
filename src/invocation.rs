//! One-shot function invocations
//!
//! A function invocation is a containerized operation with no persistent
//! state: the container is auto-removed and only its captured output
//! matters. The attestation client is the main user.

use crate::error::Result;
use crate::namespace::Namespace;
use crate::runtime::{ContainerRuntime, LaunchOutput, LaunchSpec};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct FunctionInvocation {
    namespace: Namespace,
    /// Unqualified image name, resolved through the namespace.
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<(PathBuf, String)>,
    pub network: Option<String>,
    pub container_name: Option<String>,
    pub host_alias: Option<String>,
}

impl FunctionInvocation {
    pub fn new(namespace: Namespace, image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            namespace,
            image: image.into(),
            command,
            env: BTreeMap::new(),
            mounts: Vec::new(),
            network: None,
            container_name: None,
            host_alias: None,
        }
    }

    /// Run to completion in an auto-removed container.
    pub fn run(&self, runtime: &dyn ContainerRuntime) -> Result<LaunchOutput> {
        let mut launch = LaunchSpec::new(
            self.namespace.image_name(&self.image),
            self.command.clone(),
        )
        .flag("-t")
        .flag("--rm");
        for (host, container) in &self.mounts {
            launch = launch.mount(host.clone(), container.clone());
        }
        for (key, value) in &self.env {
            launch = launch.env(key.clone(), value.clone());
        }
        launch.network = self.network.clone();
        // Namespaced like every other docker object this crate names.
        launch.container_name = self
            .container_name
            .as_deref()
            .map(|name| self.namespace.object_name(name));
        launch.host_alias = self.host_alias.clone();
        runtime.launch(&launch)
    }
}

/// The attestation client preset: points the stock client container at one
/// target instance and the attestation service.
///
/// `tcti` is a tpm2-tools transport string such as
/// `swtpm:host=swtpmsvc0,port=9876`; `name` keeps concurrent client
/// containers from colliding.
pub fn attest_client(
    namespace: Namespace,
    attest_url: &str,
    tcti: &str,
    verifier: Option<&Path>,
    name: &str,
    network: Option<String>,
) -> FunctionInvocation {
    let mut inv = FunctionInvocation::new(
        namespace,
        "client",
        vec!["/hcp/client/run_client.sh".into()],
    );
    inv.env
        .insert("HCP_CLIENT_ATTEST_URL".into(), attest_url.into());
    inv.env
        .insert("HCP_RUN_CLIENT_TPM2TOOLS_TCTI".into(), tcti.into());
    if let Some(signer) = verifier {
        inv.mounts.push((signer.to_path_buf(), "/signer".into()));
        inv.env
            .insert("HCP_RUN_CLIENT_VERIFIER".into(), "/signer".into());
    }
    inv.container_name = Some(name.to_string());
    inv.host_alias = Some(name.to_string());
    inv.network = network;
    inv
}
