//! Shared network handle
//!
//! All instances of a deployment join one named network. The handle creates
//! it lazily on first use and remembers whether it existed beforehand, so
//! teardown only ever removes a network this process created.

use crate::error::Result;
use crate::namespace::Namespace;
use crate::runtime::ContainerRuntime;

#[derive(Debug)]
pub struct SharedNetwork {
    name: String,
    pre_existing: bool,
    started: bool,
}

impl SharedNetwork {
    /// Probe for the namespace's network. Does not create anything.
    pub fn probe(runtime: &dyn ContainerRuntime, namespace: &Namespace) -> Result<Self> {
        let name = namespace.network_name();
        let pre_existing = runtime.network_exists(&name)?;
        Ok(Self {
            name,
            pre_existing,
            started: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pre_existing(&self) -> bool {
        self.pre_existing
    }

    /// Create the network if this handle has not already done so and it did
    /// not pre-exist. Safe to call before every launch that joins it.
    pub fn ensure_started(&mut self, runtime: &dyn ContainerRuntime) -> Result<()> {
        if !self.pre_existing && !self.started {
            tracing::info!("[Network] Creating shared network {}", self.name);
            runtime.create_network(&self.name)?;
            self.started = true;
        }
        Ok(())
    }

    /// Remove the network, but only if this handle created it.
    ///
    /// There is no reference counting: if several independent processes
    /// attach to a network one of them created, whichever creator cleans up
    /// first tears it down under the others.
    pub fn cleanup(&mut self, runtime: &dyn ContainerRuntime) -> Result<()> {
        if self.started && !self.pre_existing {
            tracing::info!("[Network] Removing shared network {}", self.name);
            runtime.remove_network(&self.name)?;
            self.started = false;
        }
        Ok(())
    }
}
