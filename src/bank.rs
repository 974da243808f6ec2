//! The instance bank
//!
//! A bank is a fixed-size pool of swtpm service instances under one base
//! directory, used as the substrate for soak testing. On-disk layout:
//!
//! - `<dir>/num`           persisted entry count (may only grow)
//! - `<dir>/t<i>/`         one service instance per entry
//! - `<dir>/t<i>/enrolled` local source of truth for enrollment state
//! - `<dir>/t<i>/lock`     per-entry cross-process lock file
//!
//! Each entry is enrolled against a hostname derived from its own EK: we
//! hash *both* encodings (raw TPM2B_PUBLIC and PEM) so the mapping stays
//! stable no matter which of them the remote service indexes by, and so the
//! `find` operation gets exercised on unenroll.

use crate::enroll::EnrollClient;
use crate::error::{Error, Result};
use crate::instance::{swtpm_service, ServiceInstance};
use crate::lock::EntryLock;
use crate::namespace::Namespace;
use crate::network::SharedNetwork;
use crate::runtime::ContainerRuntime;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Domain appended to every derived hostname.
pub const HOSTNAME_DOMAIN: &str = ".nothing.xyz";

/// Derive an entry's enrollment hostname from its EK files: first 4 bytes of
/// sha256(ek.pub bytes || ek.pem bytes), hex-encoded, plus the fixed domain.
pub fn hostname_from_ek(ek_pub: &Path, ek_pem: &Path) -> Result<String> {
    let mut digest = Sha256::new();
    digest.update(fs::read(ek_pub)?);
    digest.update(fs::read(ek_pem)?);
    let digest = digest.finalize();
    Ok(format!("{}{}", hex::encode(&digest[..4]), HOSTNAME_DOMAIN))
}

/// Everything needed to open a bank. Passed explicitly; there are no
/// ambient defaults.
#[derive(Debug, Clone)]
pub struct BankConfig {
    pub path: PathBuf,
    /// Requested entry count. Zero means "attach to whatever exists".
    pub num: usize,
    pub namespace: Namespace,
    pub enroll_api: String,
}

/// A bank entry's service instance is materialized lazily: until an
/// operation needs the real handle, only the path is known.
#[derive(Debug)]
pub enum InstanceSlot {
    Reference(PathBuf),
    Attached(ServiceInstance),
}

#[derive(Debug)]
pub struct BankEntry {
    index: usize,
    path: PathBuf,
    lock: EntryLock,
    slot: InstanceSlot,
    hostname: Option<String>,
    /// The remote service's identifier for this entry, resolved lazily via
    /// `find` and cached; stable for the lifetime of the EK.
    ekpubhash: Option<String>,
}

impl BankEntry {
    fn new(index: usize, path: PathBuf) -> Self {
        let lock = EntryLock::new(path.join("lock"));
        Self {
            index,
            path: path.clone(),
            lock,
            slot: InstanceSlot::Reference(path),
            hostname: None,
            ekpubhash: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ek_pub_path(&self) -> PathBuf {
        self.path.join("state/tpm/ek.pub")
    }

    pub fn ek_pem_path(&self) -> PathBuf {
        self.path.join("state/tpm/ek.pem")
    }

    pub fn enrolled_marker(&self) -> PathBuf {
        self.path.join("enrolled")
    }

    pub fn lock(&self) -> &EntryLock {
        &self.lock
    }

    /// Local source of truth for enrollment state.
    pub fn enrolled(&self) -> bool {
        self.enrolled_marker().is_file()
    }

    pub fn hostname(&self) -> Result<&str> {
        self.hostname
            .as_deref()
            .ok_or_else(|| Error::Config(format!("entry {} not initialized", self.index)))
    }

    pub fn ekpubhash(&self) -> Option<&str> {
        self.ekpubhash.as_deref()
    }

    /// Materialize the service instance handle for this entry.
    fn instance(
        &mut self,
        namespace: &Namespace,
        network: Option<String>,
    ) -> &mut ServiceInstance {
        if let InstanceSlot::Reference(path) = &self.slot {
            let spec = swtpm_service(self.index, None, None, None, network);
            let instance = ServiceInstance::new(namespace.clone(), spec, path.clone());
            self.slot = InstanceSlot::Attached(instance);
        }
        match &mut self.slot {
            InstanceSlot::Attached(instance) => instance,
            InstanceSlot::Reference(_) => unreachable!("slot attached above"),
        }
    }

    fn set_enrolled(&mut self, enrolled: bool) -> Result<()> {
        let marker = self.enrolled_marker();
        if enrolled && !marker.is_file() {
            fs::File::create(&marker)?;
        } else if !enrolled && marker.is_file() {
            fs::remove_file(&marker)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Bank {
    namespace: Namespace,
    enroll_api: String,
    path: PathBuf,
    num: usize,
    entries: Vec<BankEntry>,
    network: SharedNetwork,
}

impl Bank {
    /// Attach to an existing bank or create a new one.
    ///
    /// A persisted size smaller than the requested one grows the bank; a
    /// persisted size larger than a non-zero request is an error. The
    /// resolved size must be non-zero.
    pub fn open(config: BankConfig, runtime: &dyn ContainerRuntime) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        let num_file = config.path.join("num");
        let num = if num_file.is_file() {
            let persisted: usize = fs::read_to_string(&num_file)?
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("corrupt size record: {e}")))?;
            tracing::info!("[Bank] Latching to existing bank of size {persisted}");
            if persisted < config.num {
                tracing::info!("[Bank] Expanding bank from {persisted} to {}", config.num);
                fs::write(&num_file, config.num.to_string())?;
                config.num
            } else if persisted > config.num && config.num > 0 {
                return Err(Error::Config(format!(
                    "real bank size {persisted} bigger than {}",
                    config.num
                )));
            } else {
                persisted
            }
        } else {
            tracing::info!("[Bank] Initializing new bank of size {}", config.num);
            fs::write(&num_file, config.num.to_string())?;
            config.num
        };
        if num == 0 {
            return Err(Error::Config("bank size must be non-zero".into()));
        }

        let entries = (0..num)
            .map(|i| BankEntry::new(i, config.path.join(format!("t{i}"))))
            .collect();
        let network = SharedNetwork::probe(runtime, &config.namespace)?;
        Ok(Self {
            namespace: config.namespace,
            enroll_api: config.enroll_api,
            path: config.path,
            num,
            entries,
            network,
        })
    }

    pub fn num(&self) -> usize {
        self.num
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn enroll_api(&self) -> &str {
        &self.enroll_api
    }

    pub fn entries(&self) -> &[BankEntry] {
        &self.entries
    }

    pub fn network_mut(&mut self) -> &mut SharedNetwork {
        &mut self.network
    }

    /// Initialize every entry: materialize and initialize its instance,
    /// derive its hostname, and reconcile the local enrolled marker against
    /// the remote service so a crashed run can be re-attached safely.
    pub fn initialize(
        &mut self,
        runtime: &dyn ContainerRuntime,
        enroll: &EnrollClient,
    ) -> Result<()> {
        let namespace = self.namespace.clone();
        let network_name = self.network.name().to_string();
        for entry in &mut self.entries {
            entry
                .instance(&namespace, Some(network_name.clone()))
                .initialize(runtime)?;
            if entry.hostname.is_none() {
                entry.hostname =
                    Some(hostname_from_ek(&entry.ek_pub_path(), &entry.ek_pem_path())?);
            }
            let hostname = entry.hostname()?.to_string();
            let ids = enroll.find(&hostname)?;
            match ids.as_slice() {
                [] => {
                    entry.ekpubhash = None;
                    if entry.enrolled() {
                        tracing::info!(
                            "[Bank] Entry {} marked enrolled but unknown remotely, clearing",
                            entry.index
                        );
                    }
                    entry.set_enrolled(false)?;
                }
                [id] => {
                    entry.ekpubhash = Some(id.clone());
                    if !entry.enrolled() {
                        tracing::info!(
                            "[Bank] Entry {} enrolled remotely as {id}, restoring marker",
                            entry.index
                        );
                    }
                    entry.set_enrolled(true)?;
                }
                ids => {
                    return Err(Error::Consistency(format!(
                        "find returned {} identifiers for {hostname}",
                        ids.len()
                    )));
                }
            }
            tracing::info!(
                "[Bank] Initialized {} at {} ({hostname})",
                entry.index,
                entry.path.display()
            );
        }
        Ok(())
    }

    /// Tear the bank down: every instance, every marker, the size record and
    /// the base directory.
    ///
    /// Entries still enrolled remotely are NOT unenrolled first; run the
    /// unenroll sweep beforehand if the remote side should be cleaned up.
    pub fn delete(&mut self, runtime: &dyn ContainerRuntime) -> Result<()> {
        let namespace = self.namespace.clone();
        for entry in &mut self.entries {
            tracing::info!("[Bank] Deleting {} at {}", entry.index, entry.path.display());
            entry.set_enrolled(false)?;
            let lock_path = entry.lock.path().to_path_buf();
            if lock_path.is_file() {
                fs::remove_file(&lock_path)?;
            }
            entry.instance(&namespace, None).delete(runtime)?;
        }
        fs::remove_file(self.path.join("num"))?;
        fs::remove_dir(&self.path)?;
        Ok(())
    }

    /// Enroll every entry that is not already enrolled. Aborts on the first
    /// failure.
    pub fn enroll_all(&mut self, enroll: &EnrollClient) -> Result<()> {
        for entry in &mut self.entries {
            if entry.enrolled() {
                continue;
            }
            let hostname = entry.hostname()?.to_string();
            tracing::info!("[Bank] Enrolling {} as {hostname}", entry.index);
            enroll.add(&entry.ek_pub_path(), &hostname)?;
            entry.set_enrolled(true)?;
        }
        Ok(())
    }

    /// Unenroll every enrolled entry, resolving identifiers via `find` where
    /// not already cached. Aborts on the first failure.
    pub fn unenroll_all(&mut self, enroll: &EnrollClient) -> Result<()> {
        for entry in &mut self.entries {
            if !entry.enrolled() {
                continue;
            }
            let hostname = entry.hostname()?.to_string();
            let id = match &entry.ekpubhash {
                Some(id) => id.clone(),
                None => {
                    let ids = enroll.find(&hostname)?;
                    let id = match ids.as_slice() {
                        [id] => id.clone(),
                        ids => {
                            return Err(Error::Consistency(format!(
                                "find returned {} identifiers for {hostname}",
                                ids.len()
                            )));
                        }
                    };
                    entry.ekpubhash = Some(id.clone());
                    id
                }
            };
            tracing::info!("[Bank] Unenrolling {} ({id})", entry.index);
            enroll.delete(&id)?;
            entry.set_enrolled(false)?;
        }
        Ok(())
    }

    /// Start every instance. Already-running instances are skipped by the
    /// instance state machine itself.
    pub fn start_all(&mut self, runtime: &dyn ContainerRuntime) -> Result<()> {
        self.network.ensure_started(runtime)?;
        let namespace = self.namespace.clone();
        let network_name = self.network.name().to_string();
        for entry in &mut self.entries {
            entry
                .instance(&namespace, Some(network_name.clone()))
                .start(runtime)?;
        }
        Ok(())
    }

    /// Stop every instance; not-running instances are a no-op.
    pub fn stop_all(&mut self, runtime: &dyn ContainerRuntime) -> Result<()> {
        let namespace = self.namespace.clone();
        let network_name = self.network.name().to_string();
        for entry in &mut self.entries {
            entry
                .instance(&namespace, Some(network_name.clone()))
                .stop(runtime)?;
        }
        Ok(())
    }
}
