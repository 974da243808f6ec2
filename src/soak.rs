//! Soak driver
//!
//! Sustained randomized concurrent load: each worker repeatedly picks a
//! random bank entry, takes its cross-process lock, and performs an enroll,
//! attest or unenroll depending on the entry's local state and the
//! configured attest bias.
//!
//! Workers are isolated: each owns a plain-data copy of the entry table and
//! its own enrollment client, and coordinates with its siblings only through
//! the per-entry lock files. Contention is handled by resampling another
//! entry, not by queueing; with many more entries than workers this
//! converges quickly and needs no shared scheduler state.

use crate::bank::Bank;
use crate::enroll::EnrollClient;
use crate::error::{Error, Result};
use crate::instance::SWTPM_PORT;
use crate::invocation::attest_client;
use crate::lock::EntryLock;
use crate::namespace::Namespace;
use crate::runtime::ContainerRuntime;
use rand::Rng;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone)]
pub struct AttestConfig {
    pub attest_url: String,
    /// Asset-signer public key, mounted into the client as its verifier.
    pub verifier: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SoakOptions {
    /// Iterations per worker.
    pub iterations: u32,
    pub workers: u32,
    /// Percentage of iterations on an enrolled entry that attest instead of
    /// unenrolling. 0 = never attest, 100 = always.
    pub attest_percent: u32,
    pub attest: Option<AttestConfig>,
}

impl SoakOptions {
    pub fn validate(&self) -> Result<()> {
        if self.iterations < 1 {
            return Err(Error::Config(format!(
                "illegal loop value ({})",
                self.iterations
            )));
        }
        if self.workers < 1 {
            return Err(Error::Config(format!(
                "illegal threads value ({})",
                self.workers
            )));
        }
        if self.attest_percent > 100 {
            return Err(Error::Config(format!(
                "illegal attest percentage ({})",
                self.attest_percent
            )));
        }
        if self.attest_percent > 0 && self.attest.is_none() {
            return Err(Error::Config(
                "attest percentage set but no attestation service configured".into(),
            ));
        }
        Ok(())
    }
}

/// Plain-data view of one bank entry, safe to hand to an isolated worker.
#[derive(Debug, Clone)]
struct SoakEntry {
    index: usize,
    hostname: String,
    ek_pub: PathBuf,
    ek_pem: PathBuf,
    marker: PathBuf,
    lock_path: PathBuf,
}

/// Run the soak workload and block until every worker has finished.
///
/// A failing worker terminates only itself; its error is logged, not
/// re-raised, and its siblings run to natural completion.
pub fn run(bank: &mut Bank, runtime: Arc<dyn ContainerRuntime>, opts: &SoakOptions) -> Result<()> {
    opts.validate()?;
    if opts.attest_percent > 0 {
        // Attest clients join the shared network to reach their instance.
        bank.network_mut().ensure_started(&*runtime)?;
    }
    let network_name = bank.network_mut().name().to_string();
    let namespace = bank.namespace().clone();
    let enroll_api = bank.enroll_api().to_string();

    let mut entries = Vec::with_capacity(bank.num());
    for entry in bank.entries() {
        entries.push(SoakEntry {
            index: entry.index(),
            hostname: entry.hostname()?.to_string(),
            ek_pub: entry.ek_pub_path(),
            ek_pem: entry.ek_pem_path(),
            marker: entry.enrolled_marker(),
            lock_path: entry.lock().path().to_path_buf(),
        });
    }

    let mut workers = Vec::with_capacity(opts.workers as usize);
    for worker_id in 0..opts.workers {
        let entries = entries.clone();
        let opts = opts.clone();
        let namespace = namespace.clone();
        let network_name = network_name.clone();
        let enroll_api = enroll_api.clone();
        let runtime = Arc::clone(&runtime);
        workers.push(thread::spawn(move || {
            soak_worker(
                worker_id,
                entries,
                opts,
                namespace,
                network_name,
                enroll_api,
                runtime,
            )
        }));
    }
    for (worker_id, handle) in workers.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("[Soak] worker {worker_id} failed: {e}"),
            Err(_) => tracing::error!("[Soak] worker {worker_id} panicked"),
        }
    }
    Ok(())
}

fn soak_worker(
    worker_id: u32,
    entries: Vec<SoakEntry>,
    opts: SoakOptions,
    namespace: Namespace,
    network_name: String,
    enroll_api: String,
    runtime: Arc<dyn ContainerRuntime>,
) -> Result<()> {
    let enroll = EnrollClient::new(enroll_api)?;
    let mut rng = rand::thread_rng();
    // Worker-local identifier cache; the remote identifier is stable for an
    // EK's lifetime, so re-resolving per worker is merely redundant.
    let mut cached: Vec<Option<String>> = vec![None; entries.len()];

    for _ in 0..opts.iterations {
        // Resample until we find an uncontended entry. The lock is held for
        // the whole iteration: remote call plus local marker update.
        let (idx, guard) = loop {
            let idx = rng.gen_range(0..entries.len());
            match EntryLock::new(&entries[idx].lock_path).try_acquire()? {
                Some(guard) => break (idx, guard),
                None => thread::yield_now(),
            }
        };
        let entry = &entries[idx];

        if !entry.marker.is_file() {
            // Exercise both EK encodings: the service must index them to the
            // same identity.
            let (encoding, path) = if rng.gen_range(0..2) == 0 {
                ("TPM2B_PUBLIC", &entry.ek_pub)
            } else {
                ("PEM", &entry.ek_pem)
            };
            tracing::info!(
                "[Soak] w{worker_id}: {} unenrolled, enrolling ({encoding})",
                entry.index
            );
            enroll.add(path, &entry.hostname)?;
            fs::File::create(&entry.marker)?;
        } else if opts.attest_percent > rng.gen_range(0..100) {
            tracing::info!("[Soak] w{worker_id}: {} enrolled, attesting", entry.index);
            let attest = opts.attest.as_ref().ok_or_else(|| {
                Error::Config("attestation requested but not configured".into())
            })?;
            let tcti = format!("swtpm:host=swtpmsvc{},port={SWTPM_PORT}", entry.index);
            let client = attest_client(
                namespace.clone(),
                &attest.attest_url,
                &tcti,
                attest.verifier.as_deref(),
                &format!("client{}", entry.index),
                Some(network_name.clone()),
            );
            client.run(&*runtime)?;
        } else {
            tracing::info!("[Soak] w{worker_id}: {} enrolled, unenrolling", entry.index);
            let id = match &cached[idx] {
                Some(id) => id.clone(),
                None => {
                    let ids = enroll.find(&entry.hostname)?;
                    let id = match ids.as_slice() {
                        [id] => id.clone(),
                        ids => {
                            return Err(Error::Consistency(format!(
                                "find returned {} identifiers for {}",
                                ids.len(),
                                entry.hostname
                            )));
                        }
                    };
                    tracing::info!("[Soak] w{worker_id}: lazy-init ekpubhash={id}");
                    cached[idx] = Some(id.clone());
                    id
                }
            };
            enroll.delete(&id)?;
            fs::remove_file(&entry.marker)?;
        }
        drop(guard);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_opts() -> SoakOptions {
        SoakOptions {
            iterations: 20,
            workers: 1,
            attest_percent: 0,
            attest: None,
        }
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(base_opts().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_iterations_and_workers() {
        let mut opts = base_opts();
        opts.iterations = 0;
        assert!(opts.validate().is_err());

        let mut opts = base_opts();
        opts.workers = 0;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn validate_rejects_attest_bias_without_config() {
        let mut opts = base_opts();
        opts.attest_percent = 101;
        assert!(opts.validate().is_err());

        let mut opts = base_opts();
        opts.attest_percent = 50;
        assert!(opts.validate().is_err());
        opts.attest = Some(AttestConfig {
            attest_url: "http://attest.local:8080".into(),
            verifier: None,
        });
        assert!(opts.validate().is_ok());
    }
}
