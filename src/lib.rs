//! ekbank: container-backed soak harness for enrollment/attestation services
//!
//! Manages a bank of containerized software-TPM service instances and drives
//! them through randomized concurrent enroll/attest/unenroll workload against
//! remote HCP-style services. Lifecycle state is persisted as filesystem
//! markers so banks survive process restarts; concurrent workers coordinate
//! only through per-entry cross-process file locks.

pub mod bank;
pub mod enroll;
pub mod error;
pub mod instance;
pub mod invocation;
pub mod lock;
pub mod namespace;
pub mod network;
pub mod runtime;
pub mod soak;
pub mod verify;

pub use bank::{Bank, BankConfig, BankEntry, InstanceSlot, HOSTNAME_DOMAIN};
pub use enroll::EnrollClient;
pub use error::{Error, Result};
pub use instance::{swtpm_service, ServiceInstance, ServiceSpec, SWTPM_PORT};
pub use invocation::{attest_client, FunctionInvocation};
pub use lock::{EntryGuard, EntryLock};
pub use namespace::{Namespace, DEFAULT_PREFIX, DEFAULT_SUFFIX};
pub use network::SharedNetwork;
pub use runtime::{ContainerRuntime, DockerCli, LaunchOutput, LaunchSpec};
pub use soak::{AttestConfig, SoakOptions};
pub use verify::{pcr_mismatches, verify_quote, QuoteSummary, VerifierConfig};
