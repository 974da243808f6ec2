//! `ekbank` CLI: manage and soak-test a bank of swtpm service instances.

use anyhow::bail;
use clap::{Parser, Subcommand};
use ekbank::{
    soak, AttestConfig, Bank, BankConfig, DockerCli, EnrollClient, Namespace, SoakOptions,
    DEFAULT_PREFIX, DEFAULT_SUFFIX,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "ekbank",
    about = "Toolkit for testing HCP services and functions",
    long_about = "Manages a corpus of containerized software-TPM instances (a \"bank\") \
and uses it to exercise the Enrollment and Attestation services with \
randomized concurrent workload."
)]
struct Cli {
    /// Path for the bank
    #[arg(long, env = "EKBANK_PATH")]
    path: Option<PathBuf>,

    /// Number of instances/EKpubs to support (0 = bank already exists)
    #[arg(long, default_value_t = 0)]
    num: usize,

    /// Image/container namespace prefix
    #[arg(long, env = "HCP_IMAGE_PREFIX", default_value = DEFAULT_PREFIX)]
    prefix: String,

    /// Image/container namespace suffix
    #[arg(long, env = "HCP_IMAGE_SUFFIX", default_value = DEFAULT_SUFFIX)]
    suffix: String,

    /// Base URL for the Enrollment Service management interface
    #[arg(long, value_name = "URL", env = "ENROLLSVC_API_URL")]
    enrollapi: Option<String>,

    /// URL for the Attestation Service interface
    #[arg(long, value_name = "URL", env = "ATTESTSVC_API_URL")]
    attestapi: Option<String>,

    /// Asset-signer key file the attestation client verifies against
    #[arg(long, env = "HCP_RUN_CLIENT_VERIFIER")]
    verifier: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create/update the bank of swtpm instances
    Create,
    /// Delete the bank (does not unenroll from the remote service)
    Delete,
    /// Enroll every entry
    Allin,
    /// Unenroll every entry
    Allout,
    /// Start every instance
    Allstart,
    /// Stop every instance
    Allstop,
    /// Soak-test the Enrollment and/or Attestation services
    Soak {
        /// Number of iterations in each worker's core loop
        #[arg(long = "loop", default_value_t = 20)]
        iterations: u32,

        /// Number of core loops to run in parallel
        #[arg(long, default_value_t = 1)]
        threads: u32,

        /// Percentage of iterations on an enrolled entry that attest
        #[arg(long, default_value_t = 0)]
        pcattest: u32,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let Some(path) = cli.path.clone() else {
        bail!("Error, no path provided (--path)");
    };
    let Some(enrollapi) = cli.enrollapi.clone() else {
        bail!("Error, no Enrollment Service API URL was provided");
    };
    let Some(attestapi) = cli.attestapi.clone() else {
        bail!("Error, no Attestation Service URL was provided");
    };
    if let Command::Soak {
        iterations,
        threads,
        ..
    } = &cli.command
    {
        if *iterations < 1 {
            bail!("Error, illegal loop value ({iterations})");
        }
        if *threads < 1 {
            bail!("Error, illegal threads value ({threads})");
        }
    }

    let config = BankConfig {
        path,
        num: cli.num,
        namespace: Namespace::new(cli.prefix.clone(), cli.suffix.clone()),
        enroll_api: enrollapi.clone(),
    };
    let runtime = Arc::new(DockerCli::new());
    let enroll = EnrollClient::new(enrollapi)?;
    let mut bank = Bank::open(config, &*runtime)?;

    match cli.command {
        Command::Create => bank.initialize(&*runtime, &enroll)?,
        Command::Delete => bank.delete(&*runtime)?,
        Command::Allin => {
            bank.initialize(&*runtime, &enroll)?;
            bank.enroll_all(&enroll)?;
        }
        Command::Allout => {
            bank.initialize(&*runtime, &enroll)?;
            bank.unenroll_all(&enroll)?;
        }
        Command::Allstart => {
            bank.initialize(&*runtime, &enroll)?;
            bank.start_all(&*runtime)?;
        }
        Command::Allstop => {
            bank.initialize(&*runtime, &enroll)?;
            bank.stop_all(&*runtime)?;
        }
        Command::Soak {
            iterations,
            threads,
            pcattest,
        } => {
            bank.initialize(&*runtime, &enroll)?;
            // Attest clients need a verifier key; when none is supplied,
            // fetch the service's asset-signer key into a scratch directory
            // that lives for the duration of the run.
            let mut _signer_dir: Option<tempfile::TempDir> = None;
            let verifier = match (pcattest, cli.verifier) {
                (0, verifier) => verifier,
                (_, Some(verifier)) => Some(verifier),
                (_, None) => {
                    let (dir, signer) = enroll.fetch_asset_signer()?;
                    _signer_dir = Some(dir);
                    Some(signer)
                }
            };
            let opts = SoakOptions {
                iterations,
                workers: threads,
                attest_percent: pcattest,
                attest: Some(AttestConfig {
                    attest_url: attestapi,
                    verifier,
                }),
            };
            soak::run(&mut bank, runtime, &opts)?;
        }
    }
    Ok(())
}
