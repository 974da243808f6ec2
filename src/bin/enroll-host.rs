//! One-shot host enrollment uploader.
//!
//! Registers a single EK public key with the Enrollment Service. Intended
//! for container init scripts, so every flag falls back to an environment
//! variable.

use anyhow::bail;
use clap::Parser;
use ekbank::EnrollClient;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "enroll-host", about = "Enroll one EK with the Enrollment Service")]
struct Cli {
    /// Enrollment Service base URL
    #[arg(long, env = "ENROLL_URL")]
    url: Option<String>,

    /// Hostname to enroll under
    #[arg(long, env = "ENROLL_HOSTNAME")]
    hostname: Option<String>,

    /// Path to the EK public key (raw or PEM)
    #[arg(long, env = "TPM_EKPUB")]
    ekpub: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let Some(url) = cli.url else {
        bail!("Error, no enrollment URL provided (--url / ENROLL_URL)");
    };
    let Some(hostname) = cli.hostname else {
        bail!("Error, no hostname provided (--hostname / ENROLL_HOSTNAME)");
    };
    let Some(ekpub) = cli.ekpub else {
        bail!("Error, no EK public key provided (--ekpub / TPM_EKPUB)");
    };

    let client = EnrollClient::new(url)?;
    let body = client.add(&ekpub, &hostname)?;
    println!("{body}");
    Ok(())
}
