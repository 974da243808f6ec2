//! Attestation quote verification pipeline
//!
//! Validates a quote + eventlog blob by driving the external `tpm2-attest`
//! and `attest-verify` tools: signature check, quote/eventlog PCR
//! cross-check, eventlog policy decision, then sealing of the response
//! assets. Only the PCR cross-check is done here; the cryptography stays in
//! the external tools.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Hashing algorithm the PCR cross-check works over.
pub const PCR_ALG: &str = "sha256";

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Path to the `tpm2-attest` tool (verify + seal).
    pub tpm2_attest: PathBuf,
    /// Path to the `attest-verify` eventlog policy tool.
    pub attest_verify: PathBuf,
}

/// The YAML summary `tpm2-attest verify` prints: EK hash plus quoted and
/// eventlog-computed PCR tables keyed by algorithm.
#[derive(Debug, Deserialize)]
pub struct QuoteSummary {
    pub ekhash: Option<String>,
    #[serde(default)]
    pub pcrs: BTreeMap<String, BTreeMap<u32, String>>,
    #[serde(rename = "eventlog-pcrs", default)]
    pub eventlog_pcrs: Option<BTreeMap<String, BTreeMap<u32, String>>>,
}

/// PCR indexes whose eventlog-computed value disagrees with the quote.
///
/// This only establishes that the eventlog is consistent with the quote; it
/// says nothing about whether the eventlog itself meets policy. Eventlog
/// PCRs the quote does not cover are skipped, checking those is the policy
/// tool's job, and an absent eventlog section yields no mismatches.
pub fn pcr_mismatches(summary: &QuoteSummary, alg: &str) -> Vec<u32> {
    let Some(eventlog) = summary.eventlog_pcrs.as_ref().and_then(|e| e.get(alg)) else {
        return Vec::new();
    };
    let Some(quoted) = summary.pcrs.get(alg) else {
        return Vec::new();
    };
    eventlog
        .iter()
        .filter(|(index, value)| {
            quoted
                .get(index)
                .is_some_and(|quoted_value| quoted_value != *value)
        })
        .map(|(index, _)| *index)
        .collect()
}

/// Verify a raw quote blob and return the sealed response assets.
pub fn verify_quote(config: &VerifierConfig, quote: &[u8]) -> Result<Vec<u8>> {
    let mut quote_file = tempfile::NamedTempFile::new()?;
    quote_file.write_all(quote)?;
    quote_file.flush()?;

    // Signature/EK check; the tool's stdout carries the YAML summary even
    // when the check fails.
    let verify = Command::new(&config.tpm2_attest)
        .arg("verify")
        .arg(quote_file.path())
        .output()?;
    let mut quote_valid = verify.status.success();

    let summary_text = String::from_utf8_lossy(&verify.stdout).into_owned();
    let summary: QuoteSummary = serde_yaml::from_str(&summary_text)?;
    let ekhash = match &summary.ekhash {
        Some(ekhash) => ekhash.clone(),
        None => {
            quote_valid = false;
            "UNKNOWN".to_string()
        }
    };

    if !summary.pcrs.contains_key(PCR_ALG) {
        tracing::warn!("[Verify] {ekhash}: quote does not have hash {PCR_ALG}");
    }
    for index in pcr_mismatches(&summary, PCR_ALG) {
        tracing::warn!("[Verify] {ekhash}: pcr {index} disagrees with eventlog");
        quote_valid = false;
    }
    if quote_valid {
        tracing::info!("[Verify] {ekhash}: quote and eventlog consistent");
    } else {
        tracing::warn!("[Verify] {ekhash}: quote rejected");
    }

    // The policy tool gets the summary and the consistency verdict; it
    // decides whether this eventlog is acceptable for this EK.
    let mut policy = Command::new(&config.attest_verify)
        .arg("verify")
        .arg(quote_valid.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = policy.stdin.take() {
        stdin.write_all(summary_text.as_bytes())?;
    }
    let policy = policy.wait_with_output()?;
    if !policy.status.success() {
        return Err(Error::Verify(format!("eventlog policy rejected {ekhash}")));
    }

    // Seal the policy response to the attested TPM.
    let mut seal = Command::new(&config.tpm2_attest)
        .arg("seal")
        .arg(quote_file.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = seal.stdin.take() {
        stdin.write_all(&policy.stdout)?;
    }
    let seal = seal.wait_with_output()?;
    if !seal.status.success() {
        return Err(Error::Verify(format!("sealing failed for {ekhash}")));
    }
    Ok(seal.stdout)
}
