//! Enrollment Service management API client
//!
//! Blocking client for the remote service's `add` / `delete` / `find`
//! operations (plus the asset-signer download the attestation client needs
//! as its verifier key). Every call is treated as atomic: it fully succeeds
//! or the whole operation fails.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct FindResponse {
    ekpubhashes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EnrollClient {
    api: String,
    http: reqwest::blocking::Client,
}

impl EnrollClient {
    /// `api` is the service's base URL, e.g. `http://localhost:5000`.
    pub fn new(api: impl Into<String>) -> Result<Self> {
        let http = reqwest::blocking::Client::builder().build()?;
        Ok(Self {
            api: api.into(),
            http,
        })
    }

    pub fn api(&self) -> &str {
        &self.api
    }

    /// Register an EK public key (raw or PEM file) under a hostname.
    /// Returns the service's response body.
    pub fn add(&self, ekpub: &Path, hostname: &str) -> Result<String> {
        let form = reqwest::blocking::multipart::Form::new()
            .file("ekpub", ekpub)?
            .text("hostname", hostname.to_string());
        let response = self
            .http
            .post(format!("{}/v1/add", self.api))
            .multipart(form)
            .send()?;
        let status = response.status();
        let body = response.text().unwrap_or_default();
        if !status.is_success() {
            return Err(Error::Enrollment(format!(
                "add failed for {hostname}: {status} {body}"
            )));
        }
        Ok(body)
    }

    /// Unregister by the service's own identifier (the "ekpubhash").
    pub fn delete(&self, ekpubhash: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/v1/delete", self.api))
            .form(&[("ekpubhash", ekpubhash)])
            .send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::Enrollment(format!(
                "delete failed for {ekpubhash}: {status} {body}"
            )));
        }
        Ok(())
    }

    /// Look up the identifiers of all enrollments whose hostname ends with
    /// the given suffix.
    pub fn find(&self, hostname_suffix: &str) -> Result<Vec<String>> {
        let response = self
            .http
            .get(format!("{}/v1/find", self.api))
            .query(&[("hostname_suffix", hostname_suffix)])
            .send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::Enrollment(format!(
                "find failed for {hostname_suffix}: {status} {body}"
            )));
        }
        let parsed: FindResponse = response.json()?;
        Ok(parsed.ekpubhashes)
    }

    /// Download the asset-signer public key to `out`; the attestation client
    /// mounts it as its verifier.
    pub fn get_asset_signer(&self, out: &Path) -> Result<()> {
        let response = self
            .http
            .get(format!("{}/v1/get-asset-signer", self.api))
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Enrollment(format!(
                "get-asset-signer failed: {status}"
            )));
        }
        let bytes = response.bytes()?;
        fs::write(out, &bytes)?;
        Ok(())
    }

    /// Download the asset-signer key into a fresh scratch directory, away
    /// from any bank state. The key lives as long as the returned directory
    /// guard.
    pub fn fetch_asset_signer(&self) -> Result<(tempfile::TempDir, PathBuf)> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("asset-signer");
        self.get_asset_signer(&path)?;
        Ok((dir, path))
    }
}
