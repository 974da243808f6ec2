//! Shared test doubles: an in-memory enrollment service speaking just enough
//! HTTP for the client, and a fake container runtime that simulates the
//! swtpm image's setup/teardown behavior on the host filesystem.
#![allow(dead_code)]

use ekbank::{ContainerRuntime, Error, LaunchOutput, LaunchSpec, Result};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

/// The identifier the mock service assigns to an enrollment. Derived from
/// the hostname so re-enrolling the same entry yields the same id, like the
/// real service's stable EK hash.
pub fn mock_id_for(hostname: &str) -> String {
    let digest = Sha256::digest(hostname.as_bytes());
    hex::encode(&digest[..8])
}

#[derive(Default)]
struct EnrollState {
    /// hostname -> identifiers. Normally at most one; tests can inject
    /// duplicates to provoke consistency errors.
    enrolled: HashMap<String, Vec<String>>,
}

/// Minimal blocking HTTP server implementing the enrollment management API:
/// `add`, `delete`, `find` and `get-asset-signer`.
pub struct MockEnrollServer {
    addr: SocketAddr,
    state: Arc<Mutex<EnrollState>>,
}

impl MockEnrollServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(EnrollState::default()));
        let shared = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let state = Arc::clone(&shared);
                thread::spawn(move || handle_connection(stream, state));
            }
        });
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn is_enrolled(&self, hostname: &str) -> bool {
        !self.ids_for(hostname).is_empty()
    }

    pub fn ids_for(&self, hostname: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .enrolled
            .get(hostname)
            .cloned()
            .unwrap_or_default()
    }

    /// Register an identifier directly, bypassing the API. Used to set up
    /// pathological states (e.g. duplicate identifiers for one hostname).
    pub fn inject(&self, hostname: &str, id: &str) {
        self.state
            .lock()
            .unwrap()
            .enrolled
            .entry(hostname.to_string())
            .or_default()
            .push(id.to_string());
    }
}

fn handle_connection(mut stream: TcpStream, state: Arc<Mutex<EnrollState>>) {
    let Some((method, target, body)) = read_request(&mut stream) else {
        return;
    };
    let (status, body) = route(&method, &target, &body, &state);
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.flush();
}

fn route(
    method: &str,
    target: &str,
    body: &str,
    state: &Mutex<EnrollState>,
) -> (&'static str, String) {
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };
    match (method, path) {
        ("POST", "/v1/add") => {
            let Some(hostname) = multipart_field(body, "hostname") else {
                return ("400 Bad Request", "{\"error\":\"no hostname\"}".into());
            };
            let id = mock_id_for(&hostname);
            state.lock().unwrap().enrolled.insert(hostname, vec![id]);
            ("200 OK", "{\"returncode\":0}".into())
        }
        ("POST", "/v1/delete") => {
            let Some(id) = form_field(body, "ekpubhash") else {
                return ("400 Bad Request", "{\"error\":\"no ekpubhash\"}".into());
            };
            let mut state = state.lock().unwrap();
            let hostname = state
                .enrolled
                .iter()
                .find(|(_, ids)| ids.contains(&id))
                .map(|(hostname, _)| hostname.clone());
            match hostname {
                Some(hostname) => {
                    state.enrolled.remove(&hostname);
                    ("200 OK", "{\"returncode\":0}".into())
                }
                None => ("404 Not Found", "{\"error\":\"unknown ekpubhash\"}".into()),
            }
        }
        ("GET", "/v1/find") => {
            let Some(suffix) = query_field(query, "hostname_suffix") else {
                return ("400 Bad Request", "{\"error\":\"no suffix\"}".into());
            };
            let state = state.lock().unwrap();
            let mut hashes: Vec<String> = state
                .enrolled
                .iter()
                .filter(|(hostname, _)| hostname.ends_with(&suffix))
                .flat_map(|(_, ids)| ids.iter().cloned())
                .collect();
            hashes.sort();
            (
                "200 OK",
                serde_json::json!({ "ekpubhashes": hashes }).to_string(),
            )
        }
        ("GET", "/v1/get-asset-signer") => ("200 OK", "fake-asset-signer-key".into()),
        _ => ("404 Not Found", "{\"error\":\"no such endpoint\"}".into()),
    }
}

/// Read one HTTP request; returns (method, target, body as lossy text).
fn read_request(stream: &mut TcpStream) -> Option<(String, String, String)> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_subslice(&raw, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut buf).ok()?;
        if n == 0 {
            return None;
        }
        raw.extend_from_slice(&buf[..n]);
    };

    let headers = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let mut lines = headers.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = raw[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf).ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    Some((method, target, String::from_utf8_lossy(&body).into_owned()))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Pull a text field out of a multipart/form-data body.
fn multipart_field(body: &str, name: &str) -> Option<String> {
    let marker = format!("name=\"{name}\"");
    let after = &body[body.find(&marker)? + marker.len()..];
    let value = &after[after.find("\r\n\r\n")? + 4..];
    Some(value[..value.find("\r\n")?].to_string())
}

/// Pull a field out of an application/x-www-form-urlencoded body.
fn form_field(body: &str, name: &str) -> Option<String> {
    body.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn query_field(query: &str, name: &str) -> Option<String> {
    form_field(query, name)
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    running: HashSet<String>,
    networks: HashSet<String>,
    launches: Vec<LaunchSpec>,
}

/// In-memory [`ContainerRuntime`]: detached launches mint fake container
/// ids, the swtpm setup command materializes EK files under the mounted
/// state directory, and the teardown command empties it.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_mount(spec: &LaunchSpec) -> Option<PathBuf> {
        spec.mounts
            .iter()
            .find(|(_, container)| container == "/state")
            .map(|(host, _)| host.clone())
    }

    /// How many times the setup command ran against a given state directory.
    pub fn setup_count(&self, state_dir: &Path) -> usize {
        self.state
            .lock()
            .unwrap()
            .launches
            .iter()
            .filter(|spec| {
                spec.command.iter().any(|c| c.contains("setup_swtpm"))
                    && Self::state_mount(spec).as_deref() == Some(state_dir)
            })
            .count()
    }

    pub fn client_runs(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .launches
            .iter()
            .filter(|spec| spec.image.contains("client"))
            .count()
    }

    pub fn running_containers(&self) -> usize {
        self.state.lock().unwrap().running.len()
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.state.lock().unwrap().launches.clone()
    }
}

impl ContainerRuntime for FakeRuntime {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchOutput> {
        let mut state = self.state.lock().unwrap();
        state.launches.push(spec.clone());

        if spec.detached {
            state.next_id += 1;
            let id = format!("fake-{:08x}", state.next_id);
            state.running.insert(id.clone());
            return Ok(LaunchOutput {
                exit_code: 0,
                stdout: format!("{id}\n"),
                stderr: String::new(),
            });
        }

        let command = spec.command.join(" ");
        if command.contains("setup_swtpm") {
            // The real setup script creates TPM state including both EK
            // encodings; tie the fake contents to the state path so every
            // entry gets a distinct key.
            let state_dir = Self::state_mount(spec).ok_or_else(|| {
                Error::Runtime("setup launched without a /state mount".into())
            })?;
            let tpm_dir = state_dir.join("tpm");
            fs::create_dir_all(&tpm_dir)?;
            fs::write(tpm_dir.join("ek.pub"), format!("pub:{}", state_dir.display()))?;
            fs::write(tpm_dir.join("ek.pem"), format!("pem:{}", state_dir.display()))?;
        } else if command.contains("rm -rf") {
            let state_dir = Self::state_mount(spec).ok_or_else(|| {
                Error::Runtime("teardown launched without a /state mount".into())
            })?;
            for dir_entry in fs::read_dir(&state_dir)? {
                let path = dir_entry?.path();
                if path.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
            }
        }
        Ok(LaunchOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    fn inspect_container(&self, id: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().running.contains(id))
    }

    fn stop_container(&self, id: &str, _grace_secs: u32) -> Result<()> {
        self.state.lock().unwrap().running.remove(id);
        Ok(())
    }

    fn remove_container(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    fn network_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().networks.contains(name))
    }

    fn create_network(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().networks.insert(name.to_string());
        Ok(())
    }

    fn remove_network(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().networks.remove(name);
        Ok(())
    }
}
