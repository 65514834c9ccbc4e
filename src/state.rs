//! Persisted daemon state.
//!
//! A small JSON document in the state directory that survives restarts:
//! the VM's MAC address and machine id must stay stable so the guest keeps
//! its DHCP lease and identity. Updates are merged field by field; empty
//! values never overwrite what is already stored.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const STATE_FILE: &str = "daemon.json";

/// Length of the generated machine id in bytes.
pub const MACHINE_ID_LEN: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DaemonState {
    pub status: String,
    pub mac_address: String,
    pub machine_id: Vec<u8>,
    pub ipv4_address: String,
}

impl DaemonState {
    /// Copy every non-empty field of `update` over `self`.
    pub fn merge(&mut self, update: &DaemonState) {
        if !update.status.is_empty() {
            self.status = update.status.clone();
        }
        if !update.mac_address.is_empty() {
            self.mac_address = update.mac_address.clone();
        }
        if !update.machine_id.is_empty() {
            self.machine_id = update.machine_id.clone();
        }
        if !update.ipv4_address.is_empty() {
            self.ipv4_address = update.ipv4_address.clone();
        }
    }
}

/// Stable identity of the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub mac: [u8; 6],
    pub machine_id: Vec<u8>,
}

/// On-disk store for [`DaemonState`], guarded by one lock.
pub struct StateStore {
    path: PathBuf,
    state: Mutex<DaemonState>,
}

impl StateStore {
    /// Load the state from `dir`. A missing file is an empty state.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| Error::State(format!("failed to create {}: {e}", dir.display())))?;
        let path = dir.join(STATE_FILE);
        let state = match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| Error::State(format!("invalid state file {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DaemonState::default(),
            Err(e) => {
                return Err(Error::State(format!(
                    "failed reading {}: {e}",
                    path.display()
                )))
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Result<DaemonState> {
        Ok(self.lock()?.clone())
    }

    /// Merge `update` and write the result to disk.
    pub fn update(&self, update: &DaemonState) -> Result<DaemonState> {
        let mut state = self.lock()?;
        let mut next = state.clone();
        next.merge(update);
        write_atomic(&self.path, &next)?;
        *state = next.clone();
        Ok(next)
    }

    /// Return the stored identity, generating and persisting whatever part
    /// of it is missing.
    pub fn ensure_identity(&self) -> Result<Identity> {
        let mut state = self.lock()?;
        let mut next = state.clone();

        let mac = match parse_mac(&next.mac_address) {
            Some(mac) => mac,
            None => {
                let mac = generate_mac()?;
                next.mac_address = format_mac(&mac);
                mac
            }
        };
        if next.machine_id.len() != MACHINE_ID_LEN {
            let mut id = vec![0u8; MACHINE_ID_LEN];
            getrandom::fill(&mut id)
                .map_err(|e| Error::State(format!("failed to generate machine id: {e}")))?;
            next.machine_id = id;
        }

        if next != *state {
            tracing::info!(mac = %next.mac_address, "generated VM identity");
            write_atomic(&self.path, &next)?;
            *state = next.clone();
        }
        Ok(Identity {
            mac,
            machine_id: next.machine_id,
        })
    }

    /// Forget the MAC address and machine id. The next
    /// [`ensure_identity`](Self::ensure_identity) generates new ones.
    pub fn reset_identity(&self) -> Result<()> {
        let mut state = self.lock()?;
        let mut next = state.clone();
        next.mac_address.clear();
        next.machine_id.clear();
        write_atomic(&self.path, &next)?;
        *state = next;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, DaemonState>> {
        self.state
            .lock()
            .map_err(|_| Error::State("state lock poisoned".into()))
    }
}

fn write_atomic(path: &Path, state: &DaemonState) -> Result<()> {
    let data = serde_json::to_vec_pretty(state)
        .map_err(|e| Error::State(format!("serialize state failed: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data)
        .map_err(|e| Error::State(format!("failed writing {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| Error::State(format!("failed writing {}: {e}", path.display())))?;
    Ok(())
}

/// A random locally administered unicast MAC address.
pub fn generate_mac() -> Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    getrandom::fill(&mut mac)
        .map_err(|e| Error::State(format!("failed to generate MAC address: {e}")))?;
    mac[0] = (mac[0] | 0x02) & !0x01;
    Ok(mac)
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(':');
    for byte in mac.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    parts.next().is_none().then_some(mac)
}
