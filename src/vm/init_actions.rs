//! Work deferred until every mount is in place.

use tracing::info;

use crate::error::Result;
use crate::guest::protocol::{mount_flags, MountRequest};
use crate::vm::mounts::GuestOps;

pub const BINFMT_MISC_DIR: &str = "/proc/sys/fs/binfmt_misc";

/// Where the Rosetta share is mounted in the guest.
pub const ROSETTA_MOUNTPOINT: &str = "/run/rosetta";

/// The root image is read-only, so the id lives on tmpfs; images link
/// `/etc/machine-id` here.
pub const MACHINE_ID_PATH: &str = "/run/machine-id";

/// x86-64 ELF executables, handed to the Rosetta translator.
const ROSETTA_MAGIC: &str = r"\x7fELF\x02\x01\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x02\x00\x3e\x00";
const ROSETTA_MASK: &str = r"\xff\xff\xff\xff\xff\xfe\xfe\x00\xff\xff\xff\xff\xff\xff\xff\xff\xfe\xff\xff\xff";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitAction {
    /// Register a binfmt_misc handler (`:name:type:offset:magic:mask:interp:flags`).
    RegisterBinfmt { name: String, rule: String },
    WriteFile {
        path: String,
        data: Vec<u8>,
        mode: Option<u32>,
    },
}

impl InitAction {
    pub fn rosetta() -> Self {
        InitAction::RegisterBinfmt {
            name: "rosetta".into(),
            rule: format!(
                ":rosetta:M::{}:{}:{}/rosetta:CF",
                ROSETTA_MAGIC, ROSETTA_MASK, ROSETTA_MOUNTPOINT
            ),
        }
    }

    pub fn machine_id(id: &[u8]) -> Self {
        let mut hex: String = id.iter().map(|b| format!("{:02x}", b)).collect();
        hex.push('\n');
        InitAction::WriteFile {
            path: MACHINE_ID_PATH.into(),
            data: hex.into_bytes(),
            mode: Some(0o444),
        }
    }
}

/// Run `actions` in order. binfmt_misc is mounted once, on first use.
pub async fn run_init_actions(guest: &dyn GuestOps, actions: &[InitAction]) -> Result<()> {
    let mut binfmt_mounted = false;
    for action in actions {
        match action {
            InitAction::RegisterBinfmt { name, rule } => {
                if !binfmt_mounted {
                    guest
                        .mount(&MountRequest {
                            fs: "binfmt_misc".into(),
                            device: "binfmt_misc".into(),
                            target: BINFMT_MISC_DIR.into(),
                            flags: mount_flags::MS_NOSUID
                                | mount_flags::MS_NODEV
                                | mount_flags::MS_NOEXEC,
                            data: String::new(),
                        })
                        .await?;
                    binfmt_mounted = true;
                }
                let register = format!("{}/register", BINFMT_MISC_DIR);
                guest.write_file(&register, rule.as_bytes(), None).await?;
                info!(name = %name, "binfmt handler registered");
            }
            InitAction::WriteFile { path, data, mode } => {
                guest.write_file(path, data, *mode).await?;
            }
        }
    }
    Ok(())
}
