//! Guest mounts as data, and the executor that performs them.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::guest::protocol::{mount_flags, Command, CommandOutput, MountRequest};
use crate::guest::GuestClient;
use crate::vm::disk::FilesystemIdentifier;

/// e2fsck exit status for "errors corrected"; anything above is a failure.
const E2FSCK_CORRECTED: i32 = 1;

/// The guest operations mounts and init actions need.
#[async_trait]
pub trait GuestOps: Send + Sync {
    async fn run(&self, command: &Command) -> Result<CommandOutput>;
    async fn mkdir(&self, path: &str) -> Result<()>;
    async fn mount(&self, request: &MountRequest) -> Result<()>;
    async fn write_file(&self, path: &str, data: &[u8], mode: Option<u32>) -> Result<()>;
}

#[async_trait]
impl GuestOps for GuestClient {
    async fn run(&self, command: &Command) -> Result<CommandOutput> {
        GuestClient::run(self, command).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        GuestClient::mkdir(self, path).await
    }

    async fn mount(&self, request: &MountRequest) -> Result<()> {
        GuestClient::mount(self, request).await
    }

    async fn write_file(&self, path: &str, data: &[u8], mode: Option<u32>) -> Result<()> {
        self.write_with_mode(path, data, mode).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountAction {
    /// A block device backed by a host image.
    Disk {
        device: String,
        image: PathBuf,
        fs_type: String,
        label: Option<String>,
    },
    /// A virtiofs share.
    Share { tag: String, read_only: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub mountpoint: String,
    pub action: MountAction,
}

impl Mount {
    /// Number of normal path components; `/` is 0.
    pub fn depth(&self) -> usize {
        Path::new(&self.mountpoint)
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .count()
    }
}

/// Stable sort by ascending depth, so parents mount before children.
pub fn sort_by_depth(mounts: &mut [Mount]) {
    mounts.sort_by_key(Mount::depth);
}

pub struct MountExecutor<'a> {
    guest: &'a dyn GuestOps,
    identifier: &'a dyn FilesystemIdentifier,
}

impl<'a> MountExecutor<'a> {
    pub fn new(guest: &'a dyn GuestOps, identifier: &'a dyn FilesystemIdentifier) -> Self {
        Self { guest, identifier }
    }

    /// Perform `mounts` by depth; the first failure aborts the rest.
    pub async fn execute(&self, mut mounts: Vec<Mount>) -> Result<()> {
        sort_by_depth(&mut mounts);
        for mount in &mounts {
            self.execute_one(mount).await.map_err(|e| match e {
                Error::Guest(msg) => Error::Guest(format!("{}: {}", mount.mountpoint, msg)),
                other => other,
            })?;
        }
        Ok(())
    }

    async fn execute_one(&self, mount: &Mount) -> Result<()> {
        let request = match &mount.action {
            MountAction::Disk {
                device,
                image,
                fs_type,
                label,
            } => {
                self.prepare_disk(device, image, fs_type, label.as_deref())
                    .await?;
                MountRequest {
                    fs: fs_type.clone(),
                    device: device.clone(),
                    target: mount.mountpoint.clone(),
                    flags: mount_flags::MS_NOATIME,
                    data: String::new(),
                }
            }
            MountAction::Share { tag, read_only } => MountRequest {
                fs: "virtiofs".into(),
                device: tag.clone(),
                target: mount.mountpoint.clone(),
                flags: if *read_only { mount_flags::MS_RDONLY } else { 0 },
                data: String::new(),
            },
        };
        self.guest.mkdir(&mount.mountpoint).await?;
        self.guest.mount(&request).await?;
        info!(
            mountpoint = %mount.mountpoint,
            fs = %request.fs,
            device = %request.device,
            "mounted"
        );
        Ok(())
    }

    async fn prepare_disk(
        &self,
        device: &str,
        image: &Path,
        fs_type: &str,
        label: Option<&str>,
    ) -> Result<()> {
        let device_size = std::fs::metadata(image)?.len();
        match self.identifier.identify_path(image)? {
            None => {
                let mut mkfs = Command::new(format!("mkfs.{}", fs_type)).arg("-F");
                if let Some(label) = label {
                    mkfs = mkfs.args(["-L", label]);
                }
                info!(device, fs_type, "formatting blank disk");
                self.run_checked(&mkfs.arg(device)).await
            }
            Some(fs) if fs.size < device_size && !fs.fs_type.starts_with("ext") => {
                warn!(
                    device,
                    fs_type = %fs.fs_type,
                    "cannot grow this filesystem type, leaving it at its size"
                );
                Ok(())
            }
            Some(fs) if fs.size < device_size => {
                info!(
                    device,
                    fs_size = fs.size,
                    device_size,
                    "growing filesystem"
                );
                // resize2fs refuses a filesystem mounted since its last check.
                let fsck = self
                    .guest
                    .run(&Command::new("e2fsck").args(["-f", "-p", device]))
                    .await?;
                if fsck.exit > E2FSCK_CORRECTED {
                    return Err(Error::Guest(format!(
                        "e2fsck exited {}: {}",
                        fsck.exit,
                        fsck.output_str().trim()
                    )));
                }
                self.run_checked(&Command::new("resize2fs").arg(device))
                    .await
            }
            Some(fs) => {
                debug!(device, id = %fs.id, "filesystem present");
                Ok(())
            }
        }
    }

    async fn run_checked(&self, command: &Command) -> Result<()> {
        let output = self.guest.run(command).await?;
        if output.success() {
            Ok(())
        } else {
            Err(Error::Guest(format!(
                "{} exited {}: {}",
                command.path,
                output.exit,
                output.output_str().trim()
            )))
        }
    }
}
