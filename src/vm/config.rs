//! Translate the configured layout into a bootable machine description.

use std::path::Path;

use tracing::debug;

use crate::backend::{DirectoryShare, StorageDevice, VmConfiguration};
use crate::config::{Arch, VmLayout};
use crate::error::{Error, Result};
use crate::state::Identity;
use crate::vm::disk;
use crate::vm::init_actions::{InitAction, ROSETTA_MOUNTPOINT};
use crate::vm::mounts::{Mount, MountAction};

/// Guest init binary.
pub const GUEST_INIT: &str = "/sbin/burrow-guest";

/// virtiofs tag of the Rosetta share.
pub const ROSETTA_TAG: &str = "rosetta";

/// Everything `start()` needs before the VM is created.
#[derive(Debug, Clone)]
pub struct MachinePlan {
    pub configuration: VmConfiguration,
    pub mounts: Vec<Mount>,
    pub init_actions: Vec<InitAction>,
}

/// Kernel command line for `layout`. The guest console only talks in debug
/// mode.
pub fn kernel_cmdline(layout: &VmLayout) -> String {
    let mut cmdline = vec![
        "root=/dev/vda".to_string(),
        "ro".to_string(),
        "rootwait".to_string(),
        format!("init={}", GUEST_INIT),
        "panic=1".to_string(),
        "reboot=k".to_string(),
    ];
    if layout.debug {
        cmdline.push("console=hvc0".to_string());
        cmdline.push("loglevel=7".to_string());
    } else {
        cmdline.push("quiet".to_string());
        cmdline.push("loglevel=4".to_string());
    }
    cmdline.extend(layout.cmdline.iter().cloned());
    cmdline.join(" ")
}

/// `/dev/vdb`, `/dev/vdc`, ... for the `index`-th mutable disk.
pub fn disk_device(index: usize) -> Result<String> {
    // vda is the root image
    if index > 24 {
        return Err(Error::Config(format!("too many disks ({})", index + 1)));
    }
    Ok(format!("/dev/vd{}", (b'b' + index as u8) as char))
}

fn require_file(what: &str, path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::Config(format!("{} is not configured", what)));
    }
    if !path.is_file() {
        return Err(Error::Config(format!(
            "{} not found: {}",
            what,
            path.display()
        )));
    }
    Ok(())
}

/// Whether `guest` binaries need translation on `host`.
pub fn needs_rosetta(host: Arch, guest: Arch) -> Result<bool> {
    match (host, guest) {
        (h, g) if h == g => Ok(false),
        (Arch::Aarch64, Arch::X86_64) => Ok(true),
        (h, g) => Err(Error::Config(format!(
            "cannot run a {:?} guest image on a {:?} host",
            g, h
        ))),
    }
}

/// Build the machine for `layout`, creating or growing disk images on the
/// way.
pub fn plan(layout: &VmLayout, identity: &Identity, host: Arch) -> Result<MachinePlan> {
    require_file("kernel", &layout.kernel)?;
    require_file("root image", &layout.root_image)?;
    if let Some(initrd) = &layout.initrd {
        require_file("initrd", initrd)?;
    }
    let memory_bytes = layout
        .memory_mb
        .checked_mul(1024 * 1024)
        .ok_or_else(|| Error::Config(format!("memory_mb {} is too large", layout.memory_mb)))?;

    let mut storage = vec![StorageDevice {
        image: layout.root_image.clone(),
        read_only: true,
    }];
    let mut mounts = Vec::new();
    for (index, disk_config) in layout.disks.iter().enumerate() {
        let device = disk_device(index)?;
        let size = disk::ensure_image(&disk_config.image, &disk_config.size)?;
        debug!(device = %device, image = %disk_config.image.display(), size, "disk attached");
        storage.push(StorageDevice {
            image: disk_config.image.clone(),
            read_only: false,
        });
        mounts.push(Mount {
            mountpoint: disk_config.mountpoint.clone(),
            action: MountAction::Disk {
                device,
                image: disk_config.image.clone(),
                fs_type: disk_config.fs_type.clone(),
                label: disk_config.label.clone(),
            },
        });
    }

    let mut shares = Vec::new();
    for share in &layout.shares {
        if !share.host_path.is_dir() {
            return Err(Error::Config(format!(
                "share {} not a directory: {}",
                share.tag,
                share.host_path.display()
            )));
        }
        shares.push(DirectoryShare {
            tag: share.tag.clone(),
            host_path: share.host_path.clone(),
            read_only: share.read_only,
        });
        mounts.push(Mount {
            mountpoint: share.mountpoint.clone(),
            action: MountAction::Share {
                tag: share.tag.clone(),
                read_only: share.read_only,
            },
        });
    }

    let mut init_actions = Vec::new();
    let rosetta_tag = if needs_rosetta(host, layout.guest_arch)? {
        mounts.push(Mount {
            mountpoint: ROSETTA_MOUNTPOINT.into(),
            action: MountAction::Share {
                tag: ROSETTA_TAG.into(),
                read_only: true,
            },
        });
        init_actions.push(InitAction::rosetta());
        Some(ROSETTA_TAG.to_string())
    } else {
        None
    };
    init_actions.push(InitAction::machine_id(&identity.machine_id));

    let configuration = VmConfiguration {
        cpus: layout.cpus,
        memory_bytes,
        kernel: layout.kernel.clone(),
        initrd: layout.initrd.clone(),
        cmdline: kernel_cmdline(layout),
        console: layout.debug,
        entropy: true,
        memory_balloon: true,
        vsock: true,
        mac_address: Some(identity.mac),
        storage,
        shares,
        rosetta_tag,
    };

    Ok(MachinePlan {
        configuration,
        mounts,
        init_actions,
    })
}
