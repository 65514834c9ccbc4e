//! Mapping from [`VmConfiguration`] to Virtualization.framework objects.

use std::path::Path;

use objc2::rc::Retained;
use objc2::AnyThread;
use objc2_foundation::{NSArray, NSString, NSURL};
use objc2_virtualization::*;
use tracing::{debug, warn};

use crate::backend::VmConfiguration;
use crate::error::{Error, Result};

fn file_url(path: &Path) -> Retained<NSURL> {
    NSURL::fileURLWithPath(&NSString::from_str(&path.to_string_lossy()))
}

fn describe(err: &objc2_foundation::NSError) -> String {
    err.localizedDescription().to_string()
}

/// Build an unvalidated `VZVirtualMachineConfiguration`.
pub fn build(config: &VmConfiguration) -> Result<Retained<VZVirtualMachineConfiguration>> {
    // 1. Boot loader
    let boot_loader = unsafe {
        VZLinuxBootLoader::initWithKernelURL(VZLinuxBootLoader::alloc(), &file_url(&config.kernel))
    };
    if let Some(ref initrd) = config.initrd {
        unsafe { boot_loader.setInitialRamdiskURL(Some(&file_url(initrd))) };
    }
    unsafe { boot_loader.setCommandLine(&NSString::from_str(&config.cmdline)) };
    debug!(cmdline = %config.cmdline, "vz: kernel command line");

    let vm_config = unsafe { VZVirtualMachineConfiguration::new() };
    unsafe {
        vm_config.setBootLoader(Some(&boot_loader));
        vm_config.setMemorySize(config.memory_bytes);
        vm_config.setCPUCount(config.cpus);
    }

    // 2. Entropy, balloon, vsock
    if config.entropy {
        let entropy = unsafe { VZVirtioEntropyDeviceConfiguration::new() };
        let entropy: Retained<VZEntropyDeviceConfiguration> = Retained::into_super(entropy);
        unsafe { vm_config.setEntropyDevices(&NSArray::from_retained_slice(&[entropy])) };
    }
    if config.memory_balloon {
        let balloon = unsafe { VZVirtioTraditionalMemoryBalloonDeviceConfiguration::new() };
        let balloon: Retained<VZMemoryBalloonDeviceConfiguration> = Retained::into_super(balloon);
        unsafe { vm_config.setMemoryBalloonDevices(&NSArray::from_retained_slice(&[balloon])) };
    }
    if config.vsock {
        let vsock = unsafe { VZVirtioSocketDeviceConfiguration::new() };
        let socket_configs: Retained<NSArray<VZSocketDeviceConfiguration>> =
            NSArray::arrayWithObject(&vsock);
        unsafe { vm_config.setSocketDevices(&socket_configs) };
    }

    // 3. NAT networking
    if let Some(mac) = config.mac_address {
        let text = crate::state::format_mac(&mac);
        let address = unsafe {
            VZMACAddress::initWithString(VZMACAddress::alloc(), &NSString::from_str(&text))
        }
        .ok_or_else(|| Error::Config(format!("invalid MAC address {}", text)))?;
        let nat_attachment = unsafe { VZNATNetworkDeviceAttachment::new() };
        let net_config = unsafe { VZVirtioNetworkDeviceConfiguration::new() };
        unsafe {
            net_config.setAttachment(Some(&nat_attachment));
            net_config.setMACAddress(&address);
        }
        let net_configs: Retained<NSArray<VZNetworkDeviceConfiguration>> =
            NSArray::arrayWithObject(&net_config);
        unsafe { vm_config.setNetworkDevices(&net_configs) };
    }

    // 4. Storage, in order
    let mut disks: Vec<Retained<VZStorageDeviceConfiguration>> = Vec::new();
    for device in &config.storage {
        let attachment = unsafe {
            VZDiskImageStorageDeviceAttachment::initWithURL_readOnly_error(
                VZDiskImageStorageDeviceAttachment::alloc(),
                &file_url(&device.image),
                device.read_only,
            )
        }
        .map_err(|e| {
            Error::Config(format!(
                "disk image {}: {}",
                device.image.display(),
                describe(&e)
            ))
        })?;
        let block = unsafe {
            VZVirtioBlockDeviceConfiguration::initWithAttachment(
                VZVirtioBlockDeviceConfiguration::alloc(),
                &attachment,
            )
        };
        disks.push(Retained::into_super(block));
    }
    unsafe { vm_config.setStorageDevices(&NSArray::from_retained_slice(&disks)) };

    // 5. Directory shares
    let mut shares: Vec<Retained<VZDirectorySharingDeviceConfiguration>> = Vec::new();
    for share in &config.shares {
        let directory = unsafe {
            VZSharedDirectory::initWithURL_readOnly(
                VZSharedDirectory::alloc(),
                &file_url(&share.host_path),
                share.read_only,
            )
        };
        let single = unsafe {
            VZSingleDirectoryShare::initWithDirectory(VZSingleDirectoryShare::alloc(), &directory)
        };
        let device = unsafe {
            VZVirtioFileSystemDeviceConfiguration::initWithTag(
                VZVirtioFileSystemDeviceConfiguration::alloc(),
                &NSString::from_str(&share.tag),
            )
        };
        unsafe { device.setShare(Some(&single)) };
        shares.push(Retained::into_super(device));
    }
    if let Some(ref tag) = config.rosetta_tag {
        shares.push(rosetta_share(tag)?);
    }
    unsafe { vm_config.setDirectorySharingDevices(&NSArray::from_retained_slice(&shares)) };

    // Console only when debugging.
    if config.console {
        let serial_config = unsafe { VZVirtioConsoleDeviceSerialPortConfiguration::new() };
        let stdio_attachment = unsafe {
            VZFileHandleSerialPortAttachment::initWithFileHandleForReading_fileHandleForWriting(
                VZFileHandleSerialPortAttachment::alloc(),
                None,
                Some(&objc2_foundation::NSFileHandle::fileHandleWithStandardError()),
            )
        };
        unsafe { serial_config.setAttachment(Some(&stdio_attachment)) };
        let serial_configs: Retained<NSArray<VZSerialPortConfiguration>> =
            NSArray::arrayWithObject(&serial_config);
        unsafe { vm_config.setSerialPorts(&serial_configs) };
    }

    Ok(vm_config)
}

#[cfg(target_arch = "aarch64")]
fn rosetta_share(tag: &str) -> Result<Retained<VZDirectorySharingDeviceConfiguration>> {
    let availability = unsafe { VZLinuxRosettaDirectoryShare::availability() };
    if availability != VZLinuxRosettaAvailability::Installed {
        warn!(?availability, "vz: Rosetta is not installed");
        return Err(Error::Config(
            "x86_64 guest image needs Rosetta, which is not installed".into(),
        ));
    }
    let rosetta = unsafe {
        VZLinuxRosettaDirectoryShare::initWithError(VZLinuxRosettaDirectoryShare::alloc())
    }
    .map_err(|e| Error::Config(format!("Rosetta share: {}", describe(&e))))?;
    let device = unsafe {
        VZVirtioFileSystemDeviceConfiguration::initWithTag(
            VZVirtioFileSystemDeviceConfiguration::alloc(),
            &NSString::from_str(tag),
        )
    };
    unsafe { device.setShare(Some(&rosetta)) };
    Ok(Retained::into_super(device))
}

#[cfg(not(target_arch = "aarch64"))]
fn rosetta_share(_tag: &str) -> Result<Retained<VZDirectorySharingDeviceConfiguration>> {
    warn!("vz: Rosetta requested on a non-arm64 host");
    Err(Error::Config("Rosetta is only available on Apple silicon".into()))
}

/// Build and validate.
pub fn build_validated(config: &VmConfiguration) -> Result<Retained<VZVirtualMachineConfiguration>> {
    config.validate()?;
    let vm_config = build(config)?;
    unsafe { vm_config.validateWithError() }
        .map_err(|e| Error::Hypervisor(format!("VZ config validation: {}", describe(&e))))?;
    Ok(vm_config)
}
