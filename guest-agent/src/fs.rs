//! File, directory, mount, and sysctl operations.

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use burrow_protocol::{MkdirRequest, MountRequest, WriteRequest};
use nix::mount::MsFlags;

use crate::error::{GuestError, Result};
use crate::kmsg;

/// Pseudo-filesystems where files are written in place.
const DIRECT_WRITE_ROOTS: [&str; 2] = ["/proc", "/sys"];

const DEFAULT_MODE: u32 = 0o644;

fn absolute(path: &str) -> Result<PathBuf> {
    let path = Path::new(path);
    if !path.is_absolute() {
        return Err(GuestError::InvalidRequest(format!(
            "path must be absolute: {}",
            path.display()
        )));
    }
    Ok(normalize_path(path))
}

/// Write a file, creating parents. Regular files are replaced atomically.
pub fn write(req: &WriteRequest) -> Result<()> {
    let target = absolute(&req.path)?;

    if DIRECT_WRITE_ROOTS
        .iter()
        .any(|root| target.starts_with(root))
    {
        std::fs::write(&target, &req.data)?;
        return Ok(());
    }

    let parent = target
        .parent()
        .ok_or_else(|| GuestError::InvalidRequest(format!("no parent for {}", req.path)))?;
    std::fs::create_dir_all(parent)?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = parent.join(format!(".{}.burrow-tmp", file_name));
    let result = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&temp)?;
        file.write_all(&req.data)?;
        file.set_permissions(std::fs::Permissions::from_mode(
            req.mode.unwrap_or(DEFAULT_MODE),
        ))?;
        file.sync_all()?;
        std::fs::rename(&temp, &target)
    })();
    if let Err(e) = result {
        let _ = std::fs::remove_file(&temp);
        return Err(e.into());
    }

    kmsg(&format!("wrote {} bytes to {}", req.data.len(), target.display()));
    Ok(())
}

pub fn mkdir(req: &MkdirRequest) -> Result<()> {
    let target = absolute(&req.path)?;
    std::fs::create_dir_all(&target)?;
    Ok(())
}

/// Mount a filesystem. The target directory is created if missing.
pub fn mount(req: &MountRequest) -> Result<()> {
    let target = absolute(&req.target)?;
    std::fs::create_dir_all(&target)?;
    let data = (!req.data.is_empty()).then_some(req.data.as_str());
    nix::mount::mount(
        Some(req.device.as_str()),
        &target,
        Some(req.fs.as_str()),
        MsFlags::from_bits_truncate(req.flags as libc::c_ulong),
        data,
    )?;
    kmsg(&format!(
        "mounted {} ({}) on {}",
        req.device,
        req.fs,
        target.display()
    ));
    Ok(())
}

/// Map `net.ipv4.ip_forward` to `<root>/net/ipv4/ip_forward`.
pub fn sysctl_path(root: &Path, key: &str) -> Result<PathBuf> {
    let valid = !key.is_empty()
        && key
            .split('.')
            .all(|part| !part.is_empty() && !part.contains('/') && part != "..");
    if !valid {
        return Err(GuestError::InvalidRequest(format!("bad sysctl key {:?}", key)));
    }
    Ok(key.split('.').fold(root.to_path_buf(), |p, part| p.join(part)))
}

/// Apply kernel tunables under `root` (normally `/proc/sys`).
pub fn apply_sysctls(root: &Path, values: &BTreeMap<String, String>) -> Result<()> {
    for (key, value) in values {
        let path = sysctl_path(root, key)?;
        std::fs::write(&path, format!("{}\n", value))
            .map_err(|e| GuestError::InvalidRequest(format!("sysctl {}: {}", key, e)))?;
    }
    Ok(())
}

pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => normalized.push("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(seg) => normalized.push(seg),
            Component::Prefix(_) => {}
        }
    }
    if normalized.as_os_str().is_empty() {
        PathBuf::from("/")
    } else {
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_creates_parents_and_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/config.toml");
        write(&WriteRequest {
            path: path.to_string_lossy().into_owned(),
            data: b"x = 1".to_vec(),
            mode: Some(0o600),
        })
        .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"x = 1");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn write_overwrites_without_leaving_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        for content in [&b"first"[..], &b"second"[..]] {
            write(&WriteRequest {
                path: path.to_string_lossy().into_owned(),
                data: content.to_vec(),
                mode: None,
            })
            .unwrap();
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn relative_paths_rejected() {
        let err = mkdir(&MkdirRequest {
            path: "relative/dir".into(),
        })
        .unwrap_err();
        assert!(matches!(err, GuestError::InvalidRequest(_)));
    }

    #[test]
    fn mkdir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let req = MkdirRequest {
            path: dir.path().join("x/y/z").to_string_lossy().into_owned(),
        };
        mkdir(&req).unwrap();
        mkdir(&req).unwrap();
        assert!(dir.path().join("x/y/z").is_dir());
    }

    #[test]
    fn sysctl_keys_map_to_paths() {
        let root = Path::new("/proc/sys");
        assert_eq!(
            sysctl_path(root, "net.ipv4.ip_forward").unwrap(),
            PathBuf::from("/proc/sys/net/ipv4/ip_forward")
        );
        assert!(sysctl_path(root, "net..ip_forward").is_err());
        assert!(sysctl_path(root, "kernel/../../etc").is_err());
    }

    #[test]
    fn sysctls_written_under_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("vm")).unwrap();
        let mut values = BTreeMap::new();
        values.insert("vm.swappiness".to_string(), "10".to_string());
        apply_sysctls(dir.path(), &values).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("vm/swappiness")).unwrap(),
            "10\n"
        );
    }

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(
            normalize_path(Path::new("/var/lib/../run/./x")),
            PathBuf::from("/var/run/x")
        );
        assert_eq!(normalize_path(Path::new("/..")), PathBuf::from("/"));
    }
}
