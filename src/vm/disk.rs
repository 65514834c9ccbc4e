//! Mutable disk images: sizing, creation and filesystem identification.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use tracing::info;

use crate::config::DiskSize;
use crate::error::{Error, Result};

const MIB: u64 = 1024 * 1024;

/// Bytes available to unprivileged users on the filesystem holding `path`.
pub fn free_space(path: &Path) -> Result<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Config(format!("path contains NUL: {}", path.display())))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

/// Target size for an image given the host's free bytes.
///
/// Auto sizes are rounded down to whole MiB.
pub fn target_size(size: &DiskSize, free_bytes: u64) -> u64 {
    match size {
        DiskSize::Fixed(bytes) => *bytes,
        DiskSize::Auto {
            fraction,
            max_bytes,
        } => {
            let share = (free_bytes as f64 * fraction.clamp(0.0, 1.0)) as u64;
            (share.min(*max_bytes) / MIB) * MIB
        }
    }
}

/// Make sure `image` exists and is at least its target size.
///
/// Missing images are created sparse; existing ones are only ever grown.
/// Returns the final length.
pub fn ensure_image(image: &Path, size: &DiskSize) -> Result<u64> {
    let dir = match image.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let free = match size {
        DiskSize::Fixed(_) => 0,
        DiskSize::Auto { .. } => free_space(dir)?,
    };
    let target = target_size(size, free);

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(image)?;
    let current = file.metadata()?.len();
    if current >= target {
        return Ok(current);
    }
    if target == 0 {
        return Err(Error::Config(format!(
            "no space for disk image {}",
            image.display()
        )));
    }
    file.set_len(target)?;
    info!(
        image = %image.display(),
        from = current,
        to = target,
        "disk image sized"
    );
    Ok(target)
}

/// What a superblock read found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filesystem {
    pub fs_type: String,
    pub id: String,
    pub label: Option<String>,
    /// Bytes the filesystem spans, which may be less than the device.
    pub size: u64,
}

pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

/// Recognizes filesystems on a raw image.
pub trait FilesystemIdentifier: Send + Sync {
    /// `None` when the device carries no filesystem this identifier knows.
    fn identify(&self, size: u64, reader: &mut dyn ReadSeek) -> io::Result<Option<Filesystem>>;

    fn identify_path(&self, image: &Path) -> io::Result<Option<Filesystem>> {
        let mut file = File::open(image)?;
        let size = file.metadata()?.len();
        self.identify(size, &mut file)
    }
}

/// ext2/3/4 superblock reader.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtSuperblock;

const SUPERBLOCK_OFFSET: u64 = 1024;
const SUPERBLOCK_LEN: usize = 1024;
const EXT_MAGIC: u16 = 0xEF53;
const INCOMPAT_64BIT: u32 = 0x80;
const INCOMPAT_EXTENTS: u32 = 0x40;
const COMPAT_HAS_JOURNAL: u32 = 0x4;

fn format_uuid(b: &[u8]) -> String {
    let hex: String = b.iter().map(|x| format!("{:02x}", x)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

impl FilesystemIdentifier for ExtSuperblock {
    fn identify(&self, size: u64, reader: &mut dyn ReadSeek) -> io::Result<Option<Filesystem>> {
        if size < SUPERBLOCK_OFFSET + SUPERBLOCK_LEN as u64 {
            return Ok(None);
        }
        let mut sb = [0u8; SUPERBLOCK_LEN];
        reader.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))?;
        reader.read_exact(&mut sb)?;

        if LittleEndian::read_u16(&sb[0x38..]) != EXT_MAGIC {
            return Ok(None);
        }
        let log_block = LittleEndian::read_u32(&sb[0x18..]);
        if log_block > 6 {
            return Ok(None);
        }
        let block_size = 1024u64 << log_block;
        let compat = LittleEndian::read_u32(&sb[0x5C..]);
        let incompat = LittleEndian::read_u32(&sb[0x60..]);
        let mut blocks = LittleEndian::read_u32(&sb[0x04..]) as u64;
        if incompat & INCOMPAT_64BIT != 0 {
            blocks |= (LittleEndian::read_u32(&sb[0x150..]) as u64) << 32;
        }

        let fs_type = if incompat & (INCOMPAT_EXTENTS | INCOMPAT_64BIT) != 0 {
            "ext4"
        } else if compat & COMPAT_HAS_JOURNAL != 0 {
            "ext3"
        } else {
            "ext2"
        };
        let label_bytes = &sb[0x78..0x88];
        let end = label_bytes.iter().position(|&b| b == 0).unwrap_or(16);
        let label = String::from_utf8_lossy(&label_bytes[..end]).into_owned();

        Ok(Some(Filesystem {
            fs_type: fs_type.to_string(),
            id: format_uuid(&sb[0x68..0x78]),
            label: (!label.is_empty()).then_some(label),
            size: blocks * block_size,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn ext4_image(blocks: u32, label: &str) -> Vec<u8> {
        let mut img = vec![0u8; 4096];
        let sb = &mut img[1024..2048];
        LittleEndian::write_u32(&mut sb[0x04..], blocks);
        LittleEndian::write_u32(&mut sb[0x18..], 2);
        LittleEndian::write_u16(&mut sb[0x38..], EXT_MAGIC);
        LittleEndian::write_u32(&mut sb[0x5C..], COMPAT_HAS_JOURNAL);
        LittleEndian::write_u32(&mut sb[0x60..], INCOMPAT_EXTENTS);
        for (i, b) in sb[0x68..0x78].iter_mut().enumerate() {
            *b = i as u8;
        }
        sb[0x78..0x78 + label.len()].copy_from_slice(label.as_bytes());
        img
    }

    #[test]
    fn ext4_superblock_is_identified() {
        let img = ext4_image(256, "data");
        let fs = ExtSuperblock
            .identify(img.len() as u64, &mut Cursor::new(img))
            .unwrap()
            .unwrap();
        assert_eq!(fs.fs_type, "ext4");
        assert_eq!(fs.size, 256 * 4096);
        assert_eq!(fs.label.as_deref(), Some("data"));
        assert_eq!(fs.id, "00010203-0405-0607-0809-0a0b0c0d0e0f");
    }

    #[test]
    fn blank_image_has_no_filesystem() {
        let img = vec![0u8; 8192];
        assert!(ExtSuperblock
            .identify(8192, &mut Cursor::new(img))
            .unwrap()
            .is_none());
        assert!(ExtSuperblock
            .identify(100, &mut Cursor::new(vec![0u8; 100]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn auto_size_is_bounded() {
        let auto = DiskSize::Auto {
            fraction: 0.5,
            max_bytes: 1024 * MIB,
        };
        assert_eq!(target_size(&auto, 100 * MIB), 50 * MIB);
        assert_eq!(target_size(&auto, 10_000 * MIB), 1024 * MIB);
        assert_eq!(target_size(&DiskSize::Fixed(12345), 0), 12345);
    }

    #[test]
    fn images_are_created_and_only_grown() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disks/data.img");
        assert_eq!(ensure_image(&image, &DiskSize::Fixed(4 * MIB)).unwrap(), 4 * MIB);
        assert_eq!(ensure_image(&image, &DiskSize::Fixed(8 * MIB)).unwrap(), 8 * MIB);
        assert_eq!(ensure_image(&image, &DiskSize::Fixed(2 * MIB)).unwrap(), 8 * MIB);
        assert_eq!(std::fs::metadata(&image).unwrap().len(), 8 * MIB);
    }
}
