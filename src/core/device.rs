use super::error::DeviceIoError;
use crate::types::{DEFAULT_SECTOR_SIZE, DeviceInfo};
use rustix::fs::Access;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use tracing::{debug, warn};

/// Queries the geometry of a device node or image file.
///
/// Block special files are asked through `BLKGETSIZE64`, `BLKSSZGET` and
/// `BLKROGET`; any of those failing is fatal. `BLKPBSZGET` is optional and
/// falls back to the logical sector size. Anything else is treated as a
/// plain file: `stat` size, 512-byte sectors and a write-access check for
/// `read_only`.
pub fn get_device_info(path: impl AsRef<Path>) -> Result<DeviceInfo, DeviceIoError> {
    let path = path.as_ref();

    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| DeviceIoError::from_io(path, e))?;
    let metadata = file.metadata().map_err(|e| DeviceIoError::from_io(path, e))?;

    if metadata.file_type().is_block_device() {
        return block_device_info(&file, path);
    }

    let read_only = rustix::fs::access(path, Access::WRITE_OK).is_err();
    debug!(path = %path.display(), size = metadata.len(), "using file-backed geometry");

    Ok(DeviceInfo {
        size_bytes: metadata.len(),
        logical_sector_size: DEFAULT_SECTOR_SIZE,
        physical_sector_size: DEFAULT_SECTOR_SIZE,
        read_only,
        is_block_device: false,
    })
}

#[cfg(target_os = "linux")]
fn block_device_info(file: &File, path: &Path) -> Result<DeviceInfo, DeviceIoError> {
    let fail = |request: &'static str| {
        move |source: std::io::Error| DeviceIoError::Ioctl {
            path: path.to_path_buf(),
            request,
            source,
        }
    };

    let size_bytes = ioctl::size_bytes(file).map_err(fail("BLKGETSIZE64"))?;
    let logical = ioctl::logical_sector_size(file).map_err(fail("BLKSSZGET"))?;
    let read_only = ioctl::read_only(file).map_err(fail("BLKROGET"))?;

    let physical = match ioctl::physical_sector_size(file) {
        Ok(size) if size > 0 => size,
        Ok(_) => logical,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "BLKPBSZGET unsupported, using logical sector size");
            logical
        }
    };

    Ok(DeviceInfo {
        size_bytes,
        logical_sector_size: logical,
        physical_sector_size: physical,
        read_only,
        is_block_device: true,
    })
}

#[cfg(not(target_os = "linux"))]
fn block_device_info(_file: &File, path: &Path) -> Result<DeviceInfo, DeviceIoError> {
    Err(DeviceIoError::Ioctl {
        path: path.to_path_buf(),
        request: "BLKGETSIZE64",
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Not supported on this platform",
        ),
    })
}

#[cfg(target_os = "linux")]
mod ioctl {
    use std::fs::File;
    use std::io;
    use std::os::fd::AsRawFd;

    // linux/fs.h
    const BLKROGET: libc::c_ulong = 0x125e;
    const BLKSSZGET: libc::c_ulong = 0x1268;
    const BLKPBSZGET: libc::c_ulong = 0x127b;
    const BLKGETSIZE64: libc::c_ulong = 0x80081272;

    pub fn size_bytes(file: &File) -> io::Result<u64> {
        let mut size: u64 = 0;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(size)
    }

    pub fn logical_sector_size(file: &File) -> io::Result<u32> {
        let mut size: libc::c_int = 0;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKSSZGET as _, &mut size) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        u32::try_from(size).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative sector size"))
    }

    pub fn physical_sector_size(file: &File) -> io::Result<u32> {
        let mut size: libc::c_uint = 0;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKPBSZGET as _, &mut size) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(size)
    }

    pub fn read_only(file: &File) -> io::Result<bool> {
        let mut flag: libc::c_int = 0;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKROGET as _, &mut flag) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(flag != 0)
    }
}
