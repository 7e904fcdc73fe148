//! Block device inventory.
//!
//! Everything comes from procfs and sysfs text files, so enumeration needs
//! no privileges. Sizes are the kernel's view; opening a device to query
//! its geometry is left to [`crate::core::get_device_info`].

use crate::core::error::DiscoveryError;
use crate::types::{DeviceType, Partition};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const SECTOR_BYTES: u64 = 512;
const PROC_PARTITIONS_UNIT: u64 = 1024;

/// Where the inventory reads its host metadata from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventorySources {
    pub mounts: PathBuf,
    pub partitions: PathBuf,
    pub swaps: PathBuf,
    pub sys_class_block: PathBuf,
    /// Prefix for `device_path`, normally `/dev`.
    pub dev_dir: PathBuf,
}

impl Default for InventorySources {
    fn default() -> Self {
        Self {
            mounts: PathBuf::from("/proc/mounts"),
            partitions: PathBuf::from("/proc/partitions"),
            swaps: PathBuf::from("/proc/swaps"),
            sys_class_block: PathBuf::from("/sys/class/block"),
            dev_dir: PathBuf::from("/dev"),
        }
    }
}

impl InventorySources {
    /// Sources laid out under `root` the way the kernel lays them out.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            mounts: root.join("proc/mounts"),
            partitions: root.join("proc/partitions"),
            swaps: root.join("proc/swaps"),
            sys_class_block: root.join("sys/class/block"),
            dev_dir: PathBuf::from("/dev"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MountEntry {
    mount_point: String,
    fs_type: String,
}

/// Lists the host's block devices.
///
/// With `filtered`, whole disks that are not mounted, loop devices and swap
/// are left out.
pub fn get_partitions(filtered: bool) -> Result<Vec<Partition>, DiscoveryError> {
    get_partitions_from(&InventorySources::default(), filtered)
}

pub fn get_partitions_from(
    sources: &InventorySources,
    filtered: bool,
) -> Result<Vec<Partition>, DiscoveryError> {
    let mounts = read_mounts(&sources.mounts)?;
    let fallback_sizes = read_partition_sizes(&sources.partitions);
    let swaps = read_swaps(&sources.swaps);

    let entries =
        fs::read_dir(&sources.sys_class_block).map_err(|source| DiscoveryError::DeviceList {
            path: sources.sys_class_block.clone(),
            source,
        })?;

    let mut partitions = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let sys_dir = sources.sys_class_block.join(&name);
        let device_path = sources.dev_dir.join(&name).to_string_lossy().into_owned();

        let mount = mounts.get(&device_path);
        let fs_type = if swaps.contains(&device_path) {
            "swap".to_string()
        } else {
            mount.map_or_else(|| "unknown".to_string(), |m| m.fs_type.clone())
        };

        let size_bytes = read_sector_count(&sys_dir)
            .and_then(|sectors| sectors.checked_mul(SECTOR_BYTES))
            .or_else(|| fallback_sizes.get(&name).copied())
            .unwrap_or(0);

        partitions.push(Partition {
            device_type: detect_device_type(&name, &sys_dir),
            is_mounted: mount.is_some(),
            mount_point: mount.map(|m| m.mount_point.clone()),
            name,
            device_path,
            fs_type,
            size_bytes,
        });
    }

    if filtered {
        partitions.retain(|p| {
            let idle_disk = p.device_type == DeviceType::Disk && !p.is_mounted;
            !idle_disk && !p.name.starts_with("loop") && p.fs_type != "swap"
        });
    }
    partitions.sort_by(|a, b| a.name.cmp(&b.name));

    debug!(count = partitions.len(), filtered, "enumerated block devices");
    Ok(partitions)
}

/// Maps `/dev/...` sources to where and how they are mounted. The first
/// mount of a device wins.
fn read_mounts(path: &Path) -> Result<HashMap<String, MountEntry>, DiscoveryError> {
    let content = fs::read_to_string(path).map_err(|source| DiscoveryError::MountTable {
        path: path.to_path_buf(),
        source,
    })?;

    let mut mounts = HashMap::new();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let (Some(source), Some(target), Some(fs_type)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !source.starts_with("/dev/") {
            continue;
        }

        mounts
            .entry(resolve_dev_link(source))
            .or_insert_with(|| MountEntry {
                mount_point: unescape_mount_field(target),
                fs_type: fs_type.to_string(),
            });
    }
    Ok(mounts)
}

/// `/dev/mapper/vg-root` and friends are symlinks to `/dev/dm-N`.
fn resolve_dev_link(source: &str) -> String {
    fs::canonicalize(source)
        .ok()
        .filter(|p| p.starts_with("/dev"))
        .map_or_else(|| source.to_string(), |p| p.to_string_lossy().into_owned())
}

/// Decodes the octal escapes (`\040` for a space, ...) the kernel uses in
/// mount table fields.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// `/proc/partitions` sizes in bytes, keyed by device name. Best-effort.
fn read_partition_sizes(path: &Path) -> HashMap<String, u64> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "partition table unavailable, sizes come from sysfs only");
            return HashMap::new();
        }
    };

    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [_, _, blocks, name] => blocks
                    .parse::<u64>()
                    .ok()
                    .and_then(|b| b.checked_mul(PROC_PARTITIONS_UNIT))
                    .map(|bytes| (name.to_string(), bytes)),
                _ => None,
            }
        })
        .collect()
}

/// Device paths of active swap partitions. Best-effort.
fn read_swaps(path: &Path) -> HashSet<String> {
    let Ok(content) = fs::read_to_string(path) else {
        return HashSet::new();
    };
    content
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .filter(|source| source.starts_with("/dev/"))
        .map(resolve_dev_link)
        .collect()
}

fn read_sector_count(sys_dir: &Path) -> Option<u64> {
    fs::read_to_string(sys_dir.join("size"))
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn detect_device_type(name: &str, sys_dir: &Path) -> DeviceType {
    if name.starts_with("dm-") {
        return DeviceType::Lvm;
    }
    if name.starts_with("loop") {
        return DeviceType::Loop;
    }

    let Ok(uevent) = fs::read_to_string(sys_dir.join("uevent")) else {
        return DeviceType::Unknown;
    };
    match uevent
        .lines()
        .find_map(|line| line.strip_prefix("DEVTYPE="))
        .map(str::trim)
    {
        Some("disk") => DeviceType::Disk,
        Some("partition") => DeviceType::Partition,
        _ => DeviceType::Unknown,
    }
}
