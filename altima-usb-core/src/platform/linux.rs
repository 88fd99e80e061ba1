use super::{Platform, field, is_root, parse_pairs, parse_size, run_eject_step, run_probe};
use crate::device::{BusType, RemovableDevice};
use crate::error::{EjectError, ProbeError, WriteError};
use crate::process;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Linux: `lsblk` for discovery, `Ventoy2Disk.sh` for the loader, `udisksctl`
/// for mounting and power-off.
pub struct Linux;

impl Platform for Linux {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn list_devices(&self) -> Result<Vec<RemovableDevice>, ProbeError> {
        let out = run_probe(Command::new("lsblk").args([
            "-P",
            "-b",
            "-d",
            "-o",
            "NAME,SIZE,MODEL,TRAN,RM,TYPE",
        ]))?;
        let system_disk = system_disk_parent();
        Ok(parse_lsblk_disks(&out.stdout_lossy())
            .into_iter()
            .filter(|d| match &system_disk {
                Some(sys) => Path::new(&d.id) != sys.as_path(),
                None => true,
            })
            .collect())
    }

    fn installer_name(&self) -> &'static str {
        "Ventoy2Disk.sh"
    }

    fn installer_command(&self, installer: &Path, device: &RemovableDevice) -> Command {
        // The script resolves its helper binaries relative to its own directory.
        let mut cmd = if is_root() {
            Command::new("bash")
        } else {
            let mut sudo = Command::new("sudo");
            sudo.arg("bash");
            sudo
        };
        cmd.arg(installer).args(["-i", &device.id]);
        if let Some(dir) = installer.parent() {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn installer_input(&self) -> Option<&'static [u8]> {
        // Ventoy2Disk.sh asks twice before it wipes the disk.
        Some(b"y\ny\n")
    }

    fn locate_volume(
        &self,
        device: &RemovableDevice,
        label: &str,
    ) -> Result<Option<PathBuf>, WriteError> {
        let out = process::run(
            Command::new("lsblk").args(["-P", "-p", "-o", "NAME,LABEL,MOUNTPOINT", &device.id]),
            None,
        )?;
        let volumes = if out.success() {
            parse_volumes(&out.stdout_lossy())
        } else {
            warn!("lsblk could not list volumes of {}: {}", device.id, out.stderr);
            Vec::new()
        };

        if let Some(vol) = volumes
            .iter()
            .find(|v| v.label.eq_ignore_ascii_case(label) && v.name != device.id)
        {
            if let Some(mount) = &vol.mount_point {
                return Ok(Some(mount.clone()));
            }
            info!("mounting {} ({label})", vol.name);
            let out = process::run(Command::new("udisksctl").args(["mount", "-b", &vol.name]), None)?;
            if out.success() {
                if let Some(mount) = parse_udisks_mount(&out.stdout_lossy()) {
                    return Ok(Some(mount));
                }
            } else {
                warn!("udisksctl mount {} failed: {}", vol.name, out.stderr);
            }
        }

        // udev may not have re-read the new partition table yet, but the
        // desktop automounter can already have mounted the volume.
        Ok(mounted_from(&host_mounts(), &device.id, label))
    }

    fn eject(&self, device: &RemovableDevice) -> Result<(), EjectError> {
        #[cfg(unix)]
        nix::unistd::sync();

        let out = run_eject_step(Command::new("lsblk").args([
            "-P",
            "-p",
            "-o",
            "NAME,LABEL,MOUNTPOINT",
            &device.id,
        ]))?;
        for vol in parse_volumes(&out.stdout_lossy()) {
            if vol.mount_point.is_some() && vol.name != device.id {
                debug!("unmounting {}", vol.name);
                run_eject_step(Command::new("udisksctl").args(["unmount", "-b", &vol.name]))?;
            }
        }
        run_eject_step(Command::new("udisksctl").args(["power-off", "-b", &device.id]))?;
        Ok(())
    }
}

/// Parses `lsblk -P -b -d -o NAME,SIZE,MODEL,TRAN,RM,TYPE` output.
///
/// Lines without a name or a parsable size are skipped, as are non-disk rows.
pub fn parse_lsblk_disks(text: &str) -> Vec<RemovableDevice> {
    let mut devices = Vec::new();
    for line in text.lines() {
        let Some(pairs) = parse_pairs(line) else {
            if !line.trim().is_empty() {
                debug!("skipping unparsable lsblk line: {line:?}");
            }
            continue;
        };
        let (Some(name), Some(capacity)) = (
            field(&pairs, "NAME").filter(|n| !n.is_empty()),
            field(&pairs, "SIZE").and_then(parse_size),
        ) else {
            debug!("skipping incomplete lsblk line: {line:?}");
            continue;
        };
        if field(&pairs, "TYPE").is_some_and(|t| t != "disk") {
            continue;
        }

        let tran = field(&pairs, "TRAN").unwrap_or("").trim();
        let bus = if tran.eq_ignore_ascii_case("usb") {
            BusType::Usb
        } else if field(&pairs, "RM") == Some("1") {
            BusType::Removable
        } else if tran.is_empty() {
            BusType::Other("unknown".to_string())
        } else {
            BusType::Other(tran.to_string())
        };

        let model = field(&pairs, "MODEL").unwrap_or("").trim();
        devices.push(RemovableDevice {
            id: if name.starts_with('/') {
                name.to_string()
            } else {
                format!("/dev/{name}")
            },
            label: if model.is_empty() {
                name.to_string()
            } else {
                model.to_string()
            },
            capacity,
            bus,
        });
    }
    devices
}

#[derive(Debug, PartialEq)]
struct Volume {
    name: String,
    label: String,
    mount_point: Option<PathBuf>,
}

/// Parses `lsblk -P -p -o NAME,LABEL,MOUNTPOINT <dev>` output.
fn parse_volumes(text: &str) -> Vec<Volume> {
    text.lines()
        .filter_map(parse_pairs)
        .filter_map(|pairs| {
            let name = field(&pairs, "NAME")?;
            Some(Volume {
                name: name.to_string(),
                label: field(&pairs, "LABEL").unwrap_or("").to_string(),
                mount_point: field(&pairs, "MOUNTPOINT")
                    .filter(|m| !m.is_empty())
                    .map(PathBuf::from),
            })
        })
        .collect()
}

/// Extracts the mount point from `Mounted /dev/sdb1 at /media/user/Ventoy.`
fn parse_udisks_mount(text: &str) -> Option<PathBuf> {
    let (_, rest) = text.trim().split_once(" at ")?;
    let path = rest.trim().trim_end_matches('.');
    if path.is_empty() {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

/// `(partition, mount point)` for every mounted filesystem on the host.
fn host_mounts() -> Vec<(PathBuf, PathBuf)> {
    sysinfo::Disks::new_with_refreshed_list()
        .iter()
        .map(|d| {
            (
                PathBuf::from("/dev/").join(d.name()),
                d.mount_point().to_path_buf(),
            )
        })
        .collect()
}

/// The mount point named exactly `label` (ignoring case) whose partition
/// belongs to `device`. Automounters name the directory after the label,
/// e.g. `/media/<user>/Ventoy`.
fn mounted_from(mounts: &[(PathBuf, PathBuf)], device: &str, label: &str) -> Option<PathBuf> {
    let device = Path::new(device);
    mounts
        .iter()
        .find(|(partition, mount)| {
            partition.as_path() != device
                && parent_device_path(partition) == device
                && mount
                    .file_name()
                    .is_some_and(|name| name.to_string_lossy().eq_ignore_ascii_case(label))
        })
        .map(|(_, mount)| mount.clone())
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
fn parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") || path_str.starts_with("/dev/vd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

/// The disk holding `/`, which must never be offered.
fn system_disk_parent() -> Option<PathBuf> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let root = disks.iter().find(|d| d.mount_point() == Path::new("/"));
    match root {
        Some(disk) => Some(parent_device_path(
            &PathBuf::from("/dev/").join(disk.name()),
        )),
        None => {
            warn!("could not determine the system drive");
            None
        }
    }
}
