use super::{Platform, is_root, run_eject_step, run_probe};
use crate::device::{BusType, RemovableDevice};
use crate::error::{EjectError, ProbeError, WriteError};
use crate::process;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::process::Command;

/// macOS: `diskutil` for discovery, volumes and eject.
pub struct MacOs;

impl Platform for MacOs {
    fn name(&self) -> &'static str {
        "macos"
    }

    fn list_devices(&self) -> Result<Vec<RemovableDevice>, ProbeError> {
        let out = run_probe(Command::new("diskutil").args(["list", "external", "physical"]))?;
        let mut devices = parse_diskutil_list(&out.stdout_lossy());
        // "external" also covers Thunderbolt and PCIe enclosures.
        for device in &mut devices {
            let info = run_probe(Command::new("diskutil").args(["info", &device.id]))?;
            device.bus = bus_from_info(&info.stdout_lossy());
        }
        Ok(devices)
    }

    fn installer_name(&self) -> &'static str {
        "Ventoy2Disk.sh"
    }

    fn installer_command(&self, installer: &Path, device: &RemovableDevice) -> Command {
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
        Some(b"y\ny\n")
    }

    fn locate_volume(
        &self,
        device: &RemovableDevice,
        label: &str,
    ) -> Result<Option<PathBuf>, WriteError> {
        let out = process::run(Command::new("diskutil").args(["list", &device.id]), None)?;
        if !out.success() {
            warn!("diskutil list {} failed: {}", device.id, out.stderr);
            return Ok(None);
        }
        let Some(partition) = partition_with_label(&out.stdout_lossy(), label) else {
            return Ok(None);
        };

        let info = process::run(
            Command::new("diskutil").args(["info", &format!("/dev/{partition}")]),
            None,
        )?;
        if !info.success() {
            warn!("diskutil info {partition} failed: {}", info.stderr);
            return Ok(None);
        }
        Ok(info_field(&info.stdout_lossy(), "Mount Point").map(PathBuf::from))
    }

    fn eject(&self, device: &RemovableDevice) -> Result<(), EjectError> {
        debug!("ejecting {}", device.id);
        run_eject_step(Command::new("diskutil").args(["eject", &device.id]))?;
        Ok(())
    }
}

/// Parses `diskutil list external physical`. Each disk starts with a
/// `/dev/diskN (external, physical):` header; its size is the starred value
/// on the partition-scheme row (`0:`). The bus is left unknown until
/// [`bus_from_info`] classifies it.
pub fn parse_diskutil_list(text: &str) -> Vec<RemovableDevice> {
    let mut devices = Vec::new();
    let mut current: Option<String> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("/dev/disk") {
            current = trimmed
                .split_whitespace()
                .next()
                .map(|id| id.trim_end_matches(':').to_string());
            continue;
        }
        let Some(id) = &current else { continue };
        if !trimmed.starts_with("0:") {
            continue;
        }
        let Some(capacity) = starred_size(trimmed) else {
            debug!("no size on diskutil row: {line:?}");
            continue;
        };
        let scheme = trimmed[2..].split_whitespace().next().unwrap_or("");
        devices.push(RemovableDevice {
            id: id.clone(),
            label: format!("External disk ({})", scheme.trim_end_matches("_partition_scheme")),
            capacity,
            bus: BusType::Other("unknown".to_string()),
        });
        current = None;
    }
    devices
}

/// `*16.0 GB` → bytes. diskutil reports decimal units.
fn starred_size(row: &str) -> Option<u64> {
    let star = row.find('*')?;
    let mut parts = row[star + 1..].split_whitespace();
    let number: f64 = parts.next()?.parse().ok()?;
    let multiplier: f64 = match parts.next()? {
        "B" | "Bytes" => 1.0,
        "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return None,
    };
    Some((number * multiplier).round() as u64)
}

/// The identifier (last column) of the partition row naming `label`.
fn partition_with_label(text: &str, label: &str) -> Option<String> {
    text.lines()
        .filter(|l| {
            l.split_whitespace()
                .any(|word| word.eq_ignore_ascii_case(label))
        })
        .filter_map(|l| l.split_whitespace().last())
        .find(|id| id.starts_with("disk") && id.contains('s'))
        .map(str::to_string)
}

/// Classifies a disk from `diskutil info` output by its `Protocol` line.
pub fn bus_from_info(text: &str) -> BusType {
    match info_field(text, "Protocol") {
        Some(p) if p.eq_ignore_ascii_case("USB") => BusType::Usb,
        Some(p) if p.eq_ignore_ascii_case("Secure Digital") => BusType::Removable,
        Some(p) => BusType::Other(p.to_lowercase()),
        None => {
            debug!("diskutil info has no protocol line");
            BusType::Other("unknown".to_string())
        }
    }
}

fn info_field<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines().find_map(|l| {
        let (k, v) = l.split_once(':')?;
        (k.trim() == key && !v.trim().is_empty()).then(|| v.trim())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = "/dev/disk4 (external, physical):
   #:                       TYPE NAME                    SIZE       IDENTIFIER
   0:     FDisk_partition_scheme                        *16.0 GB    disk4
   1:                 DOS_FAT_32 UNTITLED                16.0 GB    disk4s1

/dev/disk5 (external, physical):
   #:                       TYPE NAME                    SIZE       IDENTIFIER
   0:      GUID_partition_scheme                        *64.1 GB    disk5
   1:                        EFI EFI                     209.7 MB   disk5s1
";

    #[test]
    fn parses_external_disks() {
        let devices = parse_diskutil_list(LIST);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, "/dev/disk4");
        assert_eq!(devices[0].capacity, 16_000_000_000);
        assert_eq!(devices[0].label, "External disk (FDisk)");
        assert_eq!(devices[1].id, "/dev/disk5");
        assert_eq!(devices[1].capacity, 64_100_000_000);
        assert!(devices.iter().all(|d| !d.bus.is_removable()));
    }

    #[test]
    fn bus_comes_from_the_protocol_line() {
        let usb = "   Device Identifier:         disk4\n   Protocol:                  USB\n   Removable Media:           Removable\n";
        assert_eq!(bus_from_info(usb), BusType::Usb);

        let sd = "   Protocol:                  Secure Digital\n";
        assert_eq!(bus_from_info(sd), BusType::Removable);

        let thunderbolt = "   Device Identifier:         disk5\n   Protocol:                  PCI-Express\n   Device Location:           External\n";
        assert_eq!(bus_from_info(thunderbolt), BusType::Other("pci-express".to_string()));
        assert!(!bus_from_info(thunderbolt).is_removable());

        assert!(!bus_from_info("   Device Identifier:         disk6\n").is_removable());
    }

    #[test]
    fn finds_ventoy_partition_and_mount_point() {
        let list = "/dev/disk4 (external, physical):
   0:     FDisk_partition_scheme                        *16.0 GB    disk4
   1:               Windows_NTFS Ventoy                  16.0 GB    disk4s1
   2:                 DOS_FAT_32 VTOYEFI                 33.6 MB    disk4s2
";
        assert_eq!(partition_with_label(list, "ventoy").as_deref(), Some("disk4s1"));

        let info = "   Device Identifier:         disk4s1\n   Mount Point:               /Volumes/Ventoy\n";
        assert_eq!(info_field(info, "Mount Point"), Some("/Volumes/Ventoy"));
        assert_eq!(info_field("   Mount Point:\n", "Mount Point"), None);
    }
}
