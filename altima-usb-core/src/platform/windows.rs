use super::{Platform, parse_size, powershell, ps_quote, run_eject_step, run_probe};
use crate::device::{BusType, RemovableDevice};
use crate::error::{EjectError, ProbeError, WriteError};
use crate::process;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::process::Command;

const LIST_USB_DISKS: &str = "Get-Disk | Where-Object { $_.BusType -eq 'USB' } | \
     ForEach-Object { \"$($_.Number)|$($_.FriendlyName)|$($_.Size)|$($_.BusType)\" }";

/// Windows: PowerShell storage cmdlets for discovery and volumes,
/// `Ventoy2Disk.exe` in CLI mode for the loader.
pub struct Windows;

impl Platform for Windows {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn list_devices(&self) -> Result<Vec<RemovableDevice>, ProbeError> {
        let out = run_probe(&mut powershell(LIST_USB_DISKS))?;
        Ok(parse_disk_lines(&out.stdout_lossy()))
    }

    fn installer_name(&self) -> &'static str {
        "Ventoy2Disk.exe"
    }

    fn installer_command(&self, installer: &Path, device: &RemovableDevice) -> Command {
        // Start-Process is the only way to get a UAC prompt; -PassThru lets us
        // forward the installer's exit code.
        let script = format!(
            "$p = Start-Process -FilePath {} -ArgumentList 'VTOYCLI','/I',{} \
             -Verb RunAs -Wait -PassThru; exit $p.ExitCode",
            ps_quote(&installer.to_string_lossy()),
            ps_quote(&format!("/PhyDrive:{}", device.id)),
        );
        let mut cmd = powershell(&script);
        if let Some(dir) = installer.parent() {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn locate_volume(
        &self,
        device: &RemovableDevice,
        label: &str,
    ) -> Result<Option<PathBuf>, WriteError> {
        let script = format!(
            "(Get-Partition -DiskNumber {} | Get-Volume | \
             Where-Object {{ $_.FileSystemLabel -eq {} }}).DriveLetter",
            disk_number(device)?,
            ps_quote(label),
        );
        let out = process::run(&mut powershell(&script), None)?;
        if !out.success() {
            warn!("volume lookup on disk {} failed: {}", device.id, out.stderr);
            return Ok(None);
        }
        Ok(parse_drive_letter(&out.stdout_lossy()))
    }

    fn eject(&self, device: &RemovableDevice) -> Result<(), EjectError> {
        let number = disk_number(device).map_err(|e| EjectError::ToolFailed {
            tool: "powershell".to_string(),
            code: None,
            stderr: e.to_string(),
        })?;
        let script = format!(
            "Get-Partition -DiskNumber {number} | Where-Object DriveLetter | \
             ForEach-Object {{ (New-Object -ComObject Shell.Application).Namespace(17)\
             .ParseName(\"$($_.DriveLetter):\").InvokeVerb('Eject') }}"
        );
        debug!("ejecting disk {number}");
        run_eject_step(&mut powershell(&script))?;
        Ok(())
    }
}

fn disk_number(device: &RemovableDevice) -> Result<u32, WriteError> {
    device.id.trim().parse().map_err(|_| WriteError::TargetNotFound {
        device: device.id.clone(),
        label: "disk number".to_string(),
    })
}

/// Parses `Number|FriendlyName|Size[|BusType]` lines. Sizes may be raw byte
/// counts or rounded values such as `15GB`.
pub fn parse_disk_lines(text: &str) -> Vec<RemovableDevice> {
    let mut devices = Vec::new();
    for line in text.lines() {
        let cols: Vec<&str> = line.split('|').map(str::trim).collect();
        if cols.len() < 3 {
            if !line.trim().is_empty() {
                debug!("skipping short disk line: {line:?}");
            }
            continue;
        }
        let (Ok(number), Some(capacity)) = (cols[0].parse::<u32>(), parse_size(cols[2])) else {
            debug!("skipping malformed disk line: {line:?}");
            continue;
        };
        let bus = match cols.get(3) {
            None => BusType::Usb,
            Some(b) if b.eq_ignore_ascii_case("usb") => BusType::Usb,
            Some(b) if b.eq_ignore_ascii_case("sd") || b.eq_ignore_ascii_case("mmc") => {
                BusType::Removable
            }
            Some(b) => BusType::Other(b.to_string()),
        };
        devices.push(RemovableDevice {
            id: number.to_string(),
            label: cols[1].to_string(),
            capacity,
            bus,
        });
    }
    devices
}

fn parse_drive_letter(text: &str) -> Option<PathBuf> {
    text.lines()
        .map(str::trim)
        .find(|l| l.len() == 1 && l.chars().all(|c| c.is_ascii_alphabetic()))
        .map(|letter| PathBuf::from(format!("{letter}:\\")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_disk_lines_tolerating_columns() {
        let text = "\r\n1|SanDisk Cruzer Blade|16008609792|USB\r\n\
                    2 | Kingston DataTraveler | 32GB\r\n\
                    not a disk line\r\n\
                    x|Broken|123|USB\r\n\
                    3|Card Reader|31914983424|SD\r\n";
        let devices = parse_disk_lines(text);
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].id, "1");
        assert_eq!(devices[0].label, "SanDisk Cruzer Blade");
        assert_eq!(devices[1].capacity, 32 << 30);
        assert_eq!(devices[1].bus, BusType::Usb);
        assert_eq!(devices[2].bus, BusType::Removable);
    }

    #[test]
    fn drive_letter_becomes_root_path() {
        assert_eq!(parse_drive_letter("\r\nE\r\n"), Some(PathBuf::from("E:\\")));
        assert_eq!(parse_drive_letter("\r\n"), None);
    }

    #[test]
    fn installer_targets_physical_drive() {
        let device = RemovableDevice {
            id: "2".to_string(),
            label: "Kingston".to_string(),
            capacity: 32 << 30,
            bus: BusType::Usb,
        };
        let cmd = Windows.installer_command(Path::new("C:/t/ventoy-1.0.99/Ventoy2Disk.exe"), &device);
        let script = cmd.get_args().last().unwrap().to_string_lossy().into_owned();
        assert!(script.contains("'/PhyDrive:2'"));
        assert!(script.contains("-Verb RunAs -Wait -PassThru"));
        assert!(script.contains("'C:/t/ventoy-1.0.99/Ventoy2Disk.exe'"));
    }
}
