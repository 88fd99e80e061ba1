//! Installs the multiboot loader onto a device. This erases the device.
use crate::archive;
use crate::device::RemovableDevice;
use crate::error::InstallError;
use crate::platform::Platform;
use crate::process::{self, ToolOutput};
use log::{debug, info};
use std::io;
use std::path::Path;

/// Lines of installer output kept when it fails without writing to stderr.
const OUTPUT_TAIL_LINES: usize = 10;

pub struct BootloaderInstaller<'a> {
    platform: &'a dyn Platform,
    installer_name: String,
}

impl<'a> BootloaderInstaller<'a> {
    /// `installer_name` overrides the platform's default installer file name.
    pub fn new(platform: &'a dyn Platform, installer_name: Option<&str>) -> Self {
        Self {
            platform,
            installer_name: installer_name
                .unwrap_or_else(|| platform.installer_name())
                .to_string(),
        }
    }

    /// Unpacks `loader_archive` to a scratch directory and runs the installer
    /// it contains against `device`.
    ///
    /// Once the installer has been started it always runs to completion; the
    /// scratch directory is removed afterwards.
    pub fn install(&self, device: &RemovableDevice, loader_archive: &Path) -> Result<(), InstallError> {
        let scratch = tempfile::Builder::new().prefix("altima-loader-").tempdir()?;
        archive::extract(loader_archive, scratch.path())?;
        let installer = archive::find_installer(scratch.path(), &self.installer_name)?;

        let mut cmd = self.platform.installer_command(&installer, device);
        info!("installing loader on {} using {}", device.id, installer.display());
        let out = process::run(&mut cmd, self.platform.installer_input()).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                InstallError::ToolMissing(process::program_name(&cmd))
            } else {
                InstallError::Io(e)
            }
        })?;
        debug!("installer output:\n{}", out.stdout_lossy());

        if !out.success() {
            return Err(InstallError::ToolFailed {
                code: out.code,
                stderr: failure_text(&out),
            });
        }
        Ok(())
    }
}

/// Ventoy2Disk reports most problems on stdout, so fall back to its tail.
fn failure_text(out: &ToolOutput) -> String {
    if !out.stderr.is_empty() {
        return out.stderr.clone();
    }
    let stdout = out.stdout_lossy();
    let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(OUTPUT_TAIL_LINES)..].join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::device::BusType;
    use crate::error::{EjectError, ProbeError, WriteError};
    use std::io::Write;
    use std::path::PathBuf;
    use std::process::Command;

    /// Runs the located installer with `sh`, passing the device id.
    struct ShellPlatform;

    impl Platform for ShellPlatform {
        fn name(&self) -> &'static str {
            "test"
        }
        fn list_devices(&self) -> Result<Vec<RemovableDevice>, ProbeError> {
            Ok(Vec::new())
        }
        fn installer_name(&self) -> &'static str {
            "Installer.bin"
        }
        fn installer_command(&self, installer: &Path, device: &RemovableDevice) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg(installer).arg(&device.id);
            cmd
        }
        fn installer_input(&self) -> Option<&'static [u8]> {
            Some(b"y\n")
        }
        fn locate_volume(
            &self,
            _device: &RemovableDevice,
            _label: &str,
        ) -> Result<Option<PathBuf>, WriteError> {
            Ok(None)
        }
        fn eject(&self, _device: &RemovableDevice) -> Result<(), EjectError> {
            Ok(())
        }
    }

    fn device(id: &str) -> RemovableDevice {
        RemovableDevice {
            id: id.to_string(),
            label: "Stick".to_string(),
            capacity: 16 << 30,
            bus: BusType::Usb,
        }
    }

    fn loader_zip(script: &str) -> tempfile::TempPath {
        let file = tempfile::Builder::new().suffix(".zip").tempfile().unwrap();
        let mut zip = zip::ZipWriter::new(file.reopen().unwrap());
        zip.start_file("loader/Installer.bin", zip::write::FileOptions::default())
            .unwrap();
        zip.write_all(script.as_bytes()).unwrap();
        zip.finish().unwrap();
        file.into_temp_path()
    }

    #[test]
    fn runs_installer_against_device() {
        let marker = tempfile::NamedTempFile::new().unwrap();
        let script = format!(
            "read answer\necho \"$1 $answer\" > {}\n",
            marker.path().display()
        );
        let archive = loader_zip(&script);

        BootloaderInstaller::new(&ShellPlatform, None)
            .install(&device("/dev/sdz"), &archive)
            .unwrap();
        assert_eq!(std::fs::read_to_string(marker.path()).unwrap(), "/dev/sdz y\n");
    }

    #[test]
    fn non_zero_exit_is_tool_failed() {
        let archive = loader_zip("echo 'Disk is in use' >&2\nexit 4\n");
        let err = BootloaderInstaller::new(&ShellPlatform, None)
            .install(&device("/dev/sdz"), &archive)
            .unwrap_err();
        match err {
            InstallError::ToolFailed { code, stderr } => {
                assert_eq!(code, Some(4));
                assert_eq!(stderr, "Disk is in use");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stdout_tail_is_used_when_stderr_is_silent() {
        let archive = loader_zip("echo step one\necho '[ERROR] not a USB disk'\nexit 1\n");
        let err = BootloaderInstaller::new(&ShellPlatform, None)
            .install(&device("/dev/sdz"), &archive)
            .unwrap_err();
        assert!(
            matches!(err, InstallError::ToolFailed { stderr, .. } if stderr.ends_with("[ERROR] not a USB disk"))
        );
    }

    #[test]
    fn archive_without_installer_is_tool_missing() {
        let archive = loader_zip("exit 0\n");
        let err = BootloaderInstaller::new(&ShellPlatform, Some("Ventoy2Disk.sh"))
            .install(&device("/dev/sdz"), &archive)
            .unwrap_err();
        assert!(matches!(err, InstallError::ToolMissing(name) if name == "Ventoy2Disk.sh"));
    }
}
