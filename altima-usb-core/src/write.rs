//! Contains the logic for copying a verified image onto the prepared device.
//!
//! The loader leaves a data partition (labelled `Ventoy` by default) that
//! boots any image file placed on it. Writing therefore means: find that
//! volume, check it has room, copy the file, and confirm the copy is complete.
use crate::cancel::CancelToken;
use crate::device::RemovableDevice;
use crate::error::WriteError;
use crate::platform::Platform;
use log::{debug, info, warn};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

pub struct MediaWriter<'a> {
    platform: &'a dyn Platform,
    volume_label: String,
    chunk_size: usize,
}

impl<'a> MediaWriter<'a> {
    pub fn new(platform: &'a dyn Platform, volume_label: &str, chunk_size: usize) -> Self {
        Self {
            platform,
            volume_label: volume_label.to_string(),
            chunk_size,
        }
    }

    /// Copies `source` onto the loader volume of `device` and returns the
    /// path of the copy.
    pub fn write<F>(
        &self,
        source: &Path,
        device: &RemovableDevice,
        cancel: &CancelToken,
        on_progress: F,
    ) -> Result<PathBuf, WriteError>
    where
        F: FnMut(u64, u64),
    {
        let mount = self
            .platform
            .locate_volume(device, &self.volume_label)?
            .ok_or_else(|| WriteError::TargetNotFound {
                device: device.id.clone(),
                label: self.volume_label.clone(),
            })?;
        info!("writing {} to {}", source.display(), mount.display());
        let available = available_space(&mount);
        copy_to_volume(source, &mount, available, self.chunk_size, cancel, on_progress)
    }
}

/// Free bytes on the filesystem holding `path`, if it can be determined.
pub fn available_space(path: &Path) -> Option<u64> {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

/// Copies `source` into the `mount` directory in bounded chunks.
///
/// `available` is the free space on the volume; `None` skips the up-front
/// check (the final size comparison still catches a short write). The copy is
/// staged under a hidden name and only renamed into place once its size
/// matches the source, so an interrupted copy never looks like an image.
pub fn copy_to_volume<F>(
    source: &Path,
    mount: &Path,
    available: Option<u64>,
    chunk_size: usize,
    cancel: &CancelToken,
    mut on_progress: F,
) -> Result<PathBuf, WriteError>
where
    F: FnMut(u64, u64),
{
    let len = fs::metadata(source)?.len();
    let file_name = source.file_name().ok_or_else(|| {
        WriteError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", source.display()),
        ))
    })?;
    let dest = mount.join(file_name);

    // An older copy of the same image is replaced, so its space counts as free.
    let reclaimable = fs::metadata(&dest).map(|m| m.len()).unwrap_or(0);
    match available {
        Some(free) if free.saturating_add(reclaimable) < len => {
            return Err(WriteError::InsufficientSpace {
                needed: len,
                available: free.saturating_add(reclaimable),
            });
        }
        Some(_) => {}
        None => warn!("could not determine free space on {}", mount.display()),
    }

    let mut input = File::open(source)?;
    let mut staged = tempfile::Builder::new()
        .prefix(".altima-")
        .suffix(".part")
        .tempfile_in(mount)?;
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut written: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(WriteError::Cancelled);
        }
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        staged.write_all(&buf[..n])?;
        written += n as u64;
        on_progress(written, len);
    }

    staged.flush()?;
    staged.as_file().sync_all()?;
    let on_disk = staged.as_file().metadata()?.len();
    if on_disk != len {
        return Err(WriteError::Incomplete {
            expected: len,
            written: on_disk,
        });
    }

    staged.persist(&dest).map_err(|e| WriteError::Io(e.error))?;
    let final_len = fs::metadata(&dest)?.len();
    if final_len != len {
        // Never leave a short image where the boot menu would offer it.
        fs::remove_file(&dest).ok();
        return Err(WriteError::Incomplete {
            expected: len,
            written: final_len,
        });
    }
    debug!("wrote {len} bytes to {}", dest.display());
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".iso").tempfile().unwrap();
        file.write_all(&vec![0xA5; len]).unwrap();
        file.flush().unwrap();
        file
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn copies_and_reports_progress() {
        let src = image(10);
        let volume = tempfile::tempdir().unwrap();
        let mut progress = Vec::new();

        let dest = copy_to_volume(
            src.path(),
            volume.path(),
            Some(1 << 20),
            4,
            &CancelToken::new(),
            |n, total| progress.push((n, total)),
        )
        .unwrap();

        assert_eq!(dest, volume.path().join(src.path().file_name().unwrap()));
        assert_eq!(fs::read(&dest).unwrap(), vec![0xA5; 10]);
        assert_eq!(progress, [(4, 10), (8, 10), (10, 10)]);
        assert_eq!(entries(volume.path()).len(), 1);
    }

    #[test]
    fn refuses_when_space_is_short() {
        let src = image(100);
        let volume = tempfile::tempdir().unwrap();
        let err = copy_to_volume(src.path(), volume.path(), Some(99), 16, &CancelToken::new(), |_, _| {})
            .unwrap_err();
        assert!(matches!(
            err,
            WriteError::InsufficientSpace {
                needed: 100,
                available: 99
            }
        ));
        assert!(entries(volume.path()).is_empty());
    }

    #[test]
    fn existing_copy_counts_as_reclaimable() {
        let src = image(100);
        let volume = tempfile::tempdir().unwrap();
        let name = src.path().file_name().unwrap();
        fs::write(volume.path().join(name), vec![0u8; 60]).unwrap();

        let dest = copy_to_volume(src.path(), volume.path(), Some(50), 16, &CancelToken::new(), |_, _| {})
            .unwrap();
        assert_eq!(fs::metadata(dest).unwrap().len(), 100);
    }

    #[test]
    fn cancellation_leaves_no_partial_image() {
        let src = image(64);
        let volume = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        let err = copy_to_volume(src.path(), volume.path(), None, 8, &cancel, |n, _| {
            if n >= 24 {
                cancel.cancel();
            }
        })
        .unwrap_err();
        assert!(matches!(err, WriteError::Cancelled));
        assert!(entries(volume.path()).is_empty());
    }

    #[test]
    fn missing_volume_is_target_not_found() {
        use crate::device::BusType;
        use crate::error::{EjectError, ProbeError};
        use std::process::Command;

        struct NoVolume;
        impl Platform for NoVolume {
            fn name(&self) -> &'static str {
                "test"
            }
            fn list_devices(&self) -> Result<Vec<RemovableDevice>, ProbeError> {
                Ok(Vec::new())
            }
            fn installer_name(&self) -> &'static str {
                "none"
            }
            fn installer_command(&self, installer: &Path, _device: &RemovableDevice) -> Command {
                Command::new(installer)
            }
            fn locate_volume(&self, _: &RemovableDevice, _: &str) -> Result<Option<PathBuf>, WriteError> {
                Ok(None)
            }
            fn eject(&self, _: &RemovableDevice) -> Result<(), EjectError> {
                Ok(())
            }
        }

        let device = RemovableDevice {
            id: "/dev/sdz".to_string(),
            label: "Stick".to_string(),
            capacity: 16 << 30,
            bus: BusType::Usb,
        };
        let src = image(1);
        let err = MediaWriter::new(&NoVolume, "Ventoy", 1024)
            .write(src.path(), &device, &CancelToken::new(), |_, _| {})
            .unwrap_err();
        assert!(matches!(err, WriteError::TargetNotFound { label, .. } if label == "Ventoy"));
    }
}
