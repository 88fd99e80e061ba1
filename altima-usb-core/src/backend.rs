//! The capability set the orchestrator drives.
//!
//! Each provisioning phase that touches the host goes through [`MediaBackend`].
//! [`HostBackend`] wires the capabilities to the [`Platform`] chosen once at
//! startup; tests substitute their own implementation.
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::device::RemovableDevice;
use crate::eject::EjectManager;
use crate::error::{EjectError, InstallError, ProbeError, WriteError};
use crate::install::BootloaderInstaller;
use crate::platform::{self, Platform};
use crate::probe::DeviceProbe;
use crate::write::MediaWriter;
use std::path::{Path, PathBuf};

pub trait MediaBackend: Send + Sync {
    /// Lists candidate devices, already filtered and deduplicated.
    fn scan(&self) -> Result<Vec<RemovableDevice>, ProbeError>;

    /// Installs the loader from `loader_archive` onto `device`. Destructive.
    fn install(&self, device: &RemovableDevice, loader_archive: &Path) -> Result<(), InstallError>;

    /// Copies `source` onto the device's loader volume. `on_progress` gets
    /// `(bytes_written, total)`.
    fn write(
        &self,
        source: &Path,
        device: &RemovableDevice,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<PathBuf, WriteError>;

    fn eject(&self, device: &RemovableDevice) -> Result<(), EjectError>;
}

pub struct HostBackend {
    platform: Box<dyn Platform>,
    min_capacity: u64,
    installer_name: Option<String>,
    volume_label: String,
    chunk_size: usize,
}

impl HostBackend {
    pub fn new(platform: Box<dyn Platform>, config: &Config) -> Self {
        Self {
            platform,
            min_capacity: config.min_capacity_bytes,
            installer_name: config.installer_name.clone(),
            volume_label: config.volume_label.clone(),
            chunk_size: config.chunk_size,
        }
    }

    /// A backend for the platform this binary was built for.
    pub fn native(config: &Config) -> Self {
        Self::new(platform::native(), config)
    }

    pub fn platform_name(&self) -> &'static str {
        self.platform.name()
    }
}

impl MediaBackend for HostBackend {
    fn scan(&self) -> Result<Vec<RemovableDevice>, ProbeError> {
        DeviceProbe::new(self.platform.as_ref(), self.min_capacity).scan()
    }

    fn install(&self, device: &RemovableDevice, loader_archive: &Path) -> Result<(), InstallError> {
        BootloaderInstaller::new(self.platform.as_ref(), self.installer_name.as_deref())
            .install(device, loader_archive)
    }

    fn write(
        &self,
        source: &Path,
        device: &RemovableDevice,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<PathBuf, WriteError> {
        MediaWriter::new(self.platform.as_ref(), &self.volume_label, self.chunk_size)
            .write(source, device, cancel, on_progress)
    }

    fn eject(&self, device: &RemovableDevice) -> Result<(), EjectError> {
        EjectManager::new(self.platform.as_ref()).eject(device)
    }
}
