//! Safe removal of a provisioned device.
use crate::device::RemovableDevice;
use crate::error::EjectError;
use crate::platform::Platform;
use log::{info, warn};
use std::thread;
use std::time::Duration;

pub struct EjectManager<'a> {
    platform: &'a dyn Platform,
    attempts: u32,
    delay: Duration,
}

impl<'a> EjectManager<'a> {
    pub fn new(platform: &'a dyn Platform) -> Self {
        Self {
            platform,
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }

    /// Overrides how often a failing eject tool is retried and how long to
    /// wait in between.
    pub fn with_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.delay = delay;
        self
    }

    /// Unmounts the device and powers it off where the platform supports it.
    ///
    /// Desktop automounters and indexers often hold the freshly written
    /// volume for a moment, so tool failures are retried. I/O errors (such as
    /// a missing tool) are returned at once.
    pub fn eject(&self, device: &RemovableDevice) -> Result<(), EjectError> {
        let mut attempt = 1;
        loop {
            match self.platform.eject(device) {
                Ok(()) => {
                    info!("ejected {}", device.id);
                    return Ok(());
                }
                Err(e @ EjectError::ToolFailed { .. }) if attempt < self.attempts => {
                    warn!("eject of {} failed (attempt {attempt}): {e}", device.id);
                    attempt += 1;
                    thread::sleep(self.delay);
                }
                Err(e) => {
                    warn!("could not eject {}: {e}", device.id);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BusType;
    use crate::error::{ProbeError, WriteError};
    use std::io;
    use std::path::{Path, PathBuf};
    use std::process::Command;
    use std::sync::Mutex;

    /// Fails the first `failures` ejects with the given error kind.
    struct Flaky {
        failures: u32,
        calls: Mutex<u32>,
        io_error: bool,
    }

    impl Flaky {
        fn new(failures: u32, io_error: bool) -> Self {
            Self {
                failures,
                calls: Mutex::new(0),
                io_error,
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl Platform for Flaky {
        fn name(&self) -> &'static str {
            "test"
        }
        fn list_devices(&self) -> Result<Vec<RemovableDevice>, ProbeError> {
            Ok(Vec::new())
        }
        fn installer_name(&self) -> &'static str {
            "none"
        }
        fn installer_command(&self, installer: &Path, _: &RemovableDevice) -> Command {
            Command::new(installer)
        }
        fn locate_volume(&self, _: &RemovableDevice, _: &str) -> Result<Option<PathBuf>, WriteError> {
            Ok(None)
        }
        fn eject(&self, _: &RemovableDevice) -> Result<(), EjectError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls > self.failures {
                return Ok(());
            }
            if self.io_error {
                Err(EjectError::Io(io::Error::new(io::ErrorKind::NotFound, "udisksctl")))
            } else {
                Err(EjectError::ToolFailed {
                    tool: "udisksctl".to_string(),
                    code: Some(1),
                    stderr: "target is busy".to_string(),
                })
            }
        }
    }

    fn stick() -> RemovableDevice {
        RemovableDevice {
            id: "/dev/sdb".to_string(),
            label: "Stick".to_string(),
            capacity: 16 << 30,
            bus: BusType::Usb,
        }
    }

    #[test]
    fn busy_device_is_retried() {
        let platform = Flaky::new(2, false);
        EjectManager::new(&platform)
            .with_retries(3, Duration::ZERO)
            .eject(&stick())
            .unwrap();
        assert_eq!(platform.calls(), 3);
    }

    #[test]
    fn gives_up_after_last_attempt() {
        let platform = Flaky::new(5, false);
        let err = EjectManager::new(&platform)
            .with_retries(2, Duration::ZERO)
            .eject(&stick())
            .unwrap_err();
        assert!(matches!(err, EjectError::ToolFailed { .. }));
        assert_eq!(platform.calls(), 2);
    }

    #[test]
    fn io_errors_are_not_retried() {
        let platform = Flaky::new(1, true);
        let err = EjectManager::new(&platform)
            .with_retries(3, Duration::ZERO)
            .eject(&stick())
            .unwrap_err();
        assert!(matches!(err, EjectError::Io(_)));
        assert_eq!(platform.calls(), 1);
    }
}
