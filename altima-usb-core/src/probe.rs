//! Removable device discovery.
//!
//! Wraps a [`Platform`]'s raw disk listing with the rules every front end
//! relies on: only USB or removable buses, only devices larger than the
//! configured floor, no duplicate identifiers, tool order preserved.
use crate::device::RemovableDevice;
use crate::error::ProbeError;
use crate::platform::Platform;
use log::{debug, info};
use std::collections::HashSet;

pub struct DeviceProbe<'a> {
    platform: &'a dyn Platform,
    min_capacity: u64,
}

impl<'a> DeviceProbe<'a> {
    pub fn new(platform: &'a dyn Platform, min_capacity: u64) -> Self {
        Self {
            platform,
            min_capacity,
        }
    }

    /// Scans for removable devices. An empty list is not an error.
    pub fn scan(&self) -> Result<Vec<RemovableDevice>, ProbeError> {
        let raw = self.platform.list_devices()?;
        let devices = filter_candidates(raw, self.min_capacity);
        info!(
            "{} scan found {} removable device(s)",
            self.platform.name(),
            devices.len()
        );
        Ok(devices)
    }
}

/// Keeps removable devices above `min_capacity`, dropping later duplicates of
/// an identifier already seen.
pub fn filter_candidates(raw: Vec<RemovableDevice>, min_capacity: u64) -> Vec<RemovableDevice> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter(|d| {
            if !d.bus.is_removable() {
                debug!("ignoring {} on {} bus", d.id, d.bus);
                return false;
            }
            if d.capacity <= min_capacity {
                debug!("ignoring {}: {} bytes is below the floor", d.id, d.capacity);
                return false;
            }
            seen.insert(d.id.clone())
        })
        .collect()
}
