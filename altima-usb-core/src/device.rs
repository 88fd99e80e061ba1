use serde::Serialize;
use std::fmt;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// The bus a block device is attached through, as reported by the platform tool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum BusType {
    Usb,
    /// Not USB, but flagged removable by the kernel (SD card readers and the like).
    Removable,
    Other(String),
}

impl BusType {
    /// Whether a device on this bus may be offered as a provisioning target.
    pub fn is_removable(&self) -> bool {
        matches!(self, BusType::Usb | BusType::Removable)
    }
}

impl fmt::Display for BusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusType::Usb => f.write_str("usb"),
            BusType::Removable => f.write_str("removable"),
            BusType::Other(s) => f.write_str(s),
        }
    }
}

/// Represents a removable block device discovered on the system.
///
/// Records are produced by a scan and never mutated afterwards. Installing the
/// loader changes the partition layout of the physical device, so the only way
/// to observe the new state is another scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RemovableDevice {
    /// Platform-native identifier: `/dev/sdb`, `/dev/disk4` or a Windows disk number.
    pub id: String,
    /// Human readable label, usually vendor and model.
    pub label: String,
    /// Total capacity in bytes.
    pub capacity: u64,
    pub bus: BusType,
}

impl RemovableDevice {
    pub fn size_gb(&self) -> f64 {
        self.capacity as f64 / GIB
    }

    /// Two records describe the same physical stick when identifier, capacity
    /// and label all agree.
    pub fn same_media(&self, other: &RemovableDevice) -> bool {
        self.id == other.id && self.capacity == other.capacity && self.label == other.label
    }
}

impl fmt::Display for RemovableDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<15} {:>6.1} GB  {} [{}]",
            self.id,
            self.size_gb(),
            self.label,
            self.bus
        )
    }
}
