//! Provisioning job records: phases, terminal states and the events a job
//! emits while it runs.
use crate::catalog::ImageDescriptor;
use crate::device::RemovableDevice;
use crate::error::JobError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// The non-terminal steps of a job, in the only order they can occur.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Phase {
    Idle,
    Scanning,
    DeviceSelected,
    InstallingLoader,
    LoaderReady,
    Downloading,
    Verifying,
    Writing,
    Ejecting,
}

impl Phase {
    /// Whether work in this phase can erase or alter data on the device.
    pub fn is_destructive(self) -> bool {
        matches!(self, Phase::InstallingLoader | Phase::Writing)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Scanning => "scanning",
            Phase::DeviceSelected => "device selected",
            Phase::InstallingLoader => "installing loader",
            Phase::LoaderReady => "loader ready",
            Phase::Downloading => "downloading",
            Phase::Verifying => "verifying",
            Phase::Writing => "writing",
            Phase::Ejecting => "ejecting",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub enum JobState {
    Running(Phase),
    Complete,
    /// `phase` is the phase that was active when the job stopped.
    Failed { phase: Phase, error: Arc<JobError> },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Running(_))
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Running(phase) => write!(f, "{phase}"),
            JobState::Complete => f.write_str("complete"),
            JobState::Failed { phase, error } => write!(f, "failed while {phase}: {error}"),
        }
    }
}

/// What to do when the catalog claims a checksum that cannot be obtained.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChecksumPolicy {
    /// Fail the job with `ChecksumUnavailable`.
    #[default]
    Require,
    /// Write the image anyway and record the checksum as unavailable.
    AllowUnavailable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobOptions {
    pub checksum_policy: ChecksumPolicy,
    /// Eject the device once the image is written.
    pub eject: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            checksum_policy: ChecksumPolicy::Require,
            eject: true,
        }
    }
}

/// How the downloaded image was checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ChecksumStatus {
    /// Verification has not run yet.
    Pending,
    /// The catalog makes no checksum claim for this image.
    NotClaimed,
    Verified,
    /// A checksum was claimed but could not be obtained; the caller allowed it.
    Unavailable,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum EjectStatus {
    Pending,
    Ejected,
    /// The caller asked not to eject.
    Skipped,
    /// The image is on the device, but it must be removed by hand.
    Failed(String),
}

/// A snapshot of one provisioning job.
#[derive(Clone, Debug)]
pub struct ProvisioningJob {
    pub id: JobId,
    pub device: RemovableDevice,
    pub image: ImageDescriptor,
    pub state: JobState,
    /// Completion of each phase that has reported progress, in `[0, 1]`.
    pub progress: BTreeMap<Phase, f64>,
    pub checksum: ChecksumStatus,
    pub eject: EjectStatus,
    /// Where the image was written on the device.
    pub written_to: Option<PathBuf>,
    /// The job failed after the device was already being modified. The device
    /// may be inconsistent and must be rescanned and confirmed again.
    pub needs_rescan: bool,
}

impl ProvisioningJob {
    pub(crate) fn new(id: JobId, device: RemovableDevice, image: ImageDescriptor) -> Self {
        Self {
            id,
            device,
            image,
            state: JobState::Running(Phase::Idle),
            progress: BTreeMap::new(),
            checksum: ChecksumStatus::Pending,
            eject: EjectStatus::Pending,
            written_to: None,
            needs_rescan: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn phase(&self) -> Option<Phase> {
        match &self.state {
            JobState::Running(phase) => Some(*phase),
            JobState::Failed { phase, .. } => Some(*phase),
            JobState::Complete => None,
        }
    }

    pub fn last_error(&self) -> Option<&JobError> {
        match &self.state {
            JobState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn progress_of(&self, phase: Phase) -> f64 {
        self.progress.get(&phase).copied().unwrap_or(0.0)
    }
}

#[derive(Clone, Debug)]
pub enum JobEventKind {
    State(JobState),
    /// `total` is `None` while the amount of work is unknown.
    Progress {
        phase: Phase,
        done: u64,
        total: Option<u64>,
    },
}

#[derive(Clone, Debug)]
pub struct JobEvent {
    pub job: JobId,
    pub kind: JobEventKind,
}

/// Receives every event of every job, in order per job, on the job's worker.
pub type Observer = Arc<dyn Fn(&JobEvent) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_order_like_the_pipeline() {
        let mut phases = vec![Phase::Writing, Phase::Idle, Phase::Verifying, Phase::Scanning];
        phases.sort();
        assert_eq!(
            phases,
            [Phase::Idle, Phase::Scanning, Phase::Verifying, Phase::Writing]
        );
    }

    #[test]
    fn only_install_and_write_are_destructive() {
        let destructive: Vec<Phase> = [
            Phase::Idle,
            Phase::Scanning,
            Phase::DeviceSelected,
            Phase::InstallingLoader,
            Phase::LoaderReady,
            Phase::Downloading,
            Phase::Verifying,
            Phase::Writing,
            Phase::Ejecting,
        ]
        .into_iter()
        .filter(|p| p.is_destructive())
        .collect();
        assert_eq!(destructive, [Phase::InstallingLoader, Phase::Writing]);
    }

    #[test]
    fn failed_state_reports_phase_and_error() {
        let state = JobState::Failed {
            phase: Phase::Downloading,
            error: Arc::new(JobError::Cancelled),
        };
        assert!(state.is_terminal());
        assert_eq!(state.to_string(), "failed while downloading: operation cancelled");
        assert!(!JobState::Running(Phase::Writing).is_terminal());
    }
}
