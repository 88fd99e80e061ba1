//! Drives provisioning jobs through their phases.
//!
//! The [`Orchestrator`] is the only writer of job state. Each job runs its
//! phases one after another on a dedicated worker thread; callers observe it
//! through [`Orchestrator::job_state`] snapshots or an event observer, and
//! stop it with [`Orchestrator::cancel`].
//!
//! ```rust,no_run
//! use altima_usb_core::{config::Config, orchestrator::Orchestrator};
//!
//! let orchestrator = Orchestrator::native(Config::default())?;
//! let devices = orchestrator.rescan_devices()?;
//! let images = orchestrator.images()?;
//! let id = orchestrator.start_provisioning(&devices[0].id, images[0].id())?;
//! let job = orchestrator.wait(id);
//! println!("{:?}", job.map(|j| j.state));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
use crate::backend::{HostBackend, MediaBackend};
use crate::cancel::CancelToken;
use crate::catalog::{CatalogSource, ImageCatalog, ImageDescriptor, sanitize_file_name};
use crate::checksum::{ChecksumVerifier, ExpectedDigest};
use crate::config::Config;
use crate::device::RemovableDevice;
use crate::download::StreamingDownloader;
use crate::error::{CatalogError, DownloadError, JobError};
use crate::http::{Fetch, HttpClient};
use crate::job::{
    ChecksumPolicy, ChecksumStatus, EjectStatus, JobEvent, JobEventKind, JobId, JobOptions, JobState,
    Observer, Phase, ProvisioningJob,
};
use log::{debug, info, warn};
use reqwest::Url;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;
use tempfile::TempDir;

/// Locks `m`, recovering the data if a previous holder panicked.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Scan {
    at: Instant,
    devices: Vec<RemovableDevice>,
}

/// A job's snapshot plus the condition variable waiters block on.
struct JobRecord {
    job: Mutex<ProvisioningJob>,
    changed: Condvar,
}

struct JobSlot {
    record: Arc<JobRecord>,
    cancel: CancelToken,
}

struct Shared {
    config: Config,
    backend: Arc<dyn MediaBackend>,
    fetch: Arc<dyn Fetch>,
    observer: Mutex<Option<Observer>>,
    last_scan: Mutex<Option<Scan>>,
    images: Mutex<Option<Vec<ImageDescriptor>>>,
    jobs: Mutex<HashMap<JobId, JobSlot>>,
    busy: Mutex<HashSet<String>>,
    next_id: AtomicU64,
}

impl Shared {
    fn catalog(&self) -> ImageCatalog<'_> {
        ImageCatalog::new(
            self.fetch.as_ref(),
            &self.config.catalog_url,
            self.config.catalog_timeout(),
            self.config.fallback_images.clone(),
        )
    }
}

/// Marks a device as taken by a job until dropped.
struct DeviceLease {
    shared: Arc<Shared>,
    device_id: String,
}

impl DeviceLease {
    fn acquire(shared: &Arc<Shared>, device_id: &str) -> Result<Self, JobError> {
        if !lock(&shared.busy).insert(device_id.to_string()) {
            return Err(JobError::DeviceBusy(device_id.to_string()));
        }
        Ok(Self {
            shared: Arc::clone(shared),
            device_id: device_id.to_string(),
        })
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        lock(&self.shared.busy).remove(&self.device_id);
    }
}

pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(config: Config, backend: Arc<dyn MediaBackend>, fetch: Arc<dyn Fetch>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                backend,
                fetch,
                observer: Mutex::new(None),
                last_scan: Mutex::new(None),
                images: Mutex::new(None),
                jobs: Mutex::new(HashMap::new()),
                busy: Mutex::new(HashSet::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// An orchestrator using this host's platform tools and a real HTTP client.
    pub fn native(config: Config) -> Result<Self, DownloadError> {
        let fetch = Arc::new(HttpClient::new(&config)?);
        let backend = Arc::new(HostBackend::native(&config));
        Ok(Self::new(config, backend, fetch))
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Registers the observer for jobs started from now on.
    pub fn set_observer(&self, observer: Observer) {
        *lock(&self.shared.observer) = Some(observer);
    }

    /// Scans for devices and remembers the result as the list selections are
    /// confirmed against.
    pub fn rescan_devices(&self) -> Result<Vec<RemovableDevice>, JobError> {
        let devices = self.shared.backend.scan()?;
        *lock(&self.shared.last_scan) = Some(Scan {
            at: Instant::now(),
            devices: devices.clone(),
        });
        Ok(devices)
    }

    /// The resolved image catalog.
    ///
    /// A remote manifest is fetched once and then served from memory. The
    /// fallback list is never cached, so the next call retries the manifest.
    pub fn images(&self) -> Result<Vec<ImageDescriptor>, CatalogError> {
        if let Some(images) = lock(&self.shared.images).as_ref() {
            return Ok(images.clone());
        }
        let (images, source) = self.shared.catalog().resolve_with_source()?;
        if source == CatalogSource::Remote {
            *lock(&self.shared.images) = Some(images.clone());
        }
        Ok(images)
    }

    pub fn start_provisioning(&self, device_id: &str, image_id: &str) -> Result<JobId, JobError> {
        self.start_provisioning_with(device_id, image_id, JobOptions::default())
    }

    /// Starts a job for a device from the most recent scan.
    ///
    /// The device must have been listed by [`rescan_devices`](Self::rescan_devices)
    /// within the selection window, and must not already have an active job.
    pub fn start_provisioning_with(
        &self,
        device_id: &str,
        image_id: &str,
        options: JobOptions,
    ) -> Result<JobId, JobError> {
        let device = {
            let scan = lock(&self.shared.last_scan);
            let scan = scan
                .as_ref()
                .ok_or_else(|| JobError::DeviceNotFound(device_id.to_string()))?;
            let device = scan
                .devices
                .iter()
                .find(|d| d.id == device_id)
                .ok_or_else(|| JobError::DeviceNotFound(device_id.to_string()))?;
            if scan.at.elapsed() >= self.shared.config.selection_ttl() {
                return Err(JobError::SelectionExpired(device_id.to_string()));
            }
            device.clone()
        };

        let image = self
            .images()?
            .into_iter()
            .find(|i| i.id() == image_id)
            .ok_or_else(|| JobError::ImageNotFound(image_id.to_string()))?;

        let lease = DeviceLease::acquire(&self.shared, &device.id)?;
        let id = JobId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let record = Arc::new(JobRecord {
            job: Mutex::new(ProvisioningJob::new(id, device.clone(), image.clone())),
            changed: Condvar::new(),
        });
        let cancel = CancelToken::new();
        lock(&self.shared.jobs).insert(
            id,
            JobSlot {
                record: Arc::clone(&record),
                cancel: cancel.clone(),
            },
        );
        info!("{id}: provisioning {} with {}", device.id, image.file);

        let worker = Worker {
            id,
            shared: Arc::clone(&self.shared),
            observer: lock(&self.shared.observer).clone(),
            record,
            cancel,
            options,
            device,
            image,
            phase: Phase::Idle,
            touched_device: false,
            staging: None,
        };
        thread::spawn(move || worker.run(lease));
        Ok(id)
    }

    pub fn job_state(&self, id: JobId) -> Option<ProvisioningJob> {
        let record = self.record(id)?;
        let job = lock(&record.job).clone();
        Some(job)
    }

    /// Requests cancellation. Returns `false` if the job is unknown or
    /// already finished.
    pub fn cancel(&self, id: JobId) -> bool {
        let jobs = lock(&self.shared.jobs);
        let Some(slot) = jobs.get(&id) else {
            return false;
        };
        if lock(&slot.record.job).is_terminal() {
            return false;
        }
        info!("{id}: cancellation requested");
        slot.cancel.cancel();
        true
    }

    /// Blocks until the job is `Complete` or `Failed` and returns its final snapshot.
    pub fn wait(&self, id: JobId) -> Option<ProvisioningJob> {
        let record = self.record(id)?;
        let mut job = lock(&record.job);
        while !job.is_terminal() {
            job = record
                .changed
                .wait(job)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Some(job.clone())
    }

    fn record(&self, id: JobId) -> Option<Arc<JobRecord>> {
        lock(&self.shared.jobs)
            .get(&id)
            .map(|slot| Arc::clone(&slot.record))
    }
}

/// What the catalog says the image should hash to.
enum Claim {
    NotClaimed,
    Digest(ExpectedDigest),
    Unavailable,
}

struct Worker {
    id: JobId,
    shared: Arc<Shared>,
    observer: Option<Observer>,
    record: Arc<JobRecord>,
    cancel: CancelToken,
    options: JobOptions,
    device: RemovableDevice,
    image: ImageDescriptor,
    phase: Phase,
    /// Set once a destructive phase has been started on the device.
    touched_device: bool,
    staging: Option<TempDir>,
}

impl Worker {
    fn run(mut self, lease: DeviceLease) {
        self.emit(JobEventKind::State(JobState::Running(Phase::Idle)));
        self.finish_phase();
        let result = self.drive();

        let state = match result {
            Ok(written) => {
                if self.shared.config.keep_downloads {
                    self.keep_download(&written);
                }
                info!("{}: complete", self.id);
                JobState::Complete
            }
            Err(error) => {
                warn!("{}: failed while {}: {error}", self.id, self.phase);
                JobState::Failed {
                    phase: self.phase,
                    error: Arc::new(error),
                }
            }
        };

        if let Some(staging) = self.staging.take() {
            if let Err(e) = staging.close() {
                warn!("{}: could not remove staging directory: {e}", self.id);
            }
        }
        // Free the device before publishing the outcome, so a caller reacting
        // to it can start a new job right away.
        drop(lease);

        let failed = matches!(state, JobState::Failed { .. });
        let touched = self.touched_device;
        self.update(|job| {
            job.state = state.clone();
            job.needs_rescan = failed && touched;
        });
        self.emit(JobEventKind::State(state));
    }

    /// Runs every phase in order and returns the path of the downloaded image.
    fn drive(&mut self) -> Result<PathBuf, JobError> {
        let backend = Arc::clone(&self.shared.backend);

        self.enter(Phase::Scanning)?;
        let devices = backend.scan()?;
        let current = devices
            .into_iter()
            .find(|d| d.id == self.device.id)
            .ok_or_else(|| JobError::DeviceNotFound(self.device.id.clone()))?;
        if !current.same_media(&self.device) {
            return Err(JobError::DeviceChanged(self.device.id.clone()));
        }
        self.finish_phase();

        self.enter(Phase::DeviceSelected)?;
        self.finish_phase();

        self.enter(Phase::InstallingLoader)?;
        let loader = self.loader_archive()?;
        self.touched_device = true;
        backend.install(&self.device, &loader)?;
        // The installer is never interrupted; a late cancel is honoured here.
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        self.finish_phase();

        self.enter(Phase::LoaderReady)?;
        // The partition layout changed; only a fresh probe describes it.
        let refreshed = backend
            .scan()?
            .into_iter()
            .find(|d| d.id == self.device.id)
            .ok_or_else(|| JobError::DeviceNotFound(self.device.id.clone()))?;
        self.device = refreshed.clone();
        self.update(|job| job.device = refreshed);
        self.finish_phase();

        self.enter(Phase::Downloading)?;
        let claim = self.checksum_claim()?;
        let dest = self.staging_dir()?.join(&self.image.file);
        let url = self.image.url.clone();
        let downloaded = StreamingDownloader::new(self.shared.fetch.as_ref(), self.shared.config.chunk_size)
            .download(&url, &dest, &self.cancel, |done, total| {
                self.progress(Phase::Downloading, done, total)
            })?;
        self.finish_phase();

        self.enter(Phase::Verifying)?;
        let status = match claim {
            Claim::NotClaimed => ChecksumStatus::NotClaimed,
            Claim::Unavailable => ChecksumStatus::Unavailable,
            Claim::Digest(expected) => {
                self.verify(&downloaded.path, downloaded.bytes, &expected)?;
                ChecksumStatus::Verified
            }
        };
        self.update(|job| job.checksum = status);
        self.finish_phase();

        self.enter(Phase::Writing)?;
        let written = backend.write(&downloaded.path, &self.device, &self.cancel, &mut |done, total| {
            self.progress(Phase::Writing, done, Some(total))
        })?;
        info!("{}: image written to {}", self.id, written.display());
        self.update(|job| job.written_to = Some(written));
        self.finish_phase();

        // The image is on the device; ejecting is safe even after a cancel.
        self.set_phase(Phase::Ejecting);
        let eject = if self.options.eject {
            match backend.eject(&self.device) {
                Ok(()) => EjectStatus::Ejected,
                Err(e) => EjectStatus::Failed(e.to_string()),
            }
        } else {
            EjectStatus::Skipped
        };
        self.update(|job| job.eject = eject);
        self.finish_phase();

        Ok(downloaded.path)
    }

    /// Moves to `phase` unless the job was cancelled in the meantime.
    fn enter(&mut self, phase: Phase) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        self.set_phase(phase);
        Ok(())
    }

    fn set_phase(&mut self, phase: Phase) {
        debug!("{}: {} -> {phase}", self.id, self.phase);
        self.phase = phase;
        self.update(|job| job.state = JobState::Running(phase));
        self.emit(JobEventKind::State(JobState::Running(phase)));
    }

    fn finish_phase(&self) {
        let phase = self.phase;
        self.update(|job| {
            job.progress.insert(phase, 1.0);
        });
    }

    fn progress(&self, phase: Phase, done: u64, total: Option<u64>) {
        if let Some(total) = total.filter(|t| *t > 0) {
            let fraction = (done as f64 / total as f64).min(1.0);
            self.update(|job| {
                job.progress.insert(phase, fraction);
            });
        }
        self.emit(JobEventKind::Progress { phase, done, total });
    }

    fn update(&self, f: impl FnOnce(&mut ProvisioningJob)) {
        f(&mut lock(&self.record.job));
        self.record.changed.notify_all();
    }

    fn emit(&self, kind: JobEventKind) {
        if let Some(observer) = &self.observer {
            observer(&JobEvent { job: self.id, kind });
        }
    }

    fn staging_dir(&mut self) -> Result<PathBuf, JobError> {
        if let Some(dir) = &self.staging {
            return Ok(dir.path().to_path_buf());
        }
        let root = &self.shared.config.download_dir;
        fs::create_dir_all(root).map_err(DownloadError::Io)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!(".altima-{}-", self.id))
            .tempdir_in(root)
            .map_err(DownloadError::Io)?;
        let path = dir.path().to_path_buf();
        self.staging = Some(dir);
        Ok(path)
    }

    /// The configured local loader archive, or a freshly downloaded one.
    fn loader_archive(&mut self) -> Result<PathBuf, JobError> {
        if let Some(path) = &self.shared.config.loader_archive {
            return Ok(path.clone());
        }
        let url = self.shared.config.loader_url.clone();
        let name = Url::parse(&url)
            .ok()
            .and_then(|u| u.path_segments()?.next_back().map(str::to_string))
            .and_then(|n| sanitize_file_name(&n))
            .unwrap_or_else(|| "loader.zip".to_string());
        let dest = self.staging_dir()?.join(name);
        let loader = StreamingDownloader::new(self.shared.fetch.as_ref(), self.shared.config.chunk_size)
            .download(&url, &dest, &self.cancel, |done, total| {
                self.progress(Phase::InstallingLoader, done, total)
            })?;
        Ok(loader.path)
    }

    fn checksum_claim(&self) -> Result<Claim, JobError> {
        match self.shared.catalog().resolve_checksum(&self.image) {
            Ok(Some(digest)) => Ok(Claim::Digest(digest)),
            Ok(None) => Ok(Claim::NotClaimed),
            Err(e @ JobError::ChecksumUnavailable { .. })
                if self.options.checksum_policy == ChecksumPolicy::AllowUnavailable =>
            {
                warn!("{}: continuing without checksum: {e}", self.id);
                Ok(Claim::Unavailable)
            }
            Err(e) => Err(e),
        }
    }

    fn verify(&self, path: &Path, len: u64, expected: &ExpectedDigest) -> Result<(), JobError> {
        let actual = ChecksumVerifier::new(self.shared.config.chunk_size).digest_file(
            path,
            expected.algorithm,
            &self.cancel,
            |done| self.progress(Phase::Verifying, done, Some(len)),
        );
        let actual = match actual {
            Ok(actual) => actual,
            Err(e) => {
                fs::remove_file(path).ok();
                return Err(e.into());
            }
        };
        if actual != expected.hex {
            fs::remove_file(path).ok();
            return Err(JobError::ChecksumMismatch {
                expected: expected.hex.clone(),
                actual,
            });
        }
        debug!("{}: {} checksum matches", self.id, expected.algorithm);
        Ok(())
    }

    fn keep_download(&self, image: &Path) {
        let target = self.shared.config.download_dir.join(&self.image.file);
        match fs::rename(image, &target) {
            Ok(()) => info!("{}: kept download at {}", self.id, target.display()),
            Err(e) => warn!("{}: could not keep {}: {e}", self.id, image.display()),
        }
    }
}
