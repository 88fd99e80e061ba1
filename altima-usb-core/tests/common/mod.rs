#![allow(dead_code)]

use altima_usb_core::archive;
use altima_usb_core::backend::MediaBackend;
use altima_usb_core::cancel::CancelToken;
use altima_usb_core::config::Config;
use altima_usb_core::device::{BusType, RemovableDevice};
use altima_usb_core::error::{DownloadError, EjectError, InstallError, ProbeError, WriteError};
use altima_usb_core::http::{Fetch, HttpBody};
use altima_usb_core::job::{JobEvent, JobEventKind, JobId, JobState, Phase};
use altima_usb_core::orchestrator::Orchestrator;
use altima_usb_core::write::copy_to_volume;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const CATALOG_URL: &str = "https://example.test/altima-iso-list.json";
pub const IMAGE_URL: &str = "https://example.test/altima-minimal-1.0.iso";
pub const IMAGE_FILE: &str = "altima-minimal-1.0.iso";
pub const DEVICE_ID: &str = "/dev/sdb";
pub const GIB: u64 = 1024 * 1024 * 1024;

pub fn image_bytes() -> Vec<u8> {
    (0..200u8).cycle().take(1000).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn stick(capacity: u64) -> RemovableDevice {
    RemovableDevice {
        id: DEVICE_ID.to_string(),
        label: "SanDisk Cruzer".to_string(),
        capacity,
        bus: BusType::Usb,
    }
}

/// A loader distribution with its installer nested the way releases ship it.
pub fn loader_zip() -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file("loader/Installer.bin", zip::write::FileOptions::default())
        .unwrap();
    zip.write_all(b"#!/bin/sh\n").unwrap();
    zip.finish().unwrap().into_inner()
}

/// Serves fixed bodies by URL. Unknown URLs answer 404.
#[derive(Default)]
pub struct MemoryFetch {
    resources: Mutex<HashMap<String, (Vec<u8>, Option<u64>)>>,
    pub opened: Mutex<Vec<String>>,
}

impl MemoryFetch {
    pub fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
        let body = body.into();
        let len = body.len() as u64;
        self.resources
            .lock()
            .unwrap()
            .insert(url.to_string(), (body, Some(len)));
    }

    /// Serves `body` while declaring `declared` bytes.
    pub fn serve_declaring(&self, url: &str, body: impl Into<Vec<u8>>, declared: u64) {
        self.resources
            .lock()
            .unwrap()
            .insert(url.to_string(), (body.into(), Some(declared)));
    }

    pub fn catalog(&self, entries: serde_json::Value) {
        self.serve(CATALOG_URL, serde_json::json!({ "isos": entries }).to_string());
    }

    fn lookup(&self, url: &str) -> Result<(Vec<u8>, Option<u64>), DownloadError> {
        self.resources
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| DownloadError::HttpStatus {
                url: url.to_string(),
                status: 404,
            })
    }
}

impl Fetch for MemoryFetch {
    fn open(&self, url: &str) -> Result<HttpBody, DownloadError> {
        let (body, declared) = self.lookup(url)?;
        self.opened.lock().unwrap().push(url.to_string());
        Ok(HttpBody {
            content_length: declared,
            reader: Box::new(Cursor::new(body)),
        })
    }

    fn get_text(&self, url: &str, _timeout: Duration) -> Result<String, DownloadError> {
        let (body, _) = self.lookup(url)?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Stands in for the host: devices come from a list, the "loader volume" is
/// a temporary directory.
pub struct FakeBackend {
    pub devices: Mutex<Vec<RemovableDevice>>,
    pub volume: tempfile::TempDir,
    /// When set, `install` blocks until a message arrives or the sender is dropped.
    pub install_gate: Mutex<Option<Receiver<()>>>,
    pub install_error: Mutex<Option<InstallError>>,
    pub volume_missing: AtomicBool,
    pub eject_fails: AtomicBool,
    pub installers_run: Mutex<Vec<PathBuf>>,
    pub ejects: AtomicUsize,
}

impl FakeBackend {
    pub fn new(devices: Vec<RemovableDevice>) -> Self {
        Self {
            devices: Mutex::new(devices),
            volume: tempfile::tempdir().unwrap(),
            install_gate: Mutex::new(None),
            install_error: Mutex::new(None),
            volume_missing: AtomicBool::new(false),
            eject_fails: AtomicBool::new(false),
            installers_run: Mutex::new(Vec::new()),
            ejects: AtomicUsize::new(0),
        }
    }

    pub fn volume_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.volume.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

impl MediaBackend for FakeBackend {
    fn scan(&self) -> Result<Vec<RemovableDevice>, ProbeError> {
        Ok(self.devices.lock().unwrap().clone())
    }

    fn install(&self, _device: &RemovableDevice, loader_archive: &Path) -> Result<(), InstallError> {
        if let Some(gate) = self.install_gate.lock().unwrap().as_ref() {
            gate.recv().ok();
        }
        if let Some(err) = self.install_error.lock().unwrap().take() {
            return Err(err);
        }
        let scratch = tempfile::tempdir()?;
        archive::extract(loader_archive, scratch.path())?;
        let installer = archive::find_installer(scratch.path(), "installer.bin")?;
        let relative = installer.strip_prefix(scratch.path()).unwrap().to_path_buf();
        self.installers_run.lock().unwrap().push(relative);
        Ok(())
    }

    fn write(
        &self,
        source: &Path,
        device: &RemovableDevice,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<PathBuf, WriteError> {
        if self.volume_missing.load(Ordering::SeqCst) {
            return Err(WriteError::TargetNotFound {
                device: device.id.clone(),
                label: "Ventoy".to_string(),
            });
        }
        copy_to_volume(source, self.volume.path(), Some(64 * GIB), 256, cancel, |done, total| {
            on_progress(done, total)
        })
    }

    fn eject(&self, _device: &RemovableDevice) -> Result<(), EjectError> {
        self.ejects.fetch_add(1, Ordering::SeqCst);
        if self.eject_fails.load(Ordering::SeqCst) {
            return Err(EjectError::ToolFailed {
                tool: "udisksctl".to_string(),
                code: Some(1),
                stderr: "target is busy".to_string(),
            });
        }
        Ok(())
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub backend: Arc<FakeBackend>,
    pub fetch: Arc<MemoryFetch>,
    pub events: Arc<Mutex<Vec<JobEvent>>>,
    pub downloads: tempfile::TempDir,
    loader_dir: tempfile::TempDir,
}

impl Harness {
    /// One 16 GiB stick, a catalog with one checksummed image, and a local
    /// loader archive.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let downloads = tempfile::tempdir().unwrap();
        let loader_dir = tempfile::tempdir().unwrap();
        let loader = loader_dir.path().join("ventoy.zip");
        std::fs::write(&loader, loader_zip()).unwrap();

        let mut config = Config {
            catalog_url: CATALOG_URL.to_string(),
            loader_archive: Some(loader),
            download_dir: downloads.path().to_path_buf(),
            chunk_size: 64,
            fallback_images: Vec::new(),
            ..Config::default()
        };
        tweak(&mut config);

        let fetch = Arc::new(MemoryFetch::default());
        let image = image_bytes();
        fetch.catalog(serde_json::json!([{
            "name": "Altima Minimal",
            "file": IMAGE_FILE,
            "sha256": sha256_hex(&image),
        }]));
        fetch.serve(IMAGE_URL, image);

        let backend = Arc::new(FakeBackend::new(vec![stick(16 * GIB)]));
        let orchestrator = Arc::new(Orchestrator::new(config, backend.clone(), fetch.clone()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        orchestrator.set_observer(Arc::new(move |event: &JobEvent| {
            sink.lock().unwrap().push(event.clone());
        }));

        Self {
            orchestrator,
            backend,
            fetch,
            events,
            downloads,
            loader_dir,
        }
    }

    /// Scans, then starts a job for the stick with the default options.
    pub fn start(&self) -> JobId {
        self.orchestrator.rescan_devices().unwrap();
        self.orchestrator
            .start_provisioning(DEVICE_ID, IMAGE_FILE)
            .unwrap()
    }

    /// The state transitions `id` went through, as display strings.
    pub fn states(&self, id: JobId) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.job == id)
            .filter_map(|e| match &e.kind {
                JobEventKind::State(state) => Some(state_name(state)),
                JobEventKind::Progress { .. } => None,
            })
            .collect()
    }

    pub fn progress_events(&self, id: JobId, phase: Phase) -> Vec<(u64, Option<u64>)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.job == id)
            .filter_map(|e| match e.kind {
                JobEventKind::Progress {
                    phase: p,
                    done,
                    total,
                } if p == phase => Some((done, total)),
                _ => None,
            })
            .collect()
    }

    pub fn download_dir_entries(&self) -> Vec<String> {
        std::fs::read_dir(self.downloads.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    /// Polls until `id` is running `phase`.
    pub fn wait_for_phase(&self, id: JobId, phase: Phase) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let job = self.orchestrator.job_state(id).unwrap();
            if matches!(job.state, JobState::Running(p) if p == phase) {
                return;
            }
            assert!(!job.is_terminal(), "job ended before {phase}: {}", job.state);
            assert!(Instant::now() < deadline, "timed out waiting for {phase}");
            thread::sleep(Duration::from_millis(5));
        }
    }
}

pub fn state_name(state: &JobState) -> String {
    match state {
        JobState::Running(phase) => format!("{phase:?}"),
        JobState::Complete => "Complete".to_string(),
        JobState::Failed { phase, .. } => format!("Failed({phase:?})"),
    }
}
