//! The core, UI-agnostic library for the `altima-usb` installer media tool.
//!
//! `altima-usb-core` turns a removable USB stick into Altima Linux boot media:
//! it finds candidate devices, installs a multiboot loader (Ventoy) on the
//! chosen one, downloads and verifies an image from the release catalog, copies
//! it onto the loader's data partition and ejects the device. Any front end,
//! command line or graphical, drives it through the same small API.
//!
//! The library is structured into several key modules:
//! - [`orchestrator`]: The entry point. Runs provisioning jobs as a state
//!   machine and is the only writer of job state.
//! - [`job`]: Job snapshots, phases, options and the events a job emits.
//! - [`backend`]: The `{scan, install, write, eject}` capability set, with a
//!   host implementation selected once at startup.
//! - [`platform`]: Linux, Windows and macOS policies for the external tools
//!   that list, prepare, mount and eject disks.
//! - [`catalog`], [`mod@download`], [`checksum`]: Image acquisition.
//! - [`install`], [`mod@write`], [`eject`]: The device-facing steps.
//!
//! Long-running work reports progress through callbacks and stops at the next
//! chunk boundary when its [`cancel::CancelToken`] is triggered.
//!
//! ## Example: Provisioning with Progress Reporting
//!
//! ```rust,no_run
//! use altima_usb_core::config::Config;
//! use altima_usb_core::job::{JobEvent, JobEventKind, Phase};
//! use altima_usb_core::orchestrator::Orchestrator;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Orchestrator::native(Config::default())?;
//!
//!     // A real app might use this to update a progress bar widget.
//!     orchestrator.set_observer(Arc::new(|event: &JobEvent| {
//!         if let JobEventKind::Progress { phase: Phase::Downloading, done, total } = &event.kind {
//!             println!("{done} of {total:?} bytes downloaded");
//!         }
//!     }));
//!
//!     let devices = orchestrator.rescan_devices()?;
//!     let device = devices.first().ok_or("no removable devices found")?;
//!     let images = orchestrator.images()?;
//!
//!     let id = orchestrator.start_provisioning(&device.id, images[0].id())?;
//!     if let Some(job) = orchestrator.wait(id) {
//!         println!("{}: {}", job.id, job.state);
//!     }
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod backend;
pub mod cancel;
pub mod catalog;
pub mod checksum;
pub mod config;
pub mod device;
pub mod download;
pub mod eject;
pub mod error;
pub mod http;
pub mod install;
pub mod job;
pub mod orchestrator;
pub mod platform;
pub mod probe;
mod process;
pub mod write;
