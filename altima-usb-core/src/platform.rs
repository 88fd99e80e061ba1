//! Provides platform-specific functionality.
//!
//! Everything that shells out to an operating system tool lives behind the
//! [`Platform`] trait: enumerating disks, building the loader installer
//! command line, finding the loader's data volume and ejecting. One variant is
//! chosen at startup by [`native`]; business logic never branches on the OS.
//!
//! The output parsers are plain functions over text so they can be exercised
//! on any host.
use crate::device::RemovableDevice;
use crate::error::{EjectError, ProbeError, WriteError};
use crate::process::{self, ToolOutput};
use std::path::{Path, PathBuf};
use std::process::Command;

pub mod linux;
pub mod macos;
pub mod windows;

pub use self::linux::Linux;
pub use self::macos::MacOs;
pub use self::windows::Windows;

pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every disk the platform tool reports, in tool order, unfiltered.
    fn list_devices(&self) -> Result<Vec<RemovableDevice>, ProbeError>;

    /// File name of the loader installer inside the distribution archive.
    fn installer_name(&self) -> &'static str;

    /// The non-interactive, elevated installer invocation against `device`.
    fn installer_command(&self, installer: &Path, device: &RemovableDevice) -> Command;

    /// Answers fed to the installer's confirmation prompts.
    fn installer_input(&self) -> Option<&'static [u8]> {
        None
    }

    /// Mount point of the volume labelled `label` on `device`, if one exists.
    fn locate_volume(
        &self,
        device: &RemovableDevice,
        label: &str,
    ) -> Result<Option<PathBuf>, WriteError>;

    /// Unmounts every volume of `device` and powers it off where supported.
    fn eject(&self, device: &RemovableDevice) -> Result<(), EjectError>;
}

/// The platform this binary was built for.
pub fn native() -> Box<dyn Platform> {
    if cfg!(target_os = "windows") {
        Box::new(Windows)
    } else if cfg!(target_os = "macos") {
        Box::new(MacOs)
    } else {
        Box::new(Linux)
    }
}

/// Runs a probe command and maps spawn failures and non-zero exits.
pub(crate) fn run_probe(cmd: &mut Command) -> Result<ToolOutput, ProbeError> {
    let tool = process::program_name(cmd);
    let out = process::run(cmd, None)
        .map_err(|source| ProbeError::ToolUnavailable {
            tool: tool.clone(),
            source,
        })?;
    if !out.success() {
        return Err(ProbeError::ToolFailed {
            tool,
            code: out.code,
            stderr: out.stderr,
        });
    }
    if std::str::from_utf8(&out.stdout).is_err() {
        return Err(ProbeError::Malformed(format!("`{tool}` printed non-UTF-8 output")));
    }
    Ok(out)
}

/// Runs an eject step, treating any non-zero exit as failure.
pub(crate) fn run_eject_step(cmd: &mut Command) -> Result<ToolOutput, EjectError> {
    let tool = process::program_name(cmd);
    let out = process::run(cmd, None)?;
    if !out.success() {
        return Err(EjectError::ToolFailed {
            tool,
            code: out.code,
            stderr: out.stderr,
        });
    }
    Ok(out)
}

/// Parses a size as printed by disk tools: plain bytes (`16008609792`) or a
/// number with a binary unit suffix (`14.9G`, `15GB`, `512 MiB`).
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.replace(',', ".").parse().ok()?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        _ => return None,
    };
    Some((number * multiplier as f64).round() as u64)
}

/// Splits a `KEY="value" KEY2="value two"` line as printed by `lsblk -P`.
///
/// Returns `None` for lines that are not entirely made of such pairs.
pub fn parse_pairs(line: &str) -> Option<Vec<(&str, &str)>> {
    let mut pairs = Vec::new();
    let mut rest = line.trim();
    while !rest.is_empty() {
        let eq = rest.find("=\"")?;
        let key = rest[..eq].trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return None;
        }
        let after = &rest[eq + 2..];
        let close = after.find('"')?;
        pairs.push((key, &after[..close]));
        rest = after[close + 1..].trim_start();
    }
    if pairs.is_empty() { None } else { Some(pairs) }
}

pub(crate) fn field<'a>(pairs: &[(&'a str, &'a str)], key: &str) -> Option<&'a str> {
    pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// A PowerShell invocation that runs `script` without profile or banner.
pub(crate) fn powershell(script: &str) -> Command {
    let mut cmd = Command::new("powershell");
    cmd.args(["-NoLogo", "-NoProfile", "-NonInteractive", "-Command", script]);
    cmd
}

/// Quotes `value` as a single-quoted PowerShell literal.
pub(crate) fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(unix)]
pub(crate) fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
pub(crate) fn is_root() -> bool {
    false
}
