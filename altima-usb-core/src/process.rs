//! Runs external platform tools and captures a structured outcome.
use log::debug;
use std::borrow::Cow;
use std::io::{self, Write};
use std::process::{Command, Stdio};

/// The captured result of one external tool invocation.
#[derive(Clone, Debug)]
pub struct ToolOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }
}

/// Runs `cmd` to completion, optionally feeding `stdin`, and captures its output.
///
/// Spawn failures surface as `io::Error`; a non-zero exit is *not* an error here,
/// callers map [`ToolOutput::code`] onto their own error variants.
pub fn run(cmd: &mut Command, stdin: Option<&[u8]>) -> io::Result<ToolOutput> {
    debug!("running {cmd:?}");
    hide_console_window(cmd);

    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // The tool may exit before reading everything; that is not our failure.
        if let Err(e) = pipe.write_all(input) {
            if e.kind() != io::ErrorKind::BrokenPipe {
                return Err(e);
            }
        }
    }

    let output = child.wait_with_output()?;
    Ok(ToolOutput {
        code: output.status.code(),
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[cfg(windows)]
fn hide_console_window(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    cmd.creation_flags(windows_sys::Win32::System::Threading::CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console_window(_cmd: &mut Command) {}

/// The program name of a command, for error messages.
pub fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_exit_code_and_streams() {
        let out = run(
            Command::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]),
            None,
        )
        .unwrap();
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stdout_lossy().trim(), "out");
        assert_eq!(out.stderr, "err");
    }

    #[test]
    fn feeds_stdin() {
        let out = run(&mut Command::new("cat"), Some(b"y\ny\n")).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, b"y\ny\n");
    }

    #[test]
    fn missing_program_is_an_io_error() {
        let err = run(&mut Command::new("definitely-not-a-real-tool-4711"), None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
