//! Streaming downloads with progress, cancellation and length checking.
use crate::cancel::CancelToken;
use crate::error::DownloadError;
use crate::http::Fetch;
use log::{debug, info};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Bookkeeping for one transfer. Lives only as long as the transfer does.
pub struct DownloadSession {
    pub url: String,
    pub dest: PathBuf,
    /// Declared length; `None` when the server did not say.
    pub total: Option<u64>,
    pub transferred: u64,
}

impl DownloadSession {
    fn new(url: &str, dest: &Path, total: Option<u64>) -> Self {
        Self {
            url: url.to_string(),
            dest: dest.to_path_buf(),
            total,
            transferred: 0,
        }
    }

    fn record(&mut self, chunk: &[u8]) {
        self.transferred += chunk.len() as u64;
    }
}

/// A completed download.
#[derive(Clone, Debug)]
pub struct Downloaded {
    pub path: PathBuf,
    pub bytes: u64,
}

pub struct StreamingDownloader<'a> {
    fetch: &'a dyn Fetch,
    chunk_size: usize,
}

impl<'a> StreamingDownloader<'a> {
    pub fn new(fetch: &'a dyn Fetch, chunk_size: usize) -> Self {
        Self {
            fetch,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Downloads `url` to `dest`.
    ///
    /// Data is streamed into a hidden `.part` file next to `dest` and only
    /// renamed into place once the byte count matches the declared length, so
    /// a failed or cancelled transfer never leaves anything at `dest`. An
    /// existing `dest` from an earlier attempt is removed first.
    ///
    /// `on_progress` receives `(bytes_so_far, declared_total)` after every
    /// non-empty chunk.
    pub fn download<F>(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> Result<Downloaded, DownloadError>
    where
        F: FnMut(u64, Option<u64>),
    {
        let dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        match fs::remove_file(dest) {
            Ok(()) => debug!("removed stale {}", dest.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!("downloading {url}");
        let body = self.fetch.open(url)?;
        let mut session = DownloadSession::new(url, dest, body.content_length);
        let mut reader = body.reader;

        let mut part = tempfile::Builder::new()
            .prefix(".altima-")
            .suffix(".part")
            .tempfile_in(dir)?;
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DownloadError::Network(e.to_string())),
            };
            part.write_all(&buf[..n])?;
            session.record(&buf[..n]);
            on_progress(session.transferred, session.total);
        }

        part.flush()?;
        part.as_file().sync_all()?;
        let written = part.as_file().metadata()?.len();
        if let Some(expected) = session.total {
            if written != expected {
                return Err(DownloadError::Truncated { expected, written });
            }
        }

        part.persist(&session.dest).map_err(|e| DownloadError::Io(e.error))?;
        debug!("{} complete: {written} bytes", session.url);
        Ok(Downloaded {
            path: session.dest,
            bytes: written,
        })
    }
}
