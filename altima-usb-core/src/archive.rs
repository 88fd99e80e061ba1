//! Unpacks the loader distribution archive and finds its installer.
//!
//! Releases ship as `.zip` on Windows and as tarballs elsewhere; the
//! compression is picked from the file extension.
use crate::error::InstallError;
use flate2::read::GzDecoder;
use log::{debug, warn};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use xz2::read::XzDecoder;
use zip::ZipArchive;
use zstd::stream::read::Decoder as ZstdDecoder;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
    TarXz,
    TarZst,
}

impl ArchiveKind {
    fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        let kind = if name.ends_with(".zip") {
            ArchiveKind::Zip
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            ArchiveKind::TarGz
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            ArchiveKind::TarXz
        } else if name.ends_with(".tar.zst") || name.ends_with(".tar.zstd") {
            ArchiveKind::TarZst
        } else if name.ends_with(".tar") {
            ArchiveKind::Tar
        } else {
            return None;
        };
        Some(kind)
    }
}

/// Extracts `archive` into `dest`, which is created if needed.
pub fn extract(archive: &Path, dest: &Path) -> Result<(), InstallError> {
    let kind = ArchiveKind::from_path(archive).ok_or_else(|| {
        InstallError::ArchiveCorrupt(format!("unsupported archive type: {}", archive.display()))
    })?;
    debug!("extracting {} ({kind:?}) to {}", archive.display(), dest.display());
    fs::create_dir_all(dest)?;

    let input = BufReader::new(File::open(archive)?);
    let reader: Box<dyn Read> = match kind {
        ArchiveKind::Zip => return unzip(archive, dest),
        ArchiveKind::Tar => Box::new(input),
        ArchiveKind::TarGz => Box::new(GzDecoder::new(input)),
        ArchiveKind::TarXz => Box::new(XzDecoder::new(input)),
        ArchiveKind::TarZst => Box::new(
            ZstdDecoder::new(input).map_err(|e| InstallError::ArchiveCorrupt(e.to_string()))?,
        ),
    };

    tar::Archive::new(reader)
        .unpack(dest)
        .map_err(|e| InstallError::ArchiveCorrupt(e.to_string()))
}

fn unzip(archive: &Path, dest: &Path) -> Result<(), InstallError> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!("skipping unsafe archive entry {:?}", entry.name());
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out).map_err(|e| {
            // Decompression failures surface as I/O errors from the entry reader.
            if e.kind() == io::ErrorKind::InvalidData || e.kind() == io::ErrorKind::UnexpectedEof {
                InstallError::ArchiveCorrupt(e.to_string())
            } else {
                InstallError::Io(e)
            }
        })?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

/// Finds the installer named `name` (case-insensitively) anywhere below `root`.
///
/// Release trees nest the installer under a versioned directory, so the
/// location is not fixed. If several files match, the shallowest wins.
pub fn find_installer(root: &Path, name: &str) -> Result<PathBuf, InstallError> {
    let mut matches: Vec<(usize, PathBuf)> = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().eq_ignore_ascii_case(name))
        .map(|e| (e.depth(), e.into_path()))
        .collect();

    if matches.len() > 1 {
        warn!(
            "{} candidates for {name} in the loader archive, using the shallowest",
            matches.len()
        );
    }
    matches.sort_by_key(|(depth, _)| *depth);
    matches
        .into_iter()
        .next()
        .map(|(_, path)| path)
        .ok_or_else(|| InstallError::ToolMissing(name.to_string()))
}
