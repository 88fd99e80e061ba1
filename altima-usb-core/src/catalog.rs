//! Resolves the list of installable images.
//!
//! The remote manifest is tried first; if it cannot be fetched or parsed the
//! configured fallback list is used instead, so a front end always has
//! something to offer. Detached checksum files are only fetched when a
//! download of that image actually starts.
use crate::checksum::{ExpectedDigest, extract_digest};
use crate::error::{CatalogError, JobError};
use crate::http::Fetch;
use log::{info, warn};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DETACHED_SUFFIXES: &[&str] = &[".sha256", ".sha256sum", ".md5", ".md5sum"];

/// One manifest entry as published.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

impl CatalogEntry {
    pub fn new(name: &str, file: &str) -> Self {
        Self {
            name: name.to_string(),
            file: file.to_string(),
            sha256: None,
            md5: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Manifest {
    Wrapped { isos: Vec<CatalogEntry> },
    Bare(Vec<CatalogEntry>),
}

/// Where an image's expected digest comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ChecksumRef {
    /// The digest itself, as written in the manifest.
    Inline(String),
    /// URL of a `.sha256`/`.md5` file holding the digest.
    Detached(String),
}

impl ChecksumRef {
    fn from_field(value: &str, base: &Url) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        let lower = value.to_ascii_lowercase();
        if DETACHED_SUFFIXES.iter().any(|s| lower.ends_with(s)) {
            let url = base
                .join(value)
                .map(String::from)
                .unwrap_or_else(|_| value.to_string());
            Some(ChecksumRef::Detached(url))
        } else {
            Some(ChecksumRef::Inline(value.to_string()))
        }
    }
}

/// An image the user can pick, with its download location resolved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImageDescriptor {
    pub name: String,
    /// Local file name, safe to join onto a directory. Also the image's id.
    pub file: String,
    pub url: String,
    pub checksum: Option<ChecksumRef>,
}

impl ImageDescriptor {
    pub fn id(&self) -> &str {
        &self.file
    }
}

/// Where a resolved image list came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatalogSource {
    Remote,
    Fallback,
}

pub struct ImageCatalog<'a> {
    fetch: &'a dyn Fetch,
    manifest_url: String,
    timeout: Duration,
    fallback: Vec<CatalogEntry>,
}

impl<'a> ImageCatalog<'a> {
    pub fn new(
        fetch: &'a dyn Fetch,
        manifest_url: &str,
        timeout: Duration,
        fallback: Vec<CatalogEntry>,
    ) -> Self {
        Self {
            fetch,
            manifest_url: manifest_url.to_string(),
            timeout,
            fallback,
        }
    }

    /// Returns the remote images, or the fallback list when the manifest is
    /// unreachable or malformed.
    pub fn resolve(&self) -> Result<Vec<ImageDescriptor>, CatalogError> {
        self.resolve_with_source().map(|(images, _)| images)
    }

    /// Like [`resolve`](Self::resolve), also saying where the list came from.
    pub fn resolve_with_source(
        &self,
    ) -> Result<(Vec<ImageDescriptor>, CatalogSource), CatalogError> {
        let base = Url::parse(&self.manifest_url).map_err(|e| CatalogError::InvalidUrl {
            url: self.manifest_url.clone(),
            reason: e.to_string(),
        })?;

        let reason = match self.fetch_remote(&base) {
            Ok(images) => {
                info!("catalog lists {} image(s)", images.len());
                return Ok((images, CatalogSource::Remote));
            }
            Err(reason) => reason,
        };

        let fallback = descriptors(&self.fallback, &base);
        if fallback.is_empty() {
            return Err(CatalogError::Unusable(reason));
        }
        warn!("using built-in image list: {reason}");
        Ok((fallback, CatalogSource::Fallback))
    }

    fn fetch_remote(&self, base: &Url) -> Result<Vec<ImageDescriptor>, String> {
        let text = self
            .fetch
            .get_text(base.as_str(), self.timeout)
            .map_err(|e| e.to_string())?;
        let entries = match serde_json::from_str::<Manifest>(&text) {
            Ok(Manifest::Wrapped { isos }) => isos,
            Ok(Manifest::Bare(entries)) => entries,
            Err(e) => return Err(format!("unexpected manifest shape: {e}")),
        };
        let images = descriptors(&entries, base);
        if images.is_empty() {
            return Err("manifest lists no usable images".to_string());
        }
        Ok(images)
    }

    /// Produces the digest an image must match.
    ///
    /// `Ok(None)` means the catalog makes no claim about the image. A claim
    /// that cannot be turned into a digest is `ChecksumUnavailable`, never a
    /// silent pass.
    pub fn resolve_checksum(
        &self,
        image: &ImageDescriptor,
    ) -> Result<Option<ExpectedDigest>, JobError> {
        let unavailable = |reference: &str, reason: String| JobError::ChecksumUnavailable {
            reference: reference.to_string(),
            reason,
        };
        match &image.checksum {
            None => Ok(None),
            Some(ChecksumRef::Inline(hex)) => ExpectedDigest::parse(hex)
                .map(Some)
                .map_err(|e| unavailable(hex, e.to_string())),
            Some(ChecksumRef::Detached(url)) => {
                info!("fetching checksum {url}");
                let text = self
                    .fetch
                    .get_text(url, self.timeout)
                    .map_err(|e| unavailable(url, e.to_string()))?;
                extract_digest(&text)
                    .map(Some)
                    .ok_or_else(|| unavailable(url, "no 32 or 64 digit hex digest found".into()))
            }
        }
    }
}

fn descriptors(entries: &[CatalogEntry], base: &Url) -> Vec<ImageDescriptor> {
    entries
        .iter()
        .filter_map(|entry| {
            let Some(file) = sanitize_file_name(&entry.file) else {
                warn!("skipping catalog entry {:?} with unusable file name", entry.name);
                return None;
            };
            let url = base.join(entry.file.trim()).ok()?;
            let checksum = entry
                .sha256
                .as_deref()
                .and_then(|v| ChecksumRef::from_field(v, base))
                .or_else(|| {
                    entry
                        .md5
                        .as_deref()
                        .and_then(|v| ChecksumRef::from_field(v, base))
                });
            Some(ImageDescriptor {
                name: entry.name.trim().to_string(),
                file,
                url: url.into(),
                checksum,
            })
        })
        .collect()
}

/// Reduces a remote file name to `[A-Za-z0-9_.-]`, replacing anything else
/// with `-`. Names that would end up empty or dots-only are rejected.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let clean: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if clean.is_empty() || clean.chars().all(|c| c == '.') {
        None
    } else {
        Some(clean)
    }
}
