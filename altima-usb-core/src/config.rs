//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all) is a
//! valid configuration. Front ends usually call [`Config::load`] on a user
//! supplied path and fall back to [`Config::default`].
use crate::catalog::CatalogEntry;
use crate::error::ConfigError;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CATALOG_URL: &str = "https://download.altimalinux.com/altima-iso-list.json";
pub const DEFAULT_LOADER_URL: &str = "https://download.altimalinux.com/ventoy.zip";

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Remote manifest listing the available images.
    pub catalog_url: String,
    /// Where the loader distribution archive is downloaded from.
    pub loader_url: String,
    /// A local loader archive. When set, nothing is downloaded for the loader.
    pub loader_archive: Option<PathBuf>,
    /// File name of the installer inside the loader archive. Defaults per platform.
    pub installer_name: Option<String>,
    /// Label of the data partition the loader creates.
    pub volume_label: String,
    /// Devices at or below this capacity are never offered.
    pub min_capacity_bytes: u64,
    /// How long a device list stays valid for confirming a selection.
    pub selection_ttl_secs: u64,
    pub catalog_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Images and loader archives are downloaded here before being written.
    pub download_dir: PathBuf,
    /// Keep the downloaded image after it was written to the device.
    pub keep_downloads: bool,
    /// Buffer size for streaming downloads, hashing and copying.
    pub chunk_size: usize,
    /// Offered when the remote catalog cannot be used.
    pub fallback_images: Vec<CatalogEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            loader_url: DEFAULT_LOADER_URL.to_string(),
            loader_archive: None,
            installer_name: None,
            volume_label: "Ventoy".to_string(),
            min_capacity_bytes: 8 * GIB,
            selection_ttl_secs: 120,
            catalog_timeout_secs: 5,
            connect_timeout_secs: 10,
            download_dir: dirs::download_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("altima-usb"),
            keep_downloads: false,
            chunk_size: 1024 * 1024,
            fallback_images: vec![
                CatalogEntry::new("Altima Linux Minimal (Fallback)", "altima-minimal-1.0.iso"),
                CatalogEntry::new("Altima Linux Full (Fallback)", "altima-full-1.0.iso"),
            ],
        }
    }
}

impl Config {
    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "chunk_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        for (field, url) in [("catalog_url", &self.catalog_url), ("loader_url", &self.loader_url)] {
            Url::parse(url).map_err(|e| ConfigError::Invalid {
                field,
                reason: format!("{url}: {e}"),
            })?;
        }
        Ok(())
    }

    pub fn selection_ttl(&self) -> Duration {
        Duration::from_secs(self.selection_ttl_secs)
    }

    pub fn catalog_timeout(&self) -> Duration {
        Duration::from_secs(self.catalog_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"volume_label": "VTOY", "keep_downloads": true}}"#).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.volume_label, "VTOY");
        assert!(config.keep_downloads);
        assert_eq!(config.min_capacity_bytes, 8 * GIB);
        assert_eq!(config.catalog_url, DEFAULT_CATALOG_URL);
        assert_eq!(config.fallback_images.len(), 2);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let config = Config {
            chunk_size: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "chunk_size", .. })
        ));
    }

    #[test]
    fn unparsable_url_is_rejected() {
        let config = Config {
            catalog_url: "not a url".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "catalog_url", .. })
        ));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
