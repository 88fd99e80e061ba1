//! The network seam.
//!
//! Catalog fetches and downloads go through [`Fetch`] so the pipeline can run
//! against an in-memory server in tests. [`HttpClient`] is the real,
//! blocking `reqwest` implementation.
use crate::config::Config;
use crate::error::DownloadError;
use reqwest::blocking::Client;
use std::io::Read;
use std::time::Duration;

/// An open response body with a successful status.
pub struct HttpBody {
    /// The declared `Content-Length`, if the server sent one.
    pub content_length: Option<u64>,
    pub reader: Box<dyn Read + Send>,
}

pub trait Fetch: Send + Sync {
    /// Starts a streaming GET. Non-success statuses are errors.
    fn open(&self, url: &str) -> Result<HttpBody, DownloadError>;

    /// Fetches a small text resource within `timeout`.
    fn get_text(&self, url: &str, timeout: Duration) -> Result<String, DownloadError>;
}

pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(config: &Config) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(concat!("altima-usb/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.connect_timeout())
            // Image downloads run for minutes; only connecting is bounded.
            .timeout(None::<Duration>)
            .build()?;
        Ok(Self { client })
    }
}

impl Fetch for HttpClient {
    fn open(&self, url: &str) -> Result<HttpBody, DownloadError> {
        let resp = self.client.get(url).send()?.error_for_status()?;
        Ok(HttpBody {
            content_length: resp.content_length(),
            reader: Box::new(resp),
        })
    }

    fn get_text(&self, url: &str, timeout: Duration) -> Result<String, DownloadError> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()?
            .error_for_status()?;
        Ok(resp.text()?)
    }
}
