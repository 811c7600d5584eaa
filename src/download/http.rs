//! HTTP range requests with a blocking `reqwest` client.

use std::io::{self, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use url::Url;

use super::RangeSource;

/// Serves a remote file through `HEAD` and ranged `GET` requests.
pub struct HttpRangeSource {
    client: Client,
    url: Url,
}

impl HttpRangeSource {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("invalid URL: {}", url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("unsupported URL scheme {:?}: {}", url.scheme(), url);
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl RangeSource for HttpRangeSource {
    fn content_length(&self) -> Result<u64> {
        let response = self
            .client
            .head(self.url.clone())
            .send()
            .with_context(|| format!("HEAD {} failed", self.url))?;
        if response.status() != StatusCode::OK {
            anyhow::bail!("HEAD {} returned {}", self.url, response.status());
        }
        // The body of a HEAD reply is empty, so read the header rather than
        // the body size hint.
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
            .with_context(|| format!("HEAD {} did not report a content length", self.url))
    }

    fn fetch_range(&self, start: u64, end: u64, sink: &mut dyn Write) -> Result<()> {
        let mut response = self
            .client
            .get(self.url.clone())
            .header(RANGE, format!("bytes={}-{}", start, end))
            .send()
            .with_context(|| format!("GET {} bytes {}-{} failed", self.url, start, end))?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            anyhow::bail!("expected 206 Partial Content, got {}", response.status());
        }
        io::copy(&mut response, sink).context("failed to read response body")?;
        Ok(())
    }
}
