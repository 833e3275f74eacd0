use crate::error::{Error, Result};
use crate::models::{strip_scheme, BLOB_SCHEME, DATA_SCHEME};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use std::time::Duration;

/// Fetches a browser-loadable image source (http(s) or inline `data:`). Completes once the whole image
/// is available or fails with a decode error.
#[async_trait]
pub trait ImageLoader: Send + Sync {
    async fn load(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct HttpImageLoader {
    client: reqwest::Client,
}

impl HttpImageLoader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Init(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageLoader for HttpImageLoader {
    async fn load(&self, url: &str) -> Result<Vec<u8>> {
        if let Some(payload) = strip_scheme(url, DATA_SCHEME) {
            return decode_data_url(payload);
        }
        if strip_scheme(url, BLOB_SCHEME).is_some() {
            return Err(Error::Decode(format!(
                "{url} only resolves inside the page that created it"
            )));
        }
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Decode(format!("Image request failed for {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Decode(format!(
                "Image load failed with status {} for {url}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Decode(format!("Image body incomplete for {url}: {e}")))?;
        log::debug!("Loaded {} bytes from {url}", bytes.len());
        Ok(bytes.to_vec())
    }
}

/// Decodes the part of a `data:` URL after the scheme. Only base64 payloads
/// carry image bytes.
fn decode_data_url(payload: &str) -> Result<Vec<u8>> {
    let (meta, data) = payload
        .split_once(',')
        .ok_or_else(|| Error::Decode("data URL has no payload".into()))?;
    let is_base64 = meta
        .rsplit(';')
        .next()
        .is_some_and(|param| param.trim().eq_ignore_ascii_case("base64"));
    if !is_base64 {
        return Err(Error::Decode(format!(
            "data URL ({meta}) is not base64 encoded"
        )));
    }
    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| Error::Decode(format!("data URL ({meta}) payload: {e}")))?;
    log::debug!("Decoded {} inline bytes ({meta})", bytes.len());
    Ok(bytes)
}
