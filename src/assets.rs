//! Lazily fetched inline image assets.
//!
//! A [`LazyAsset`] is created eagerly for every image a rendered message
//! references but performs no network I/O until the transport first reads
//! from it. The response body is released on [`LazyAsset::release`] or when
//! the asset is dropped, whichever comes first.

use std::path::Path;

use futures::stream::{self, StreamExt};
use tracing::debug;

use crate::campaign::TemplateImage;
use crate::error::TransportError;

enum State {
    Idle,
    Streaming(reqwest::Response),
    Finished,
    Released,
}

/// A readable, releasable handle on one remote image.
pub struct LazyAsset {
    name: String,
    url: String,
    client: reqwest::Client,
    state: State,
}

impl std::fmt::Debug for LazyAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyAsset")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("fetched", &self.is_fetched())
            .finish()
    }
}

impl LazyAsset {
    pub fn new(client: reqwest::Client, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client,
            state: State::Idle,
        }
    }

    /// Build the asset for a template image hosted under `base_url`.
    pub fn for_image(client: reqwest::Client, base_url: &str, image: &TemplateImage) -> Self {
        let url = if image.url.starts_with("http://") || image.url.starts_with("https://") {
            image.url.clone()
        } else {
            format!("{}{}", base_url.trim_end_matches('/'), image.url)
        };
        Self::new(client, image.name.clone(), url)
    }

    /// Attachment name; also the content id the HTML refers to.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the network request has been issued.
    pub fn is_fetched(&self) -> bool {
        !matches!(self.state, State::Idle)
    }

    /// MIME type guessed from the file extension.
    pub fn content_type(&self) -> &'static str {
        let path = self.url.split(['?', '#']).next().unwrap_or_default();
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("png") => "image/png",
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("gif") => "image/gif",
            Some("webp") => "image/webp",
            Some("svg") => "image/svg+xml",
            _ => "application/octet-stream",
        }
    }

    /// Read the next chunk, issuing the request on first call.
    /// Returns `Ok(None)` at end of stream.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if let State::Idle = self.state {
            debug!(asset = %self.name, url = %self.url, "Fetching inline asset");
            let response = self
                .client
                .get(&self.url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| self.asset_error(e))?;
            self.state = State::Streaming(response);
        }

        let State::Streaming(response) = &mut self.state else {
            return Ok(None);
        };
        match response.chunk().await {
            Ok(Some(chunk)) => Ok(Some(chunk.to_vec())),
            Ok(None) => {
                self.state = State::Finished;
                Ok(None)
            }
            Err(e) => Err(self.asset_error(e)),
        }
    }

    /// Read everything that is left.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.read().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf)
    }

    /// Turn the asset into a streaming request body.
    ///
    /// The first chunk is read up front so a failed fetch surfaces here, not
    /// halfway through the outgoing request. The rest is forwarded as it
    /// arrives and the asset is released once the body is consumed.
    pub async fn into_body(mut self) -> Result<reqwest::Body, TransportError> {
        let first = self.read().await?;
        let rest = stream::try_unfold(self, |mut asset| async move {
            let chunk = asset.read().await?;
            Ok::<_, TransportError>(chunk.map(|c| (c, asset)))
        });
        Ok(reqwest::Body::wrap_stream(
            stream::iter(first.map(Ok)).chain(rest),
        ))
    }

    /// Drop any open response body. Further reads return end of stream.
    pub fn release(&mut self) {
        if matches!(self.state, State::Streaming(_)) {
            debug!(asset = %self.name, "Releasing inline asset before end of stream");
        }
        self.state = State::Released;
    }

    fn asset_error(&self, e: reqwest::Error) -> TransportError {
        TransportError::Asset {
            url: self.url.clone(),
            reason: e.to_string(),
        }
    }
}

impl Drop for LazyAsset {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn image(name: &str, url: &str) -> TemplateImage {
        TemplateImage {
            name: name.into(),
            url: url.into(),
            width: None,
            height: None,
        }
    }

    #[tokio::test]
    async fn no_request_until_first_read() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/uploads/logo.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .expect(1)
            .mount(&server)
            .await;

        let mut asset = LazyAsset::for_image(
            reqwest::Client::new(),
            &server.uri(),
            &image("logo", "/uploads/logo.png"),
        );
        assert!(!asset.is_fetched());
        assert_eq!(server.received_requests().await.unwrap().len(), 0);

        assert_eq!(asset.read_to_end().await.unwrap(), vec![1, 2, 3]);
        assert!(asset.is_fetched());
        // Exhausted: a further read neither refetches nor yields data.
        assert!(asset.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropped_asset_never_fetches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let asset = LazyAsset::for_image(
            reqwest::Client::new(),
            &server.uri(),
            &image("logo", "/uploads/logo.png"),
        );
        drop(asset);
    }

    #[tokio::test]
    async fn http_error_is_asset_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mut asset = LazyAsset::new(
            reqwest::Client::new(),
            "logo",
            format!("{}/missing.png", server.uri()),
        );
        assert!(matches!(
            asset.read().await.unwrap_err(),
            TransportError::Asset { .. }
        ));
    }

    #[tokio::test]
    async fn released_asset_reads_empty() {
        let mut asset = LazyAsset::new(reqwest::Client::new(), "x", "http://127.0.0.1:9/x.png");
        asset.release();
        assert!(asset.read().await.unwrap().is_none());
    }

    #[test]
    fn absolute_urls_kept() {
        let asset = LazyAsset::for_image(
            reqwest::Client::new(),
            "https://cms.example.com",
            &image("b", "https://cdn.example.com/b.JPG?v=2"),
        );
        assert_eq!(asset.url(), "https://cdn.example.com/b.JPG?v=2");
        assert_eq!(asset.content_type(), "image/jpeg");
    }
}
