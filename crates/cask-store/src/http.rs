//! HTTP(S) chunk and index store backend.
//!
//! Chunks are plain objects served at
//! `<base>/<first-4-hex>/<full-id>.<ext>`; a 404 is the not-found
//! signal. The HTTP transport has no listing primitive, so an HTTP
//! store cannot be pruned.

use std::time::Duration;

use bytes::Bytes;
use cask_cas::Index;
use cask_types::StoreOptions;
use reqwest::StatusCode;
use url::Url;

use crate::error::StoreError;
use crate::remote::{ObjectTransport, RemoteStore, with_retry};
use crate::traits::{IndexStore, IndexWriteStore};

/// Default request timeout when none is configured.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// A chunk store over HTTP(S).
pub type HttpStore = RemoteStore<HttpTransport>;

/// Open an HTTP chunk store at `url`.
pub fn new_http_store(url: &Url, opt: StoreOptions) -> Result<HttpStore, StoreError> {
    Ok(RemoteStore::new(HttpTransport::new(url, &opt)?, opt))
}

/// [`ObjectTransport`] over a reqwest client.
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
}

impl HttpTransport {
    /// Build a transport for `url`, applying the store options'
    /// timeout and TLS trust settings.
    pub fn new(url: &Url, opt: &StoreOptions) -> Result<Self, StoreError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(StoreError::Config {
                location: url.to_string(),
                reason: format!("unexpected scheme {:?}", url.scheme()),
            });
        }
        let mut base = url.clone();
        // Relative key resolution needs a directory-style base.
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let client = reqwest::Client::builder()
            .timeout(opt.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .danger_accept_invalid_certs(opt.trust_insecure)
            .build()
            .map_err(StoreError::Http)?;
        Ok(Self { client, base })
    }

    fn object_url(&self, key: &str) -> Result<Url, StoreError> {
        self.base.join(key).map_err(|e| StoreError::Config {
            location: self.base.to_string(),
            reason: format!("bad object key {key:?}: {e}"),
        })
    }
}

#[async_trait::async_trait]
impl ObjectTransport for HttpTransport {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let resp = self.client.get(self.object_url(key)?).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        Ok(Some(resp.bytes().await?))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        self.client
            .put(self.object_url(key)?)
            .body(data)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<bool, StoreError> {
        let resp = self.client.head(self.object_url(key)?).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        resp.error_for_status()?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let resp = self.client.delete(self.object_url(key)?).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status()?;
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        Err(StoreError::NotSupported {
            location: self.location(),
            operation: "listing",
        })
    }

    fn location(&self) -> String {
        self.base.to_string()
    }
}

/// Index store over HTTP(S); indexes are objects named directly under
/// the base URL.
pub struct HttpIndexStore {
    transport: HttpTransport,
    error_retry: u32,
}

impl HttpIndexStore {
    /// Open an HTTP index store at `url`.
    pub fn new(url: &Url, opt: StoreOptions) -> Result<Self, StoreError> {
        Ok(Self {
            transport: HttpTransport::new(url, &opt)?,
            error_retry: opt.error_retry,
        })
    }
}

#[async_trait::async_trait]
impl IndexStore for HttpIndexStore {
    async fn get_index_bytes(&self, name: &str) -> Result<Bytes, StoreError> {
        let location = self.location();
        with_retry(&location, self.error_retry, || self.transport.get(name))
            .await?
            .ok_or_else(|| StoreError::IndexMissing(name.to_string()))
    }

    fn location(&self) -> String {
        self.transport.location()
    }
}

#[async_trait::async_trait]
impl IndexWriteStore for HttpIndexStore {
    async fn store_index(&self, name: &str, index: &Index) -> Result<(), StoreError> {
        let mut data = Vec::new();
        index.write_to(&mut data)?;
        let data = Bytes::from(data);
        let location = self.location();
        with_retry(&location, self.error_retry, || {
            self.transport.put(name, data.clone())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_directory_form() {
        let url = Url::parse("https://chunks.example.com/store").unwrap();
        let transport = HttpTransport::new(&url, &StoreOptions::default()).unwrap();
        assert_eq!(transport.location(), "https://chunks.example.com/store/");

        let obj = transport.object_url("ab12/ab12ff.cacnk").unwrap();
        assert_eq!(
            obj.as_str(),
            "https://chunks.example.com/store/ab12/ab12ff.cacnk"
        );
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        let url = Url::parse("ftp://example.com/store").unwrap();
        assert!(matches!(
            HttpTransport::new(&url, &StoreOptions::default()),
            Err(StoreError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_listing_not_supported() {
        let url = Url::parse("http://example.com/store/").unwrap();
        let transport = HttpTransport::new(&url, &StoreOptions::default()).unwrap();
        assert!(matches!(
            transport.list_keys().await,
            Err(StoreError::NotSupported { operation: "listing", .. })
        ));
    }
}
