//! Azure block-blob chunk store.
//!
//! Each chunk is staged as an uncommitted block (`Put Block`) and the blob
//! becomes readable once the ordered block list is committed
//! (`Put Block List`). Requests are authorized with a container SAS token.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};
use url::Url;

use super::{block_id, ChunkStore};
use crate::{Result, VaultError};

/// Blob service REST API version sent with every request.
const API_VERSION: &str = "2021-08-06";

/// Connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Total request timeout in seconds.
const TOTAL_TIMEOUT_SECS: u64 = 120;

/// User agent string for blob requests.
const USER_AGENT: &str = "filevault/0.1 (chunk store)";

/// Chunk store backed by an Azure blob container.
pub struct AzureBlobStore {
    client: Client,
    container_url: Url,
    sas_token: String,
}

impl AzureBlobStore {
    /// Create a store for a container URL and SAS token.
    pub fn new(container_url: &str, sas_token: &str) -> Result<Self> {
        let mut container_url = Url::parse(container_url)
            .map_err(|e| VaultError::Config(format!("invalid container URL: {}", e)))?;
        if container_url.cannot_be_a_base() {
            return Err(VaultError::Config(format!(
                "container URL cannot hold blob paths: {}",
                container_url
            )));
        }
        container_url.set_query(None);

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(TOTAL_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| VaultError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            container_url,
            sas_token: sas_token.trim_start_matches('?').to_string(),
        })
    }

    /// URL of a blob with the SAS token and extra query parameters applied.
    pub fn blob_url(&self, object_id: &str, params: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.container_url.clone();
        url.path_segments_mut()
            .map_err(|_| VaultError::Config("container URL cannot hold blob paths".into()))?
            .pop_if_empty()
            .push(object_id);

        let mut query = self.sas_token.clone();
        for (key, value) in params {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(key);
            query.push('=');
            query.push_str(&urlencoding::encode(value));
        }
        if !query.is_empty() {
            url.set_query(Some(&query));
        }

        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("x-ms-version", API_VERSION)
    }

    async fn check(response: Response, what: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        warn!(%status, what, "blob request failed");
        Err(VaultError::Io(format!("{} failed: HTTP {} {}", what, status, body)))
    }
}

/// XML body for `Put Block List`.
pub fn block_list_xml(ordered_indexes: &[u64]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
    for &index in ordered_indexes {
        xml.push_str("<Latest>");
        xml.push_str(&block_id(index));
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

#[async_trait]
impl ChunkStore for AzureBlobStore {
    fn backend_name(&self) -> &'static str {
        "azure"
    }

    async fn create_backing_object(&self, owner_id: i64, object_id: &str) -> Result<()> {
        // Blocks can be staged against a blob name that does not exist yet
        debug!(owner_id, object_id, "reserved blob name");
        Ok(())
    }

    async fn write_chunk(
        &self,
        object_id: &str,
        index: u64,
        _chunk_size: u64,
        data: &[u8],
    ) -> Result<()> {
        let block = block_id(index);
        let url = self.blob_url(object_id, &[("comp", "block"), ("blockid", &block)])?;
        let response = self
            .request(Method::PUT, url)
            .body(data.to_vec())
            .send()
            .await?;
        Self::check(response, "put block").await?;
        Ok(())
    }

    async fn commit_staged_chunks(
        &self,
        object_id: &str,
        ordered_indexes: &[u64],
        content_type: &str,
    ) -> Result<()> {
        let url = self.blob_url(object_id, &[("comp", "blocklist")])?;
        let mut request = self
            .request(Method::PUT, url)
            .header("content-type", "application/xml")
            .body(block_list_xml(ordered_indexes));
        if !content_type.is_empty() {
            request = request.header("x-ms-blob-content-type", content_type);
        }
        let response = request.send().await?;
        Self::check(response, "put block list").await?;

        debug!(object_id, blocks = ordered_indexes.len(), "committed block list");
        Ok(())
    }

    async fn read_chunk(&self, object_id: &str, index: u64, chunk_size: u64) -> Result<Vec<u8>> {
        if chunk_size == 0 {
            return Ok(Vec::new());
        }
        let start = index * chunk_size;
        let end = start + chunk_size - 1;
        let url = self.blob_url(object_id, &[])?;
        let response = self
            .request(Method::GET, url)
            .header("x-ms-range", format!("bytes={}-{}", start, end))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(VaultError::NotFound(format!("object {}", object_id))),
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(Vec::new()),
            _ => {
                let response = Self::check(response, "get blob").await?;
                Ok(response.bytes().await?.to_vec())
            }
        }
    }

    async fn delete_backing_object(&self, object_id: &str) -> Result<bool> {
        let url = self.blob_url(object_id, &[])?;
        let response = self
            .request(Method::DELETE, url)
            .header("x-ms-delete-snapshots", "include")
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response, "delete blob").await?;
        Ok(true)
    }
}
