use std::collections::HashMap;
use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::config::ClerkConfig;

/// Errors from the broker exchange or the bucket requests it signs.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid status code {0}")]
    Status(u16),

    #[error("remote error: {0:?}")]
    Remote(String),

    #[error("malformed broker response: {0}")]
    Malformed(String),

    #[error("presigned URL does not match expected pattern")]
    Untrusted,

    #[error("invalid header format: {0}")]
    Header(String),

    #[error("list response: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error("continuation token cannot be empty")]
    EmptyContinuationToken,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    List,
    Get,
    Put,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::List => "List",
            Mode::Get => "Get",
            Mode::Put => "Put",
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthenticateResponse {
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, Vec<String>>,
    #[serde(rename = "created-filename")]
    created_filename: Option<String>,
    error: Option<String>,
}

/// One presigned request, ready to be issued against the bucket.
#[derive(Debug)]
struct Presigned {
    url: String,
    headers: HeaderMap,
    created_filename: Option<String>,
}

/// One page of the bucket listing.
#[derive(Debug)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub is_truncated: bool,
    pub next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ListContents>,
    #[serde(default)]
    is_truncated: bool,
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListContents {
    key: String,
}

/// HTTP client for the watchdemon broker and the bucket behind it.
///
/// Every bucket request is a two-step dance: POST the device credentials to
/// the broker, then replay the presigned URL and headers it returns against
/// the bucket itself. The bucket operator only ever sees ciphertext.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    client: reqwest::Client,
    config: Arc<ClerkConfig>,
}

impl BrokerClient {
    pub fn new(config: Arc<ClerkConfig>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn authenticate(
        &self,
        mode: Mode,
        key: &str,
        sha256: Option<&str>,
    ) -> Result<Presigned, BrokerError> {
        let endpoint = format!(
            "{}/watchdemon/authenticate",
            self.config.broker_url.trim_end_matches('/')
        );
        let mut form = vec![
            ("device", self.config.device_name.as_str()),
            ("token", self.config.device_token.as_str()),
            ("mode", mode.as_str()),
            ("key", key),
        ];
        if mode == Mode::Put {
            let sha256 =
                sha256.ok_or_else(|| BrokerError::Malformed("missing sha256 for Put".into()))?;
            form.push(("sha256", sha256));
        }
        let response = self.client.post(&endpoint).form(&form).send().await?;
        let body: AuthenticateResponse = response.json().await?;
        if let Some(message) = body.error {
            return Err(BrokerError::Remote(message));
        }
        let url = body
            .url
            .ok_or_else(|| BrokerError::Malformed("no URL returned in JSON object".into()))?;
        if !url.starts_with(&self.config.bucket_prefix) {
            return Err(BrokerError::Untrusted);
        }
        let mut headers = HeaderMap::new();
        for (name, values) in &body.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| BrokerError::Header(e.to_string()))?;
            for value in values {
                let value = HeaderValue::from_str(value)
                    .map_err(|e| BrokerError::Header(e.to_string()))?;
                headers.append(name.clone(), value);
            }
        }
        let created_filename = match mode {
            Mode::Put => match body.created_filename {
                Some(name) if !name.is_empty() => Some(name),
                _ => return Err(BrokerError::Malformed("invalid created filename".into())),
            },
            _ => None,
        };
        Ok(Presigned {
            url,
            headers,
            created_filename,
        })
    }

    /// Fetch one page of the bucket listing.
    ///
    /// The first page is requested with no continuation token; later pages
    /// replay the token from the previous page. An empty token is a caller
    /// bug and refused outright.
    pub async fn list_page(&self, continuation: Option<&str>) -> Result<ListPage, BrokerError> {
        if continuation == Some("") {
            return Err(BrokerError::EmptyContinuationToken);
        }
        let presigned = self
            .authenticate(Mode::List, continuation.unwrap_or(""), None)
            .await?;
        let response = self
            .client
            .get(&presigned.url)
            .headers(presigned.headers)
            .send()
            .await?;
        if response.status().as_u16() != 200 {
            return Err(BrokerError::Status(response.status().as_u16()));
        }
        let text = response.text().await?;
        let result: ListBucketResult = quick_xml::de::from_str(&text)?;
        tracing::debug!(
            keys = result.contents.len(),
            truncated = result.is_truncated,
            "listed bucket page"
        );
        Ok(ListPage {
            keys: result.contents.into_iter().map(|c| c.key).collect(),
            is_truncated: result.is_truncated,
            next_token: result.next_continuation_token,
        })
    }

    /// Open a GET stream for one bucket object.
    pub async fn get_stream(&self, path: &str) -> Result<reqwest::Response, BrokerError> {
        let presigned = self.authenticate(Mode::Get, path, None).await?;
        let response = self
            .client
            .get(&presigned.url)
            .headers(presigned.headers)
            .send()
            .await?;
        if response.status().as_u16() != 200 {
            return Err(BrokerError::Status(response.status().as_u16()));
        }
        Ok(response)
    }

    /// Upload `file` (already positioned at 0) under `infix`.
    ///
    /// The broker composes the final bucket path from the device name, the
    /// infix, and the ciphertext hash; we return it verbatim.
    pub async fn put_object(
        &self,
        infix: &str,
        sha256_hex: &str,
        length: u64,
        file: std::fs::File,
    ) -> Result<String, BrokerError> {
        let presigned = self
            .authenticate(Mode::Put, infix, Some(sha256_hex))
            .await?;
        let created_filename = presigned
            .created_filename
            .ok_or_else(|| BrokerError::Malformed("invalid created filename".into()))?;
        let stream = ReaderStream::new(tokio::fs::File::from_std(file));
        let response = self
            .client
            .put(&presigned.url)
            .headers(presigned.headers)
            .header(CONTENT_LENGTH, length)
            .header("X-Amz-Content-Sha256", sha256_hex)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;
        if response.status().as_u16() != 200 {
            return Err(BrokerError::Status(response.status().as_u16()));
        }
        tracing::debug!(infix, length, "uploaded object");
        Ok(created_filename)
    }
}
