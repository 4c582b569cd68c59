//! HTTP blob store adapter.
//!
//! Maps the `wg-core` [`BlobStore`] port onto a bucket-style object API:
//! `PUT/GET/DELETE {url}/{bucket}/{key}`, authenticated with `X-API-Key`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use wg_core::{config::StoreConfig, errors::Error, store::BlobStore, Result};

const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Clone, Debug)]
pub struct HttpBlobStore {
    base: String,
    bucket: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl HttpBlobStore {
    /// `timeout` bounds each request; the Session Store adds its own bound on top.
    pub fn new(cfg: &StoreConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Store(format!("http client build failed: {e}")))?;
        Ok(Self {
            base: cfg.url.trim_end_matches('/').to_string(),
            bucket: cfg.bucket.trim_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            http,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.base, self.bucket, key.trim_start_matches('/'))
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header(API_KEY_HEADER, key),
            None => req,
        }
    }

    async fn send(&self, op: &str, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        self.authed(req)
            .send()
            .await
            .map_err(|e| Error::Store(format!("{op} request error: {e}")))
    }
}

/// What a response status means for an operation. 404 is "absent", not a failure.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Ok,
    Absent,
    Failed,
}

fn classify(status: StatusCode) -> Outcome {
    if status.is_success() {
        Outcome::Ok
    } else if status == StatusCode::NOT_FOUND {
        Outcome::Absent
    } else {
        Outcome::Failed
    }
}

async fn failure(op: &str, resp: reqwest::Response) -> Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Error::Store(format!(
        "{op} failed: {status} {}",
        body.chars().take(200).collect::<String>()
    ))
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let len = bytes.len();
        let resp = self
            .send(
                "put",
                self.http
                    .put(self.object_url(key))
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(bytes),
            )
            .await?;
        match classify(resp.status()) {
            Outcome::Ok => {
                debug!(key, bytes = len, "object stored");
                Ok(())
            }
            _ => Err(failure("put", resp).await),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = self.send("get", self.http.get(self.object_url(key))).await?;
        match classify(resp.status()) {
            Outcome::Ok => {
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| Error::Store(format!("get body error: {e}")))?;
                Ok(Some(bytes.to_vec()))
            }
            Outcome::Absent => Ok(None),
            Outcome::Failed => Err(failure("get", resp).await),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self
            .send("delete", self.http.delete(self.object_url(key)))
            .await?;
        match classify(resp.status()) {
            Outcome::Ok | Outcome::Absent => Ok(()),
            Outcome::Failed => Err(failure("delete", resp).await),
        }
    }
}
