//! HTTP(S) back-end
//!
//! `PUT`/`GET`/`DELETE {base}/{key}`; listing is `GET {base}/?list=<prefix>`
//! answered with a JSON array of keys or one key per line.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::debug;

use super::sigv4::uri_encode;
use super::{Transport, TransportState};
use crate::error::{EmbrError, Result};
use crate::remote::config::RemoteConfig;

pub struct HttpTransport {
    base: String,
    token: Option<String>,
    client: Client,
    state: TransportState,
}

impl HttpTransport {
    pub fn new(base: impl Into<String>, config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .connect_timeout(Duration::from_secs(config.timeout))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            token: config.token.clone(),
            client,
            state: TransportState::default(),
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base, uri_encode(key.trim_start_matches('/'), false))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Map a non-success status onto the error kinds
pub(crate) fn status_error(status: StatusCode, what: &str) -> EmbrError {
    let msg = format!("{} returned {}", what, status);
    match status.as_u16() {
        401 | 403 => EmbrError::Auth(msg),
        404 => EmbrError::NotFound(msg),
        408 => EmbrError::Timeout(msg),
        409 => EmbrError::Conflict(msg),
        400..=499 => EmbrError::Rejected(msg),
        _ => EmbrError::Network(msg),
    }
}

fn check(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(status_error(status, what))
    }
}

/// Keys from a listing body: a JSON array of strings, or one key per line
fn parse_listing(body: &str) -> Vec<String> {
    if let Ok(keys) = serde_json::from_str::<Vec<String>>(body) {
        return keys;
    }
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl Transport for HttpTransport {
    fn scheme(&self) -> &'static str {
        "http"
    }

    fn state(&self) -> &TransportState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut TransportState {
        &mut self.state
    }

    async fn connect(&mut self) -> Result<()> {
        // Reachability only; any HTTP answer counts as connected
        let response = self.authorize(self.client.head(&self.base)).send().await?;
        debug!("connected to {} ({})", self.base, response.status());
        Ok(())
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let url = self.url(key);
        let response = self.authorize(self.client.put(&url)).body(data).send().await?;
        check(response, &format!("PUT {}", url))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let url = self.url(key);
        let response = self.authorize(self.client.get(&url)).send().await?;
        let response = check(response, &format!("GET {}", url))?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let url = format!("{}/?list={}", self.base, uri_encode(prefix, true));
        let response = self.authorize(self.client.get(&url)).send().await?;
        let body = check(response, &format!("GET {}", url))?.text().await?;
        let mut keys: Vec<String> = parse_listing(&body)
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for key in keys {
            let url = self.url(key);
            let response = self.authorize(self.client.delete(&url)).send().await?;
            match response.status() {
                s if s.is_success() => deleted += 1,
                StatusCode::NOT_FOUND => {}
                s => return Err(status_error(s, &format!("DELETE {}", url))),
            }
        }
        Ok(deleted)
    }
}
