//! S3 back-end
//!
//! Requests are signed with SigV4 and go to the virtual-hosted endpoint
//! `https://{bucket}.s3.{region}.amazonaws.com`, or path-style to an explicit
//! `endpoint` from the URL query. Uploads above 8 MiB use multipart upload
//! with 5 MiB parts.

use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::Event;
use reqwest::{Client, Method, Response};
use tracing::{debug, info, warn};

use super::http::status_error;
use super::sigv4::{self, Credentials, SignRequest};
use super::{Transport, TransportState};
use crate::error::{EmbrError, Result};
use crate::paths;
use crate::remote::config::RemoteConfig;

pub const MULTIPART_THRESHOLD: usize = 8 * 1024 * 1024;
pub const PART_SIZE: usize = 5 * 1024 * 1024;
/// Deadline for single-part uploads
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

pub struct S3Transport {
    bucket: String,
    prefix: String,
    region: String,
    endpoint: Option<String>,
    timeout: Duration,
    creds: Option<Credentials>,
    client: Client,
    state: TransportState,
}

/// One page of a ListObjectsV2 response
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub next_token: Option<String>,
}

impl S3Transport {
    pub fn new(
        bucket: String,
        prefix: String,
        region: Option<String>,
        endpoint: Option<String>,
        config: &RemoteConfig,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()?;
        Ok(Self {
            bucket,
            prefix,
            region: sigv4::resolve_region(region.as_deref()),
            endpoint: endpoint.map(|e| e.trim_end_matches('/').to_string()),
            timeout: Duration::from_secs(config.timeout),
            creds: None,
            client,
            state: TransportState::default(),
        })
    }

    pub fn with_credentials(mut self, creds: Credentials) -> Self {
        self.creds = Some(creds);
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Full object key for a transport key, under the URL prefix
    pub fn object_key(&self, key: &str) -> String {
        paths::join_key(&[&self.prefix, key])
    }

    /// Strip the URL prefix from a listed object key
    fn relative_key<'a>(&self, object_key: &'a str) -> Option<&'a str> {
        if self.prefix.is_empty() {
            return Some(object_key);
        }
        object_key.strip_prefix(&self.prefix)?.strip_prefix('/')
    }

    /// Host and URL-encoded path for an object key (empty for the bucket itself)
    pub fn location(&self, object_key: &str) -> (String, String) {
        let encoded = sigv4::uri_encode(object_key, false);
        match &self.endpoint {
            Some(endpoint) => {
                let host = endpoint
                    .split_once("://")
                    .map(|(_, rest)| rest)
                    .unwrap_or(endpoint)
                    .split('/')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                (host, format!("/{}/{}", self.bucket, encoded))
            }
            None => (
                format!("{}.s3.{}.amazonaws.com", self.bucket, self.region),
                format!("/{}", encoded),
            ),
        }
    }

    fn scheme_prefix(&self) -> &str {
        match &self.endpoint {
            Some(e) if e.starts_with("http://") => "http://",
            _ => "https://",
        }
    }

    async fn request(
        &self,
        method: Method,
        object_key: &str,
        query: &[(String, String)],
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<Response> {
        let creds = self
            .creds
            .as_ref()
            .ok_or_else(|| EmbrError::Auth("S3 transport is not connected".into()))?;
        let (host, path) = self.location(object_key);
        let payload_sha256 = sigv4::sha256_hex(&body);
        let signed = sigv4::sign(
            &SignRequest {
                method: method.as_str(),
                host: &host,
                path: &path,
                query,
                payload_sha256: &payload_sha256,
            },
            creds,
            &self.region,
            chrono::Utc::now(),
        )?;

        let query_string = sigv4::canonical_query(query);
        let mut url = format!("{}{}{}", self.scheme_prefix(), host, path);
        if !query_string.is_empty() {
            url.push('?');
            url.push_str(&query_string);
        }
        let mut builder = self.client.request(method.clone(), &url).timeout(timeout);
        for (name, value) in signed {
            builder = builder.header(name, value);
        }
        let response = builder.body(body).send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(status_error(response.status(), &format!("{} {}", method, url)))
        }
    }

    async fn put_single(&self, object_key: &str, data: Vec<u8>) -> Result<()> {
        self.request(Method::PUT, object_key, &[], data, UPLOAD_TIMEOUT).await?;
        Ok(())
    }

    async fn put_multipart(&self, object_key: &str, data: Vec<u8>) -> Result<()> {
        let created = self
            .request(
                Method::POST,
                object_key,
                &[("uploads".into(), String::new())],
                Vec::new(),
                self.timeout,
            )
            .await?
            .text()
            .await?;
        let upload_id = xml_value(&created, b"UploadId")?
            .ok_or_else(|| EmbrError::Protocol("CreateMultipartUpload without UploadId".into()))?;
        debug!("multipart upload {} for {}", upload_id, object_key);

        match self.upload_parts(object_key, &upload_id, &data).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("aborting multipart upload of {}: {}", object_key, e);
                let abort = self
                    .request(
                        Method::DELETE,
                        object_key,
                        &[("uploadId".into(), upload_id.clone())],
                        Vec::new(),
                        self.timeout,
                    )
                    .await;
                if let Err(abort_err) = abort {
                    warn!("abort of upload {} failed: {}", upload_id, abort_err);
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, object_key: &str, upload_id: &str, data: &[u8]) -> Result<()> {
        let mut etags = Vec::new();
        for (i, part) in data.chunks(PART_SIZE).enumerate() {
            let number = i + 1;
            let response = self
                .request(
                    Method::PUT,
                    object_key,
                    &[
                        ("partNumber".into(), number.to_string()),
                        ("uploadId".into(), upload_id.to_string()),
                    ],
                    part.to_vec(),
                    UPLOAD_TIMEOUT,
                )
                .await?;
            let etag = response
                .headers()
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| EmbrError::Protocol(format!("part {} returned no ETag", number)))?
                .to_string();
            etags.push(etag);
        }
        self.request(
            Method::POST,
            object_key,
            &[("uploadId".into(), upload_id.to_string())],
            complete_body(&etags).into_bytes(),
            self.timeout,
        )
        .await?;
        Ok(())
    }

    async fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage> {
        let mut query = vec![
            ("list-type".to_string(), "2".to_string()),
            ("prefix".to_string(), prefix.to_string()),
        ];
        if let Some(token) = token {
            query.push(("continuation-token".to_string(), token.to_string()));
        }
        let body = self
            .request(Method::GET, "", &query, Vec::new(), self.timeout)
            .await?
            .text()
            .await?;
        parse_list_page(&body)
    }
}

/// `CompleteMultipartUpload` request body
fn complete_body(etags: &[String]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for (i, etag) in etags.iter().enumerate() {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            i + 1,
            etag
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

/// Text of the first `<tag>` element
fn xml_value(xml: &str, tag: &[u8]) -> Result<Option<String>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut inside = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => inside = e.local_name().as_ref() == tag,
            Ok(Event::Text(text)) if inside => {
                let value = text
                    .unescape()
                    .map_err(|e| EmbrError::Protocol(format!("XML: {}", e)))?;
                return Ok(Some(value.into_owned()));
            }
            Ok(Event::End(_)) => inside = false,
            Ok(Event::Eof) => return Ok(None),
            Err(e) => return Err(EmbrError::Protocol(format!("XML: {}", e))),
            _ => {}
        }
        buf.clear();
    }
}

/// Parse a ListObjectsV2 result
pub fn parse_list_page(xml: &str) -> Result<ListPage> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = ListPage::default();
    let mut in_contents = false;
    let mut current: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = e.local_name().as_ref().to_vec();
                if name == b"Contents" {
                    in_contents = true;
                }
                current = name;
            }
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_err(|e| EmbrError::Protocol(format!("XML: {}", e)))?
                    .into_owned();
                match current.as_slice() {
                    b"Key" if in_contents => page.keys.push(value),
                    b"IsTruncated" => truncated = value == "true",
                    b"NextContinuationToken" => page.next_token = Some(value),
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) => {
                if e.local_name().as_ref() == b"Contents" {
                    in_contents = false;
                }
                current.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(EmbrError::Protocol(format!("XML: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    if !truncated {
        page.next_token = None;
    }
    Ok(page)
}

#[async_trait]
impl Transport for S3Transport {
    fn scheme(&self) -> &'static str {
        "s3"
    }

    fn state(&self) -> &TransportState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut TransportState {
        &mut self.state
    }

    async fn connect(&mut self) -> Result<()> {
        if self.creds.is_none() {
            self.creds = Some(Credentials::load()?);
        }
        info!("using s3://{} in {}", self.bucket, self.region);
        Ok(())
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let object_key = self.object_key(key);
        if data.len() > MULTIPART_THRESHOLD {
            self.put_multipart(&object_key, data).await
        } else {
            self.put_single(&object_key, data).await
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .request(Method::GET, &self.object_key(key), &[], Vec::new(), self.timeout)
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = if self.prefix.is_empty() {
            prefix.trim_start_matches('/').to_string()
        } else {
            format!("{}/{}", self.prefix, prefix.trim_start_matches('/'))
        };
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.list_page(&full_prefix, token.as_deref()).await?;
            keys.extend(
                page.keys
                    .iter()
                    .filter_map(|k| self.relative_key(k))
                    .filter(|k| k.starts_with(prefix))
                    .map(str::to_string),
            );
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for key in keys {
            self.request(Method::DELETE, &self.object_key(key), &[], Vec::new(), self.timeout)
                .await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}
