//! Transport layer
//!
//! A [`Transport`] moves whole blobs to and from a remote keyed store. The
//! back-ends only implement `put`/`get`/`list`/`delete`; framing of batched
//! uploads (see [`frame`]) and cursor reads are provided on top of them.

pub mod file;
pub mod frame;
pub mod http;
pub mod s3;
pub mod sigv4;

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{EmbrError, Result};
use crate::hash::ObjectHash;
use crate::paths::{self, RemoteUrl};
use crate::remote::config::RemoteConfig;

pub use file::FileTransport;
pub use frame::Frame;
pub use http::HttpTransport;
pub use s3::S3Transport;

/// Mutable state shared by every back-end
#[derive(Debug, Clone, Default)]
pub struct TransportState {
    /// Key written by `send` and read by `receive`, without query string
    pub target_path: String,
    /// Byte offset from a `?resume=` query on the target
    pub resume_from: u64,
    /// The caller already encoded the bytes; batches go out uncompressed
    pub data_is_precompressed: bool,
    /// Batch count of the multi-batch upload in progress
    pending_batches: Option<usize>,
    read_buf: Option<Vec<u8>>,
    read_pos: usize,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn scheme(&self) -> &'static str;

    fn state(&self) -> &TransportState;

    fn state_mut(&mut self) -> &mut TransportState;

    async fn connect(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()> {
        let state = self.state_mut();
        state.read_buf = None;
        state.read_pos = 0;
        Ok(())
    }

    /// Store `data` under `key`, replacing any previous value
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Keys starting with `prefix`, relative to the remote root, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete `keys`, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<usize>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.list(key).await?.iter().any(|k| k == key))
    }

    /// Point `send`/`receive` at `target`; a `?resume=<bytes>` query sets the resume offset
    fn set_target(&mut self, target: &str) -> Result<()> {
        let (base, query) = paths::split_query(target);
        let resume_from = match paths::query_param(&query, "resume") {
            Some(v) => v
                .parse()
                .map_err(|_| EmbrError::invalid(format!("invalid resume offset '{}'", v)))?,
            None => 0,
        };
        let state = self.state_mut();
        state.target_path = paths::join_key(&[base]);
        state.resume_from = resume_from;
        state.pending_batches = None;
        state.read_buf = None;
        state.read_pos = 0;
        Ok(())
    }

    /// Send one blob or frame to the current target (or to `hash` when no target is set)
    async fn send(&mut self, data: &[u8], hash: Option<&ObjectHash>) -> Result<()> {
        let key = match (self.state().target_path.as_str(), hash) {
            ("", Some(hash)) => hash.to_hex(),
            ("", None) => return Err(EmbrError::invalid("send needs a target path or an object hash")),
            (target, _) => target.to_string(),
        };
        let Some(frame) = frame::decode(data)? else {
            return self.put(&key, data.to_vec()).await;
        };
        match frame {
            Frame::Batch {
                number,
                total,
                size,
                compressed,
                body,
            } => {
                let chunk = frame::batch_body(size, compressed, body)?;
                if total == 1 {
                    return self.put(&key, chunk).await;
                }
                debug!("staging batch {}/{} of {}", number, total, key);
                self.state_mut().pending_batches = Some(total);
                self.put(&frame::part_key(&key, number), chunk).await
            }
            Frame::Resume {
                number, total, from, ..
            } => {
                if from != self.state().resume_from {
                    return Err(EmbrError::Protocol(format!(
                        "resume frame starts at {} but target resumes at {}",
                        from,
                        self.state().resume_from
                    )));
                }
                for n in 1..number {
                    if !self.exists(&frame::part_key(&key, n)).await? {
                        return Err(EmbrError::Protocol(format!(
                            "cannot resume {} at batch {}: batch {} is missing",
                            key, number, n
                        )));
                    }
                }
                self.state_mut().pending_batches = Some(total);
                Ok(())
            }
            Frame::End => {
                let total = self
                    .state_mut()
                    .pending_batches
                    .take()
                    .ok_or_else(|| EmbrError::Protocol("END without batches".into()))?;
                let parts: Vec<String> = (1..=total).map(|n| frame::part_key(&key, n)).collect();
                let mut joined = Vec::new();
                for part in &parts {
                    joined.extend_from_slice(&self.get(part).await?);
                }
                self.put(&key, joined).await?;
                self.delete(&parts).await?;
                Ok(())
            }
        }
    }

    /// Read the next bytes of the current target into `buf`; 0 means end of data
    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.state().read_buf.is_none() {
            let key = self.state().target_path.clone();
            if key.is_empty() {
                return Err(EmbrError::invalid("receive needs a target path"));
            }
            let data = self.get(&key).await?;
            let state = self.state_mut();
            state.read_pos = (state.resume_from as usize).min(data.len());
            state.read_buf = Some(data);
        }
        let state = self.state_mut();
        let Some(data) = state.read_buf.as_ref() else {
            return Ok(0);
        };
        let n = buf.len().min(data.len() - state.read_pos);
        buf[..n].copy_from_slice(&data[state.read_pos..state.read_pos + n]);
        state.read_pos += n;
        Ok(n)
    }
}

/// Attempts and spacing for transient send failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// `send`, retrying transient failures per `policy`
pub async fn send_with_retry(
    transport: &mut dyn Transport,
    data: &[u8],
    hash: Option<&ObjectHash>,
    policy: RetryPolicy,
) -> Result<()> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match transport.send(data, hash).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!("retry {}/{}: {}", attempt, attempts, e);
                attempt += 1;
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Open the back-end named by a remote's URL
pub fn open(config: &RemoteConfig) -> Result<Box<dyn Transport>> {
    let transport: Box<dyn Transport> = match RemoteUrl::parse(&config.url)? {
        RemoteUrl::File { path } => Box::new(FileTransport::new(path)),
        RemoteUrl::Http { base } => Box::new(HttpTransport::new(base, config)?),
        RemoteUrl::S3 {
            bucket,
            prefix,
            region,
            endpoint,
        } => Box::new(S3Transport::new(bucket, prefix, region, endpoint, config)?),
    };
    debug!("opened {} transport for '{}'", transport.scheme(), config.name);
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn transport() -> (TempDir, FileTransport) {
        let temp_dir = TempDir::new().unwrap();
        let t = FileTransport::new(temp_dir.path().join("remote"));
        (temp_dir, t)
    }

    #[tokio::test]
    async fn test_send_plain_and_by_hash() {
        let (_tmp, mut t) = transport();
        t.connect().await.unwrap();
        let hash = ObjectHash::from_data(b"x");
        t.send(b"x", Some(&hash)).await.unwrap();
        assert_eq!(t.get(&hash.to_hex()).await.unwrap(), b"x");

        t.set_target("docs/a.json").unwrap();
        t.send(b"{}", None).await.unwrap();
        assert_eq!(t.get("docs/a.json").await.unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_send_without_target_or_hash_fails() {
        let (_tmp, mut t) = transport();
        t.connect().await.unwrap();
        assert!(t.send(b"x", None).await.is_err());
    }

    #[tokio::test]
    async fn test_batched_upload_is_reassembled() {
        let (_tmp, mut t) = transport();
        t.connect().await.unwrap();
        t.set_target("big.bin").unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        for (i, chunk) in data.chunks(40).enumerate() {
            let framed = frame::encode_batch(i + 1, 3, chunk, true).unwrap();
            t.send(&framed, None).await.unwrap();
        }
        assert!(!t.exists("big.bin").await.unwrap());
        t.send(frame::END_MARKER, None).await.unwrap();
        assert_eq!(t.get("big.bin").await.unwrap(), data);
        assert_eq!(t.list("").await.unwrap(), vec!["big.bin".to_string()]);
    }

    #[tokio::test]
    async fn test_resume_checks_staged_parts() {
        let (_tmp, mut t) = transport();
        t.connect().await.unwrap();
        t.set_target("big.bin").unwrap();
        t.send(&frame::encode_batch(1, 2, b"aaaa", false).unwrap(), None)
            .await
            .unwrap();

        // A later session picks up at batch 2
        t.set_target("big.bin?resume=4").unwrap();
        assert_eq!(t.state().resume_from, 4);
        t.send(&frame::encode_resume(2, 2, 4, 8), None).await.unwrap();
        t.send(&frame::encode_batch(2, 2, b"bbbb", false).unwrap(), None)
            .await
            .unwrap();
        t.send(frame::END_MARKER, None).await.unwrap();
        assert_eq!(t.get("big.bin").await.unwrap(), b"aaaabbbb");

        t.set_target("other.bin?resume=4").unwrap();
        assert!(t.send(&frame::encode_resume(2, 2, 4, 8), None).await.is_err());
        assert!(t.send(&frame::encode_resume(1, 2, 0, 8), None).await.is_err());
    }

    #[tokio::test]
    async fn test_end_without_batches_is_protocol_error() {
        let (_tmp, mut t) = transport();
        t.connect().await.unwrap();
        t.set_target("x").unwrap();
        let err = t.send(frame::END_MARKER, None).await.unwrap_err();
        assert!(matches!(err, EmbrError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_receive_in_chunks() {
        let (_tmp, mut t) = transport();
        t.connect().await.unwrap();
        t.put("blob", b"hello world".to_vec()).await.unwrap();
        t.set_target("blob?resume=6").unwrap();
        let mut buf = [0u8; 3];
        let mut out = Vec::new();
        loop {
            let n = t.receive(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"world");
    }

    #[test]
    fn test_bad_resume_offset() {
        let (_tmp, mut t) = transport();
        assert!(t.set_target("x?resume=abc").is_err());
    }
}
