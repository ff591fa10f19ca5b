//! Batched, resumable uploads and cursor downloads over a [`Transport`]

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::operations::{OperationTable, OperationType};
use crate::error::{EmbrError, Result};
use crate::hash::djb_checksum_hex;
use crate::transport::{self, frame, RetryPolicy, Transport};

pub const BATCH_SIZE: usize = 8 * 1024 * 1024;
const READ_CHUNK: usize = 64 * 1024;

/// Progress of one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub key: String,
    pub transferred: u64,
    pub total: u64,
}

pub type ProgressFn = dyn Fn(&ProgressEvent) + Send + Sync;

/// Upload settings shared by every transfer of a session
#[derive(Clone)]
pub struct TransferSettings {
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub progress: Option<Arc<ProgressFn>>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE,
            retry: RetryPolicy::default(),
            progress: None,
        }
    }
}

impl std::fmt::Debug for TransferSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSettings")
            .field("batch_size", &self.batch_size)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl TransferSettings {
    fn report(&self, key: &str, transferred: u64, total: u64) {
        if let Some(progress) = &self.progress {
            progress(&ProgressEvent {
                key: key.to_string(),
                transferred,
                total,
            });
        }
    }
}

/// Upload `data` to `key`, batching above the batch size.
///
/// Progress is recorded in `ops` and saved after every batch. With `resume`,
/// a matching unfinished record restarts the upload at its recorded offset.
pub async fn upload(
    transport: &mut dyn Transport,
    ops: &OperationTable,
    remote: &str,
    key: &str,
    data: &[u8],
    settings: &TransferSettings,
    resume: bool,
) -> Result<()> {
    let total = data.len();
    let batch_size = settings.batch_size.max(1);
    let checksum = djb_checksum_hex(data);
    let compress = !transport.state().data_is_precompressed;

    let resume_from = if resume {
        ops.resume_position(remote, key, total as u64, &checksum)
    } else {
        0
    };
    ops.start(OperationType::Push, remote, key, total as u64, &checksum);

    if total <= batch_size {
        transport.set_target(key)?;
        let framed = frame::encode_batch(1, 1, data, compress)?;
        transport::send_with_retry(transport, &framed, None, settings.retry).await?;
        ops.complete(OperationType::Push, remote, key);
        ops.save()?;
        settings.report(key, total as u64, total as u64);
        return Ok(());
    }

    let batches = frame::batch_count(total, batch_size);
    // Only whole batches count as sent
    let first = (resume_from as usize / batch_size).min(batches);
    if first > 0 {
        let offset = (first * batch_size) as u64;
        info!("resuming {} at byte {} (batch {}/{})", key, offset, first + 1, batches);
        transport.set_target(&format!("{}?resume={}", key, offset))?;
        let resume_frame = frame::encode_resume(first + 1, batches, offset, total as u64);
        transport::send_with_retry(transport, &resume_frame, None, settings.retry).await?;
    } else {
        transport.set_target(key)?;
    }

    for (i, chunk) in data.chunks(batch_size).enumerate().skip(first) {
        let framed = frame::encode_batch(i + 1, batches, chunk, compress)?;
        transport::send_with_retry(transport, &framed, None, settings.retry).await?;
        let transferred = ((i + 1) * batch_size).min(total) as u64;
        ops.update(OperationType::Push, remote, key, transferred);
        ops.save()?;
        debug!("sent batch {}/{} of {}", i + 1, batches, key);
        settings.report(key, transferred, total as u64);
    }
    transport::send_with_retry(transport, frame::END_MARKER, None, settings.retry).await?;

    // The remote copy was reassembled from parts; check it against the source
    let stored = transport.get(key).await?;
    let stored_checksum = djb_checksum_hex(&stored);
    if stored.len() != total || stored_checksum != checksum {
        return Err(EmbrError::HashMismatch {
            expected: checksum,
            actual: stored_checksum,
        });
    }
    ops.complete(OperationType::Push, remote, key);
    ops.save()?;
    Ok(())
}

/// Read `key` through the transport's receive cursor
pub async fn download(transport: &mut dyn Transport, ops: &OperationTable, remote: &str, key: &str) -> Result<Vec<u8>> {
    transport.set_target(key)?;
    let mut out = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = transport.receive(&mut buf).await?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    let record = ops.start(OperationType::Pull, remote, key, out.len() as u64, &djb_checksum_hex(&out));
    if record.completed {
        warn!("pull record for {} was already complete", key);
    }
    ops.complete(OperationType::Pull, remote, key);
    Ok(out)
}
