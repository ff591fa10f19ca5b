//! Embr Core Library
//!
//! Version control for vector embeddings:
//! - Content-addressed object store (zstd payloads with a binary header)
//! - Per-set index, log, and model refs under `.embr/sets`
//! - Rollback, merge, and garbage collection
//! - Parquet interchange for remotes
//! - File, HTTP, and S3 transports with batched, resumable uploads
//! - Journaled push/pull transactions with crash recovery

pub mod codec;
pub mod error;
pub mod gc;
pub mod hash;
pub mod lock;
pub mod merge;
pub mod meta;
pub mod object;
pub mod parquet;
pub mod paths;
pub mod refs;
pub mod remote;
pub mod repository;
pub mod set;
pub mod store;
pub mod transport;

pub use codec::PayloadFormat;
pub use error::{EmbrError, ErrorKind, Result};
pub use gc::{Expiry, GcOptions, GcReport};
pub use hash::ObjectHash;
pub use merge::{MergeConflict, MergeReport, MergeStrategy};
pub use meta::Metadata;
pub use crate::parquet::{ParquetTransformer, Transformed, Transformer};
pub use paths::{RemoteUrl, RepoLayout, MARKER_DIR};
pub use refs::{Head, LogEntry, RefEntry, DEFAULT_SET};
pub use remote::{
    PullOptions, PullReport, PushOptions, PushReport, RemoteConfig, RemoteOptions, RemoteSession, Remotes,
};
pub use repository::{DiffReport, LogQuery, PathStatus, RemoveReport, Repository, StoreOutcome};
pub use set::{SetInfo, SetStatus};
pub use store::ObjectStore;
pub use transport::{FileTransport, HttpTransport, S3Transport, Transport};
