//! Seam between the HTTP layer and whatever resolves media URLs.
//!
//! Implementations are synchronous and may block for tens of seconds; callers
//! are expected to run them on a blocking thread.

use std::{io, path::PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::credentials::CredentialBundle;
use crate::registry::{JobKind, TransferProgress};
use crate::rendition::Rendition;

/// Metadata of a single source item plus every rendition it offers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MediaMetadata {
    pub title: Option<String>,
    /// Seconds.
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    /// `YYYYMMDD`, as reported by the extractor.
    pub upload_date: Option<String>,
    pub view_count: Option<u64>,
    pub description: Option<String>,
    pub thumbnail: Option<String>,
    pub renditions: Vec<Rendition>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// yt-dlp format selector, e.g. `best[height<=720]`.
    pub format: Option<String>,
    pub credentials: Option<CredentialBundle>,
}

/// Everything a worker needs to fetch one job's bytes.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    pub kind: JobKind,
    pub format: Option<String>,
    pub credentials: Option<CredentialBundle>,
    pub output_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The extractor ran and reported a failure. The message is passed through
    /// untouched.
    #[error("{0}")]
    Extraction(String),
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("unreadable extractor output: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("extractor finished without reporting an output file")]
    MissingOutput,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub trait ExtractionProvider: Send + Sync {
    /// Resolves metadata and renditions without transferring any media.
    fn extract(&self, url: &str, options: &ExtractOptions) -> Result<MediaMetadata, ProviderError>;

    /// Downloads the media described by `request` and returns where it landed.
    ///
    /// `on_progress` receives `job_id` back on every call along with the
    /// latest counters, in the order the extractor reports them.
    fn transfer(
        &self,
        job_id: &str,
        request: &TransferRequest,
        on_progress: &mut dyn FnMut(&str, TransferProgress),
    ) -> Result<PathBuf, ProviderError>;
}
