use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a tracked video.
///
/// Each pipeline stage may only advance a record along its own legal
/// transition: analysis moves `NeedsAnalysis -> Analyzed`, quality search
/// moves `Analyzed -> CrfSearched`, encoding moves `CrfSearched -> Encoded`.
/// `Failed` is reachable from any stage and is only left by an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoState {
    NeedsAnalysis,
    Analyzed,
    CrfSearched,
    Encoded,
    Failed,
}

impl VideoState {
    /// Short name used in log lines and telemetry.
    pub fn as_str(self) -> &'static str {
        match self {
            VideoState::NeedsAnalysis => "needs_analysis",
            VideoState::Analyzed => "analyzed",
            VideoState::CrfSearched => "crf_searched",
            VideoState::Encoded => "encoded",
            VideoState::Failed => "failed",
        }
    }
}

/// Where a work item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Discovered by the library scanner.
    Library,
    /// Requested by an operator (command file or retry).
    Manual,
}

/// Technical attributes extracted from a media file.
///
/// All fields are optional: analysis fills what the metadata tool reports,
/// quality search adds `crf`/`predicted_ratio`, encoding updates the codec
/// and size after a successful re-encode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoAttrs {
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<f64>,
    pub bitrate: Option<u64>,
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub hdr: bool,
    pub crf: Option<f32>,
    pub predicted_ratio: Option<f64>,
}

impl VideoAttrs {
    /// Case-insensitive check against a target video codec name.
    pub fn video_codec_is(&self, target: &str) -> bool {
        self.video_codec
            .as_deref()
            .map(|c| c.eq_ignore_ascii_case(target))
            .unwrap_or(false)
    }

    /// Case-insensitive check against a target audio codec name.
    pub fn audio_codec_is(&self, target: &str) -> bool {
        self.audio_codec
            .as_deref()
            .map(|c| c.eq_ignore_ascii_case(target))
            .unwrap_or(false)
    }
}

/// A video record as persisted by the store, keyed uniquely by path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: Uuid,
    pub path: PathBuf,
    pub attrs: VideoAttrs,
    pub state: VideoState,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VideoRecord {
    /// Create a freshly discovered record in the analysis entry state.
    pub fn discovered(path: PathBuf, size_bytes: u64) -> Self {
        let now = Utc::now();
        VideoRecord {
            id: Uuid::new_v4(),
            path,
            attrs: VideoAttrs {
                size_bytes: Some(size_bytes),
                ..VideoAttrs::default()
            },
            state: VideoState::NeedsAnalysis,
            inserted_at: now,
            updated_at: now,
        }
    }
}

/// Ephemeral unit of work handed from the dispatcher to a batch.
///
/// Constructed from a store query, consumed once by a batch, never persisted.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub path: PathBuf,
    pub source_id: Uuid,
    pub source_type: SourceType,
    pub force: bool,
}

impl WorkItem {
    /// Build a work item from a persisted record.
    pub fn from_record(record: &VideoRecord) -> Self {
        WorkItem {
            path: record.path.clone(),
            source_id: record.id,
            source_type: SourceType::Library,
            force: false,
        }
    }
}
