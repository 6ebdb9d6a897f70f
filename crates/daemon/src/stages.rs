use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};

use crate::encoder::{QualitySearcher, ToolError, VideoEncoder};
use crate::failures::ItemFailure;
use crate::media::{VideoAttrs, VideoState, WorkItem};
use crate::mediainfo::{MediaMeta, MetadataOutcome};
use crate::sidecar;

/// Tri-state result of preparing one work item.
#[derive(Debug, Clone)]
pub enum PrepOutcome {
    /// Attributes are ready to persist.
    Ready(VideoAttrs),
    /// Not an error, but nothing to persist this round.
    Skip(String),
    /// Categorized failure, recorded and excluded from persistence.
    Fail(ItemFailure),
}

/// One pipeline stage's contribution to the shared orchestration shape.
///
/// Every stage instance (analysis, quality search, encoding) provides its
/// store eligibility predicate, its per-item preparation, and its state
/// transitions; the dispatcher/batch machinery is identical across stages.
pub trait Stage: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// State a record must be in to be dispatched to this stage.
    fn entry_state(&self) -> VideoState;

    /// Normal post-stage state.
    fn next_state(&self) -> VideoState;

    /// State for records whose exit condition already holds, skipping the
    /// stages in between.
    fn skip_state(&self) -> VideoState {
        VideoState::Encoded
    }

    /// Whether the batch processor should resolve fresh tool metadata for
    /// this stage's batches.
    fn wants_fresh_metadata(&self) -> bool {
        false
    }

    /// Terminal-condition shortcut: a reason string when the attributes
    /// already satisfy this stage's exit condition.
    fn already_satisfied(&self, attrs: &VideoAttrs) -> Option<String>;

    /// Prepare one item: verify, derive attributes, run the stage's work.
    fn prepare(
        &self,
        item: &WorkItem,
        existing: &VideoAttrs,
        meta: Option<&MetadataOutcome>,
    ) -> impl Future<Output = PrepOutcome> + Send;
}

fn tool_failure(err: ToolError) -> ItemFailure {
    ItemFailure::Process {
        message: err.message,
        command: err.command,
        output: err.output,
    }
}

/// Analysis: resolve technical metadata and persist it.
pub struct AnalysisStage {
    target_video_codec: String,
    target_audio_codec: String,
}

impl AnalysisStage {
    pub fn new(target_video_codec: String, target_audio_codec: String) -> Self {
        AnalysisStage {
            target_video_codec,
            target_audio_codec,
        }
    }

    fn attrs_from_meta(&self, meta: &MediaMeta, existing: &VideoAttrs, path: &Path) -> VideoAttrs {
        let size_bytes = meta
            .size_bytes
            .or_else(|| std::fs::metadata(path).ok().map(|m| m.len()));
        VideoAttrs {
            video_codec: meta.video_codec.clone(),
            audio_codec: meta.audio_codec.clone(),
            width: meta.width,
            height: meta.height,
            duration_secs: meta.duration_secs,
            bitrate: meta.bitrate,
            size_bytes,
            hdr: meta.hdr,
            // Analysis never discards downstream results; a re-analysis of
            // an already searched record keeps its crf.
            crf: existing.crf,
            predicted_ratio: existing.predicted_ratio,
        }
    }
}

impl Stage for AnalysisStage {
    fn name(&self) -> &'static str {
        "analysis"
    }

    fn entry_state(&self) -> VideoState {
        VideoState::NeedsAnalysis
    }

    fn next_state(&self) -> VideoState {
        VideoState::Analyzed
    }

    fn wants_fresh_metadata(&self) -> bool {
        true
    }

    fn already_satisfied(&self, attrs: &VideoAttrs) -> Option<String> {
        if attrs.video_codec_is(&self.target_video_codec)
            && attrs.audio_codec_is(&self.target_audio_codec)
        {
            Some(format!(
                "video already {} and audio already {}",
                self.target_video_codec, self.target_audio_codec
            ))
        } else {
            None
        }
    }

    async fn prepare(
        &self,
        item: &WorkItem,
        existing: &VideoAttrs,
        meta: Option<&MetadataOutcome>,
    ) -> PrepOutcome {
        if !item.path.exists() {
            return PrepOutcome::Fail(ItemFailure::FileMissing(item.path.clone()));
        }

        let meta = match meta {
            Some(MetadataOutcome::Parsed(meta)) => meta,
            Some(MetadataOutcome::Unavailable(reason)) => {
                return PrepOutcome::Fail(ItemFailure::Metadata {
                    message: reason.clone(),
                    command: None,
                });
            }
            None => {
                return PrepOutcome::Fail(ItemFailure::Metadata {
                    message: format!("no metadata outcome for {}", item.path.display()),
                    command: None,
                });
            }
        };

        if meta.video_codec.is_none() {
            return PrepOutcome::Fail(ItemFailure::Validation(format!(
                "{} has no video track",
                item.path.display()
            )));
        }
        if meta.width.is_none() || meta.height.is_none() {
            return PrepOutcome::Fail(ItemFailure::Validation(format!(
                "{} has no usable resolution",
                item.path.display()
            )));
        }

        PrepOutcome::Ready(self.attrs_from_meta(meta, existing, &item.path))
    }
}

/// Quality search: pick a CRF for the configured quality floor.
pub struct CrfSearchStage<Q: QualitySearcher> {
    searcher: Arc<Q>,
    target_video_codec: String,
}

impl<Q: QualitySearcher> CrfSearchStage<Q> {
    pub fn new(searcher: Arc<Q>, target_video_codec: String) -> Self {
        CrfSearchStage {
            searcher,
            target_video_codec,
        }
    }
}

impl<Q: QualitySearcher> Stage for CrfSearchStage<Q> {
    fn name(&self) -> &'static str {
        "crf_search"
    }

    fn entry_state(&self) -> VideoState {
        VideoState::Analyzed
    }

    fn next_state(&self) -> VideoState {
        VideoState::CrfSearched
    }

    fn already_satisfied(&self, attrs: &VideoAttrs) -> Option<String> {
        attrs
            .video_codec_is(&self.target_video_codec)
            .then(|| format!("video already {}", self.target_video_codec))
    }

    async fn prepare(
        &self,
        item: &WorkItem,
        existing: &VideoAttrs,
        _meta: Option<&MetadataOutcome>,
    ) -> PrepOutcome {
        if !item.path.exists() {
            return PrepOutcome::Fail(ItemFailure::FileMissing(item.path.clone()));
        }

        match self.searcher.search(&item.path, existing).await {
            Ok(choice) => {
                let mut attrs = existing.clone();
                attrs.crf = Some(choice.crf);
                attrs.predicted_ratio = choice.predicted_ratio;
                PrepOutcome::Ready(attrs)
            }
            Err(err) => PrepOutcome::Fail(tool_failure(err)),
        }
    }
}

/// Encoding: re-encode at the searched CRF and replace the source if the
/// output earns its keep.
pub struct EncodeStage<E: VideoEncoder> {
    encoder: Arc<E>,
    target_video_codec: String,
    max_size_ratio: f64,
}

impl<E: VideoEncoder> EncodeStage<E> {
    pub fn new(encoder: Arc<E>, target_video_codec: String, max_size_ratio: f64) -> Self {
        EncodeStage {
            encoder,
            target_video_codec,
            max_size_ratio,
        }
    }
}

impl<E: VideoEncoder> Stage for EncodeStage<E> {
    fn name(&self) -> &'static str {
        "encode"
    }

    fn entry_state(&self) -> VideoState {
        VideoState::CrfSearched
    }

    fn next_state(&self) -> VideoState {
        VideoState::Encoded
    }

    fn already_satisfied(&self, attrs: &VideoAttrs) -> Option<String> {
        attrs
            .video_codec_is(&self.target_video_codec)
            .then(|| format!("video already {}", self.target_video_codec))
    }

    async fn prepare(
        &self,
        item: &WorkItem,
        existing: &VideoAttrs,
        _meta: Option<&MetadataOutcome>,
    ) -> PrepOutcome {
        if !item.path.exists() {
            return PrepOutcome::Fail(ItemFailure::FileMissing(item.path.clone()));
        }

        let source_bytes = existing
            .size_bytes
            .or_else(|| std::fs::metadata(&item.path).ok().map(|m| m.len()))
            .unwrap_or(0);

        let result = match self.encoder.encode(&item.path, existing).await {
            Ok(result) => result,
            Err(err) => return PrepOutcome::Fail(tool_failure(err)),
        };

        if source_bytes > 0 {
            let ratio = result.output_bytes as f64 / source_bytes as f64;
            if ratio > self.max_size_ratio {
                let reason = format!(
                    "encode output is {:.0}% of source, above the {:.0}% ceiling",
                    ratio * 100.0,
                    self.max_size_ratio * 100.0
                );
                if let Err(e) = std::fs::remove_file(&result.output_path) {
                    warn!(
                        "could not remove rejected output {}: {e}",
                        result.output_path.display()
                    );
                }
                if let Err(e) = sidecar::write_why_txt(&item.path, &reason) {
                    warn!("could not write why.txt for {}: {e}", item.path.display());
                }
                return PrepOutcome::Fail(ItemFailure::Validation(reason));
            }
        }

        if let Err(e) = std::fs::rename(&result.output_path, &item.path) {
            return PrepOutcome::Fail(ItemFailure::Unknown(format!(
                "could not replace {} with encoded output: {e}",
                item.path.display()
            )));
        }
        debug!("replaced {} with encoded output", item.path.display());

        let mut attrs = existing.clone();
        attrs.video_codec = Some(self.target_video_codec.clone());
        attrs.size_bytes = Some(result.output_bytes);
        attrs.bitrate = None;
        PrepOutcome::Ready(attrs)
    }
}
