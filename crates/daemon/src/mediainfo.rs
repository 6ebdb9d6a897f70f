use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Limits for one round of batched tool invocations, sized by the
/// concurrency controller.
#[derive(Debug, Clone, Copy)]
pub struct ToolLimits {
    pub chunk_size: usize,
    pub concurrency: usize,
    pub timeout: Duration,
}

/// Normalized technical metadata for one media file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaMeta {
    pub container: Option<String>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<f64>,
    pub bitrate: Option<u64>,
    pub size_bytes: Option<u64>,
    pub bit_depth: Option<u8>,
    pub hdr: bool,
}

/// Outcome of metadata resolution for one path. Every requested path ends
/// up with exactly one of these before a batch proceeds to persistence.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataOutcome {
    Parsed(MediaMeta),
    Unavailable(String),
}

/// Result of a chunked bulk resolution. Paths in `unresolved` belong to
/// failed chunks and are the caller's to retry individually.
#[derive(Debug, Default)]
pub struct BulkResolution {
    pub resolved: HashMap<PathBuf, MetadataOutcome>,
    pub unresolved: Vec<PathBuf>,
}

/// mediainfo gives most numeric fields as strings but some builds emit
/// plain JSON numbers; accept both.
fn stringish<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(de)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// One track from mediainfo's JSON output.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaTrack {
    #[serde(rename = "@type")]
    pub kind: Option<String>,
    #[serde(rename = "Format")]
    pub format: Option<String>,
    #[serde(rename = "CompleteName")]
    pub complete_name: Option<String>,
    #[serde(rename = "FileSize", default, deserialize_with = "stringish")]
    pub file_size: Option<String>,
    #[serde(rename = "Duration", default, deserialize_with = "stringish")]
    pub duration: Option<String>,
    #[serde(rename = "OverallBitRate", default, deserialize_with = "stringish")]
    pub overall_bit_rate: Option<String>,
    #[serde(rename = "BitRate", default, deserialize_with = "stringish")]
    pub bit_rate: Option<String>,
    #[serde(rename = "Width", default, deserialize_with = "stringish")]
    pub width: Option<String>,
    #[serde(rename = "Height", default, deserialize_with = "stringish")]
    pub height: Option<String>,
    #[serde(rename = "BitDepth", default, deserialize_with = "stringish")]
    pub bit_depth: Option<String>,
    #[serde(rename = "transfer_characteristics")]
    pub transfer_characteristics: Option<String>,
    #[serde(rename = "colour_primaries")]
    pub colour_primaries: Option<String>,
}

impl MediaTrack {
    fn is_kind(&self, kind: &str) -> bool {
        self.kind
            .as_deref()
            .map(|k| k.eq_ignore_ascii_case(kind))
            .unwrap_or(false)
    }
}

/// One file's worth of parsed tool output, with the best-effort key used to
/// map it back to a requested path.
#[derive(Debug, Clone)]
pub struct ParsedMedia {
    pub reference: Option<String>,
    pub tracks: Vec<MediaTrack>,
}

impl ParsedMedia {
    /// The reference key: the explicit `@ref` field, or the General track's
    /// `CompleteName`.
    pub fn key(&self) -> Option<&str> {
        if let Some(reference) = self.reference.as_deref() {
            return Some(reference);
        }
        self.tracks
            .iter()
            .find(|t| t.is_kind("General"))
            .and_then(|t| t.complete_name.as_deref())
    }

    pub fn to_meta(&self) -> MediaMeta {
        let general = self.tracks.iter().find(|t| t.is_kind("General"));
        let video = self.tracks.iter().find(|t| t.is_kind("Video"));
        let audio = self.tracks.iter().find(|t| t.is_kind("Audio"));

        let bit_depth = video
            .and_then(|t| t.bit_depth.as_deref())
            .and_then(|s| s.parse::<u8>().ok());

        MediaMeta {
            container: general.and_then(|t| t.format.clone()),
            video_codec: video.and_then(|t| t.format.clone()),
            audio_codec: audio.and_then(|t| t.format.clone()),
            width: video
                .and_then(|t| t.width.as_deref())
                .and_then(|s| s.parse().ok()),
            height: video
                .and_then(|t| t.height.as_deref())
                .and_then(|s| s.parse().ok()),
            duration_secs: general
                .and_then(|t| t.duration.as_deref())
                .and_then(|s| s.parse().ok()),
            bitrate: general
                .and_then(|t| t.overall_bit_rate.as_deref().or(t.bit_rate.as_deref()))
                .and_then(|s| s.parse::<f64>().ok())
                .map(|b| b as u64),
            size_bytes: general
                .and_then(|t| t.file_size.as_deref())
                .and_then(|s| s.parse().ok()),
            bit_depth,
            hdr: is_hdr(video, bit_depth),
        }
    }
}

/// HDR content is flagged by PQ/HLG transfer characteristics, or BT.2020
/// primaries on a 10-bit stream.
fn is_hdr(video: Option<&MediaTrack>, bit_depth: Option<u8>) -> bool {
    let Some(video) = video else { return false };
    if let Some(transfer) = video.transfer_characteristics.as_deref() {
        let t = transfer.to_lowercase();
        if t.contains("pq") || t.contains("2084") || t.contains("hlg") {
            return true;
        }
    }
    if let Some(primaries) = video.colour_primaries.as_deref() {
        if primaries.to_lowercase().contains("2020") && bit_depth == Some(10) {
            return true;
        }
    }
    false
}

fn tracks_from_value(value: &Value) -> Result<Vec<MediaTrack>> {
    match value.get("track") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| serde_json::from_value(v.clone()).context("Failed to parse track"))
            .collect(),
        Some(other) => Ok(vec![
            serde_json::from_value(other.clone()).context("Failed to parse track")?
        ]),
        None => Ok(Vec::new()),
    }
}

fn media_from_value(value: &Value) -> Result<ParsedMedia> {
    let media = value.get("media").unwrap_or(value);
    let reference = media
        .get("@ref")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let tracks = tracks_from_value(media)?;
    if tracks.is_empty() {
        bail!("media entry has no tracks");
    }
    Ok(ParsedMedia { reference, tracks })
}

/// Parse mediainfo output, accepting the three shapes the tool produces:
/// a single object with a nested track list, an array of such objects, or a
/// minimal flat single-file object.
pub fn parse_output(raw: &str) -> Result<Vec<ParsedMedia>> {
    let value: Value =
        serde_json::from_str(raw).context("mediainfo output is not valid JSON")?;

    match &value {
        Value::Array(items) => items.iter().map(media_from_value).collect(),
        Value::Object(_) => match value.get("media") {
            Some(Value::Array(items)) => items.iter().map(media_from_value).collect(),
            _ => Ok(vec![media_from_value(&value)?]),
        },
        _ => bail!("unrecognized mediainfo output shape"),
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    mtime: SystemTime,
    size: u64,
    meta: MediaMeta,
}

/// Batched mediainfo adapter.
///
/// Resolves metadata for N paths with as few tool invocations as possible:
/// a bulk cache first, then one invocation per chunk, concurrently across
/// chunks. Chunk failures leave their paths unresolved; the caller falls
/// back to `resolve_single` per path. The cache is an optimization, never a
/// correctness dependency.
pub struct MediaInfoAdapter {
    bin: PathBuf,
    cache: Mutex<HashMap<PathBuf, CacheEntry>>,
}

impl MediaInfoAdapter {
    pub fn new(bin: PathBuf) -> Self {
        MediaInfoAdapter {
            bin,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn command_line(&self, paths: &[PathBuf]) -> String {
        command_line(&self.bin, paths)
    }

    fn cache_lookup(&self, path: &Path) -> Option<MediaMeta> {
        let (mtime, size) = file_signature(path)?;
        let cache = self.cache.lock().unwrap();
        let entry = cache.get(path)?;
        (entry.mtime == mtime && entry.size == size).then(|| entry.meta.clone())
    }

    fn cache_store(&self, path: &Path, meta: &MediaMeta) {
        if let Some((mtime, size)) = file_signature(path) {
            self.cache.lock().unwrap().insert(
                path.to_path_buf(),
                CacheEntry {
                    mtime,
                    size,
                    meta: meta.clone(),
                },
            );
        }
    }

    /// Resolve a chunk's worth of output back to its requested paths.
    ///
    /// Keys are matched exactly against path strings; a keyless entry in a
    /// single-path chunk is attributed to that path. Paths the tool said
    /// nothing about get an explicit `Unavailable`.
    fn map_chunk(
        chunk: &[PathBuf],
        parsed: Vec<ParsedMedia>,
    ) -> HashMap<PathBuf, MetadataOutcome> {
        let mut by_key: HashMap<String, ParsedMedia> = HashMap::new();
        let mut keyless: Vec<ParsedMedia> = Vec::new();
        for media in parsed {
            match media.key() {
                Some(key) => {
                    by_key.insert(key.to_string(), media);
                }
                None => keyless.push(media),
            }
        }

        let mut outcomes = HashMap::new();
        for path in chunk {
            let path_str = path.display().to_string();
            let outcome = match by_key.remove(&path_str) {
                Some(media) => MetadataOutcome::Parsed(media.to_meta()),
                None if chunk.len() == 1 && keyless.len() == 1 => {
                    MetadataOutcome::Parsed(keyless[0].to_meta())
                }
                None => MetadataOutcome::Unavailable(format!(
                    "mediainfo returned no entry for {path_str}"
                )),
            };
            outcomes.insert(path.clone(), outcome);
        }
        outcomes
    }

    /// Resolve metadata for all `paths` via cache plus chunked bulk
    /// invocations. Chunks containing a missing-on-disk path, or whose
    /// invocation fails or does not parse, are left unresolved.
    pub async fn resolve_chunked(&self, paths: &[PathBuf], limits: &ToolLimits) -> BulkResolution {
        let mut result = BulkResolution::default();

        let mut uncached: Vec<PathBuf> = Vec::new();
        for path in paths {
            match self.cache_lookup(path) {
                Some(meta) => {
                    result
                        .resolved
                        .insert(path.clone(), MetadataOutcome::Parsed(meta));
                }
                None => uncached.push(path.clone()),
            }
        }
        if !result.resolved.is_empty() {
            debug!("metadata cache hit for {} path(s)", result.resolved.len());
        }

        let chunk_size = limits.chunk_size.max(1);
        let semaphore = Arc::new(Semaphore::new(limits.concurrency.max(1)));
        let mut tasks: JoinSet<(Vec<PathBuf>, Option<Vec<ParsedMedia>>)> = JoinSet::new();

        for chunk in uncached.chunks(chunk_size) {
            let chunk: Vec<PathBuf> = chunk.to_vec();

            // A missing path poisons its whole chunk: leave the chunk for
            // per-item fallback rather than guessing the tool's behavior.
            if chunk.iter().any(|p| !p.exists()) {
                result.unresolved.extend(chunk);
                continue;
            }

            let bin = self.bin.clone();
            let semaphore = Arc::clone(&semaphore);
            let timeout = limits.timeout;
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (chunk, None),
                };
                match invoke_tool(&bin, &chunk, timeout).await {
                    Ok(raw) => match parse_output(&raw) {
                        Ok(parsed) => (chunk, Some(parsed)),
                        Err(err) => {
                            warn!("mediainfo chunk output unparsable: {err:#}");
                            (chunk, None)
                        }
                    },
                    Err(err) => {
                        warn!("mediainfo chunk invocation failed: {err:#}");
                        (chunk, None)
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((chunk, Some(parsed))) => {
                    for (path, outcome) in Self::map_chunk(&chunk, parsed) {
                        if let MetadataOutcome::Parsed(meta) = &outcome {
                            self.cache_store(&path, meta);
                        }
                        result.resolved.insert(path, outcome);
                    }
                }
                Ok((chunk, None)) => result.unresolved.extend(chunk),
                Err(err) => warn!("mediainfo chunk task failed to join: {err}"),
            }
        }

        result
    }

    /// Resolve one path with a dedicated invocation. Never errors: failures
    /// become an explicit `Unavailable` outcome carrying the command line.
    pub async fn resolve_single(&self, path: &Path, timeout: Duration) -> MetadataOutcome {
        if !path.exists() {
            return MetadataOutcome::Unavailable(format!(
                "file does not exist: {}",
                path.display()
            ));
        }
        if let Some(meta) = self.cache_lookup(path) {
            return MetadataOutcome::Parsed(meta);
        }

        let chunk = [path.to_path_buf()];
        match invoke_tool(&self.bin, &chunk, timeout).await {
            Ok(raw) => match parse_output(&raw) {
                Ok(parsed) => {
                    match Self::map_chunk(&chunk, parsed).remove(path) {
                        Some(outcome) => {
                            if let MetadataOutcome::Parsed(meta) = &outcome {
                                self.cache_store(path, meta);
                            }
                            outcome
                        }
                        // map_chunk covers every chunk path, so this arm is
                        // unreachable; keep it total anyway.
                        None => MetadataOutcome::Unavailable(format!(
                            "no outcome for {}",
                            path.display()
                        )),
                    }
                }
                Err(err) => MetadataOutcome::Unavailable(format!(
                    "{err:#} (command: {})",
                    self.command_line(&chunk)
                )),
            },
            Err(err) => MetadataOutcome::Unavailable(format!(
                "{err:#} (command: {})",
                self.command_line(&chunk)
            )),
        }
    }
}

fn file_signature(path: &Path) -> Option<(SystemTime, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime = meta.modified().ok()?;
    Some((mtime, meta.len()))
}

fn command_line(bin: &Path, paths: &[PathBuf]) -> String {
    let mut line = format!("{} --Output=JSON", bin.display());
    for path in paths {
        line.push(' ');
        line.push_str(&path.display().to_string());
    }
    line
}

/// Run the tool once over a set of paths and return raw stdout.
async fn invoke_tool(bin: &Path, paths: &[PathBuf], timeout: Duration) -> Result<String> {
    let mut cmd = Command::new(bin);
    cmd.arg("--Output=JSON");
    for path in paths {
        cmd.arg(path);
    }
    cmd.kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .with_context(|| format!("mediainfo timed out after {timeout:?}"))?
        .with_context(|| format!("Failed to execute: {}", command_line(bin, paths)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "mediainfo failed (exit code {}) for {} path(s):\n{}",
            output.status.code().unwrap_or(-1),
            paths.len(),
            stderr
        );
    }

    String::from_utf8(output.stdout).context("mediainfo output is not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE_OBJECT: &str = r#"{
        "creatingLibrary": {"name": "MediaInfoLib", "version": "24.01"},
        "media": {
            "@ref": "/media/show.mkv",
            "track": [
                {"@type": "General", "Format": "Matroska", "FileSize": "734003200",
                 "Duration": "1325.4", "OverallBitRate": "4430000",
                 "CompleteName": "/media/show.mkv"},
                {"@type": "Video", "Format": "HEVC", "Width": "1920", "Height": "1080",
                 "BitDepth": "10", "transfer_characteristics": "PQ",
                 "colour_primaries": "BT.2020"},
                {"@type": "Audio", "Format": "AAC"}
            ]
        }
    }"#;

    #[test]
    fn parses_single_object_shape() {
        let parsed = parse_output(SINGLE_OBJECT).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].key(), Some("/media/show.mkv"));

        let meta = parsed[0].to_meta();
        assert_eq!(meta.video_codec.as_deref(), Some("HEVC"));
        assert_eq!(meta.audio_codec.as_deref(), Some("AAC"));
        assert_eq!(meta.width, Some(1920));
        assert_eq!(meta.height, Some(1080));
        assert_eq!(meta.size_bytes, Some(734_003_200));
        assert_eq!(meta.duration_secs, Some(1325.4));
        assert!(meta.hdr);
    }

    #[test]
    fn parses_array_shape() {
        let raw = format!("[{SINGLE_OBJECT}, {SINGLE_OBJECT}]");
        let parsed = parse_output(&raw).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn parses_media_array_shape() {
        let raw = r#"{"media": [
            {"@ref": "/a.mkv", "track": [{"@type": "General", "Format": "Matroska"}]},
            {"@ref": "/b.mkv", "track": [{"@type": "General", "Format": "Matroska"}]}
        ]}"#;
        let parsed = parse_output(raw).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].key(), Some("/a.mkv"));
        assert_eq!(parsed[1].key(), Some("/b.mkv"));
    }

    #[test]
    fn parses_flat_single_file_shape() {
        let raw = r#"{"track": [
            {"@type": "General", "Format": "MPEG-4", "CompleteName": "/media/clip.mp4"},
            {"@type": "Video", "Format": "AVC", "Width": 1280, "Height": 720}
        ]}"#;
        let parsed = parse_output(raw).unwrap();
        assert_eq!(parsed.len(), 1);
        // No @ref: falls back to the General track's CompleteName.
        assert_eq!(parsed[0].key(), Some("/media/clip.mp4"));
        // Numeric JSON values are accepted where strings are typical.
        let meta = parsed[0].to_meta();
        assert_eq!(meta.width, Some(1280));
        assert!(!meta.hdr);
    }

    #[test]
    fn rejects_garbage_output() {
        assert!(parse_output("not json").is_err());
        assert!(parse_output("42").is_err());
        assert!(parse_output(r#"{"media": {"@ref": "/x"}}"#).is_err());
    }

    #[test]
    fn map_chunk_gives_every_path_an_outcome() {
        let chunk = vec![PathBuf::from("/a.mkv"), PathBuf::from("/b.mkv")];
        let parsed = vec![ParsedMedia {
            reference: Some("/a.mkv".into()),
            tracks: vec![MediaTrack {
                kind: Some("General".into()),
                ..Default::default()
            }],
        }];

        let outcomes = MediaInfoAdapter::map_chunk(&chunk, parsed);
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(
            outcomes[&PathBuf::from("/a.mkv")],
            MetadataOutcome::Parsed(_)
        ));
        assert!(matches!(
            outcomes[&PathBuf::from("/b.mkv")],
            MetadataOutcome::Unavailable(_)
        ));
    }

    #[test]
    fn keyless_entry_maps_onto_single_path_chunk() {
        let chunk = vec![PathBuf::from("/only.mkv")];
        let parsed = vec![ParsedMedia {
            reference: None,
            tracks: vec![MediaTrack {
                kind: Some("General".into()),
                ..Default::default()
            }],
        }];
        let outcomes = MediaInfoAdapter::map_chunk(&chunk, parsed);
        assert!(matches!(
            outcomes[&PathBuf::from("/only.mkv")],
            MetadataOutcome::Parsed(_)
        ));
    }

    #[tokio::test]
    async fn missing_files_leave_chunks_unresolved() {
        let adapter = Arc::new(MediaInfoAdapter::new(PathBuf::from("mediainfo")));
        let paths = vec![
            PathBuf::from("/nonexistent/one.mkv"),
            PathBuf::from("/nonexistent/two.mkv"),
        ];
        let limits = ToolLimits {
            chunk_size: 10,
            concurrency: 2,
            timeout: Duration::from_secs(5),
        };

        let result = adapter.resolve_chunked(&paths, &limits).await;
        assert!(result.resolved.is_empty());
        assert_eq!(result.unresolved.len(), 2);
    }

    #[tokio::test]
    async fn single_resolution_of_missing_file_is_explicitly_unavailable() {
        let adapter = MediaInfoAdapter::new(PathBuf::from("mediainfo"));
        let outcome = adapter
            .resolve_single(Path::new("/nonexistent/one.mkv"), Duration::from_secs(5))
            .await;
        match outcome {
            MetadataOutcome::Unavailable(reason) => {
                assert!(reason.contains("does not exist"))
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }
}
