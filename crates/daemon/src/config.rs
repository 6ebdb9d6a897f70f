use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Per-stage pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTuning {
    /// Maximum items released into the dispatch channel per work check.
    pub max_in_flight: usize,
    /// Dispatch rate ceiling in items per second.
    pub max_per_sec: u32,
    /// Batch flush timeout in milliseconds (flush on size or this, whichever
    /// first).
    pub flush_timeout_ms: u64,
    /// Lower bound for the self-tuned batch size.
    pub min_batch: usize,
    /// Upper bound for the self-tuned batch size.
    pub max_batch: usize,
    /// Interval between periodic work checks, in milliseconds.
    pub poll_interval_ms: u64,
}

impl StageTuning {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Bounds for the concurrency controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyTuning {
    /// Ceiling for the per-item worker pool.
    pub max_workers: usize,
    /// Ceiling for concurrent external-tool invocations.
    pub max_tool_invocations: usize,
    /// Per-item timeout under no load, in seconds.
    pub base_timeout_secs: u64,
    /// Per-item timeout ceiling, in seconds.
    pub max_timeout_secs: u64,
}

impl ConcurrencyTuning {
    pub fn base_timeout(&self) -> Duration {
        Duration::from_secs(self.base_timeout_secs)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs)
    }
}

/// Configuration for the re-encoding daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Library root directories to scan for media files.
    pub library_roots: Vec<PathBuf>,
    /// Minimum file size in bytes to consider for re-encoding.
    pub min_bytes: u64,
    /// Maximum output/input size ratio for accepting an encode (e.g. 0.90).
    pub max_size_ratio: f64,
    /// Directory holding persisted records, failure records and command files.
    pub state_dir: PathBuf,
    /// Directory for in-progress encode output.
    pub temp_dir: PathBuf,
    /// Interval in seconds between library scans.
    pub scan_interval_secs: u64,
    /// Delay in seconds for the stat-twice stable-file check during scans.
    pub stability_delay_secs: u64,
    /// Path to the mediainfo binary.
    pub mediainfo_bin: PathBuf,
    /// Number of paths per batched mediainfo invocation.
    pub mediainfo_chunk_size: usize,
    /// Path to the ab-av1 binary.
    pub ab_av1_bin: PathBuf,
    /// Target VMAF for quality search.
    pub min_vmaf: f32,
    /// SVT-AV1 preset passed to quality search and encode.
    pub preset: u8,
    /// Video codec goal; files already in this codec skip downstream stages.
    pub target_video_codec: String,
    /// Audio codec goal, checked together with the video codec.
    pub target_audio_codec: String,
    pub analysis: StageTuning,
    pub search: StageTuning,
    pub encode: StageTuning,
    pub concurrency: ConcurrencyTuning,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl DaemonConfig {
    /// Create a default configuration with sensible values.
    pub fn default_config() -> Self {
        Self {
            library_roots: vec![PathBuf::from("/media")],
            min_bytes: 100 * 1024 * 1024, // 100MB
            max_size_ratio: 0.90,
            state_dir: PathBuf::from("/var/lib/revid"),
            temp_dir: PathBuf::from("/tmp/revid"),
            scan_interval_secs: 300,
            stability_delay_secs: 10,
            mediainfo_bin: PathBuf::from("mediainfo"),
            mediainfo_chunk_size: 25,
            ab_av1_bin: PathBuf::from("ab-av1"),
            min_vmaf: 95.0,
            preset: 5,
            target_video_codec: "AV1".to_string(),
            target_audio_codec: "Opus".to_string(),
            analysis: StageTuning {
                max_in_flight: 100,
                max_per_sec: 50,
                flush_timeout_ms: 500,
                min_batch: 10,
                max_batch: 100,
                poll_interval_ms: 5_000,
            },
            search: StageTuning {
                max_in_flight: 4,
                max_per_sec: 5,
                flush_timeout_ms: 25,
                min_batch: 1,
                max_batch: 2,
                poll_interval_ms: 10_000,
            },
            encode: StageTuning {
                max_in_flight: 1,
                max_per_sec: 1,
                flush_timeout_ms: 25,
                min_batch: 1,
                max_batch: 1,
                poll_interval_ms: 10_000,
            },
            concurrency: ConcurrencyTuning {
                max_workers: 8,
                max_tool_invocations: 4,
                base_timeout_secs: 60,
                max_timeout_secs: 600,
            },
        }
    }

    /// Load configuration from a file, or return defaults if path is None or
    /// the file doesn't exist. JSON and TOML are accepted, chosen by
    /// extension.
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path).with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content).with_context(|| {
                        format!("Failed to parse TOML config: {}", config_path.display())
                    })?;
                } else {
                    config = serde_json::from_str(&content).with_context(|| {
                        format!("Failed to parse JSON config: {}", config_path.display())
                    })?;
                }
            }
        }

        Ok(config)
    }

    /// Directory where operator command files are dropped.
    pub fn commands_dir(&self) -> PathBuf {
        self.state_dir.join("commands")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_reasonable() {
        let cfg = DaemonConfig::default_config();
        assert!(cfg.analysis.max_batch >= cfg.analysis.min_batch);
        assert!(cfg.search.max_batch >= cfg.search.min_batch);
        assert!(cfg.encode.max_batch >= cfg.encode.min_batch);
        assert!(cfg.concurrency.max_workers >= 1);
        assert!(cfg.max_size_ratio > 0.0 && cfg.max_size_ratio <= 1.0);
    }

    #[test]
    fn load_missing_path_returns_defaults() {
        let cfg = DaemonConfig::load_config(Some(Path::new("/nonexistent/revid.toml"))).unwrap();
        assert_eq!(cfg.target_video_codec, "AV1");
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = DaemonConfig::default_config();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: DaemonConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.min_bytes, cfg.min_bytes);
        assert_eq!(back.analysis.max_batch, cfg.analysis.max_batch);
    }
}
