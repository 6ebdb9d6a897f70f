use std::path::PathBuf;

use anyhow::{Context, Result};
use humansize::{format_size, DECIMAL};
use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::DaemonConfig;
use crate::media::VideoState;
use crate::sidecar;
use crate::store::{VideoStore, VideoUpsert};

/// Media file extensions to consider for re-encoding.
const MEDIA_EXTENSIONS: &[&str] = &["mkv", "mp4", "m4v", "avi", "mov", "webm"];

/// Result of scanning a file.
#[derive(Debug, Clone)]
pub enum ScanResult {
    /// File should be tracked (path, size in bytes).
    Candidate(PathBuf, u64),
    /// File should be skipped (path, reason).
    Skipped(PathBuf, String),
}

/// Counts from one library scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanSummary {
    pub candidates: usize,
    pub skipped: usize,
    pub new_records: usize,
}

/// Scan library roots for candidate media files and seed the store.
///
/// New files become `needs_analysis` records; files already tracked are
/// left alone (the analysis pipeline re-reads store state, not the
/// filesystem).
pub async fn scan_library(cfg: &DaemonConfig, store: &dyn VideoStore) -> Result<ScanSummary> {
    let mut summary = ScanSummary::default();
    let mut new_records: Vec<VideoUpsert> = Vec::new();
    let mut files_checked = 0usize;

    for root in &cfg.library_roots {
        if !root.exists() {
            warn!("Library root does not exist: {}", root.display());
            continue;
        }

        info!("Scanning directory: {}", root.display());

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading directory entry: {e}");
                    continue;
                }
            };

            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            files_checked += 1;
            if files_checked % 1000 == 0 {
                debug!("Checked {files_checked} files so far...");
            }

            let ext = path
                .extension()
                .and_then(|s| s.to_str())
                .map(|s| s.to_lowercase());
            match ext {
                Some(ext) if MEDIA_EXTENSIONS.contains(&ext.as_str()) => {}
                _ => continue,
            }

            let result = inspect_file(cfg, path.to_path_buf()).await?;
            match result {
                ScanResult::Skipped(path, reason) => {
                    summary.skipped += 1;
                    debug!("Skipped {}: {reason}", path.display());
                }
                ScanResult::Candidate(path, size) => {
                    summary.candidates += 1;
                    match store.find_by_path(&path) {
                        Ok(Some(_)) => {
                            debug!("Already tracked: {}", path.display());
                        }
                        Ok(None) => {
                            info!(
                                "Found candidate: {} ({})",
                                path.display(),
                                format_size(size, DECIMAL)
                            );
                            new_records.push(VideoUpsert {
                                path,
                                attrs: crate::media::VideoAttrs {
                                    size_bytes: Some(size),
                                    ..Default::default()
                                },
                                state: VideoState::NeedsAnalysis,
                            });
                        }
                        Err(e) => warn!("Store lookup failed for {}: {e}", path.display()),
                    }
                }
            }
        }
    }

    if !new_records.is_empty() {
        let inserted = store
            .upsert_batch(&new_records)
            .context("Failed to persist scan candidates")?;
        summary.new_records = inserted.len();
    }

    info!(
        "Scan complete: checked {} files, {} candidate(s), {} skipped, {} new record(s)",
        files_checked, summary.candidates, summary.skipped, summary.new_records
    );
    Ok(summary)
}

/// Apply the per-file checks: skip markers, minimum size, and the
/// stat-twice stability check for files still being copied in.
async fn inspect_file(cfg: &DaemonConfig, path: PathBuf) -> Result<ScanResult> {
    if sidecar::has_skip_marker(&path)? {
        return Ok(ScanResult::Skipped(
            path,
            "skip marker (.revidskip) exists".to_string(),
        ));
    }

    let metadata = std::fs::metadata(&path)
        .with_context(|| format!("Failed to stat file: {}", path.display()))?;
    let size = metadata.len();

    if size <= cfg.min_bytes {
        let reason = format!("file <= {} bytes", cfg.min_bytes);
        sidecar::write_why_txt(&path, &reason)?;
        return Ok(ScanResult::Skipped(path, reason));
    }

    if cfg.stability_delay_secs > 0 {
        debug!("Checking stability for: {} ({} bytes)", path.display(), size);
        tokio::time::sleep(tokio::time::Duration::from_secs(cfg.stability_delay_secs)).await;
        let size_after = std::fs::metadata(&path)
            .with_context(|| format!("Failed to re-stat file: {}", path.display()))?
            .len();
        if size_after != size {
            let reason = "file still copying".to_string();
            sidecar::write_why_txt(&path, &reason)?;
            return Ok(ScanResult::Skipped(path, reason));
        }
    }

    Ok(ScanResult::Candidate(path, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use std::fs;
    use std::path::Path;
    use uuid::Uuid;

    fn test_config(root: PathBuf) -> DaemonConfig {
        let mut cfg = DaemonConfig::default_config();
        cfg.library_roots = vec![root];
        cfg.min_bytes = 10;
        cfg.stability_delay_secs = 0;
        cfg
    }

    #[tokio::test]
    async fn scan_seeds_new_candidates_and_honors_markers() {
        let root = std::env::temp_dir().join(format!("revid-scan-test-{}", Uuid::new_v4()));
        fs::create_dir_all(&root).unwrap();

        fs::write(root.join("movie.mkv"), vec![0u8; 100]).unwrap();
        fs::write(root.join("tiny.mkv"), vec![0u8; 5]).unwrap();
        fs::write(root.join("notes.txt"), b"not media").unwrap();
        fs::write(root.join("marked.mkv"), vec![0u8; 100]).unwrap();
        sidecar::write_skip_marker(&root.join("marked.mkv")).unwrap();

        let store = InMemoryStore::new();
        let cfg = test_config(root.clone());
        let summary = scan_library(&cfg, &store).await.unwrap();

        assert_eq!(summary.candidates, 1);
        assert_eq!(summary.new_records, 1);
        assert_eq!(summary.skipped, 2);

        let record = store
            .find_by_path(&root.join("movie.mkv"))
            .unwrap()
            .unwrap();
        assert_eq!(record.state, VideoState::NeedsAnalysis);
        assert_eq!(record.attrs.size_bytes, Some(100));
        // Undersized file got a why.txt beside it.
        assert!(sidecar::why_txt_path(&root.join("tiny.mkv")).exists());

        fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn rescan_does_not_duplicate_tracked_files() {
        let root = std::env::temp_dir().join(format!("revid-scan-test-{}", Uuid::new_v4()));
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("movie.mkv"), vec![0u8; 100]).unwrap();

        let store = InMemoryStore::new();
        let cfg = test_config(root.clone());
        scan_library(&cfg, &store).await.unwrap();
        let second = scan_library(&cfg, &store).await.unwrap();

        assert_eq!(second.candidates, 1);
        assert_eq!(second.new_records, 0);
        assert_eq!(
            store
                .count_in_state(VideoState::NeedsAnalysis)
                .unwrap(),
            1
        );

        fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn missing_root_is_tolerated() {
        let store = InMemoryStore::new();
        let cfg = test_config(Path::new("/definitely/not/a/library").to_path_buf());
        let summary = scan_library(&cfg, &store).await.unwrap();
        assert_eq!(summary.candidates, 0);
    }
}
