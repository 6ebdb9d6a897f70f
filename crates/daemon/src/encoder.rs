use std::future::Future;
use std::path::{Path, PathBuf};

use humansize::{format_size, DECIMAL};
use log::{debug, info};
use thiserror::Error;
use tokio::process::Command;

use crate::media::VideoAttrs;

/// Failure from an external quality-search or encode tool, carrying the
/// exact command line and captured output for the failure record.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ToolError {
    pub message: String,
    pub command: Option<String>,
    pub output: Option<String>,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        ToolError {
            message: message.into(),
            command: None,
            output: None,
        }
    }

    pub fn for_command(message: impl Into<String>, command: String, output: Option<String>) -> Self {
        ToolError {
            message: message.into(),
            command: Some(command),
            output,
        }
    }
}

/// Result of a quality search: the chosen CRF and, when the tool reports
/// it, the predicted output/input size ratio.
#[derive(Debug, Clone, PartialEq)]
pub struct CrfChoice {
    pub crf: f32,
    pub predicted_ratio: Option<f64>,
}

/// Result of an encode: where the candidate output landed and its size.
/// The caller decides whether to accept it and replace the source.
#[derive(Debug, Clone)]
pub struct EncodeResult {
    pub output_path: PathBuf,
    pub output_bytes: u64,
}

/// Quality/size tradeoff search collaborator.
pub trait QualitySearcher: Send + Sync + 'static {
    fn search(
        &self,
        path: &Path,
        attrs: &VideoAttrs,
    ) -> impl Future<Output = Result<CrfChoice, ToolError>> + Send;
}

/// Re-encode collaborator. Writes a candidate output file; never replaces
/// the source itself.
pub trait VideoEncoder: Send + Sync + 'static {
    fn encode(
        &self,
        path: &Path,
        attrs: &VideoAttrs,
    ) -> impl Future<Output = Result<EncodeResult, ToolError>> + Send;
}

/// ab-av1 backed implementation of both collaborators.
pub struct AbAv1 {
    bin: PathBuf,
    temp_dir: PathBuf,
    min_vmaf: f32,
    preset: u8,
}

impl AbAv1 {
    pub fn new(bin: PathBuf, temp_dir: PathBuf, min_vmaf: f32, preset: u8) -> Self {
        AbAv1 {
            bin,
            temp_dir,
            min_vmaf,
            preset,
        }
    }

    fn command_line(&self, args: &[String]) -> String {
        format!("{} {}", self.bin.display(), args.join(" "))
    }

    async fn run(&self, args: Vec<String>) -> Result<String, ToolError> {
        let line = self.command_line(&args);
        debug!("running: {line}");

        let output = Command::new(&self.bin)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ToolError::for_command(format!("failed to execute ab-av1: {e}"), line.clone(), None))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(ToolError::for_command(
                format!(
                    "ab-av1 failed (exit code {})",
                    output.status.code().unwrap_or(-1)
                ),
                line,
                Some(format!("STDOUT: {stdout}\nSTDERR: {stderr}")),
            ));
        }
        Ok(stdout)
    }
}

/// Pull the chosen CRF and predicted size percentage out of crf-search
/// output, e.g. `crf 28 VMAF 95.14 predicted video stream size 727 MiB (24%)`.
pub fn parse_crf_search(stdout: &str) -> Option<CrfChoice> {
    for line in stdout.lines().rev() {
        let mut crf: Option<f32> = None;
        let mut tokens = line.split_whitespace().peekable();
        while let Some(token) = tokens.next() {
            if token.eq_ignore_ascii_case("crf") {
                if let Some(value) = tokens.peek().and_then(|s| s.parse::<f32>().ok()) {
                    crf = Some(value);
                }
            }
        }
        let Some(crf) = crf else { continue };

        let predicted_ratio = line.rfind('(').and_then(|start| {
            let rest = &line[start + 1..];
            let end = rest.find("%)")?;
            rest[..end].trim().parse::<f64>().ok().map(|pct| pct / 100.0)
        });

        return Some(CrfChoice {
            crf,
            predicted_ratio,
        });
    }
    None
}

impl QualitySearcher for AbAv1 {
    async fn search(&self, path: &Path, _attrs: &VideoAttrs) -> Result<CrfChoice, ToolError> {
        let args = vec![
            "crf-search".to_string(),
            "-i".to_string(),
            path.display().to_string(),
            "--min-vmaf".to_string(),
            self.min_vmaf.to_string(),
            "--preset".to_string(),
            self.preset.to_string(),
            "--temp-dir".to_string(),
            self.temp_dir.display().to_string(),
        ];
        let line = self.command_line(&args);
        let stdout = self.run(args).await?;

        match parse_crf_search(&stdout) {
            Some(choice) => {
                info!(
                    "crf-search for {}: crf {} (predicted ratio {:?})",
                    path.display(),
                    choice.crf,
                    choice.predicted_ratio
                );
                Ok(choice)
            }
            None => Err(ToolError::for_command(
                "ab-av1 crf-search output had no crf result",
                line,
                Some(stdout),
            )),
        }
    }
}

impl VideoEncoder for AbAv1 {
    async fn encode(&self, path: &Path, attrs: &VideoAttrs) -> Result<EncodeResult, ToolError> {
        let crf = attrs
            .crf
            .ok_or_else(|| ToolError::new("record has no searched crf"))?;

        // Candidate output goes next to the source so the accept/replace
        // rename stays on one filesystem.
        let output_path = path.with_extension("revid.tmp.mkv");

        let args = vec![
            "encode".to_string(),
            "-i".to_string(),
            path.display().to_string(),
            "--crf".to_string(),
            crf.to_string(),
            "--preset".to_string(),
            self.preset.to_string(),
            "--temp-dir".to_string(),
            self.temp_dir.display().to_string(),
            "-o".to_string(),
            output_path.display().to_string(),
        ];
        let line = self.command_line(&args);
        self.run(args).await?;

        let output_bytes = std::fs::metadata(&output_path)
            .map_err(|e| {
                ToolError::for_command(
                    format!("encode produced no readable output: {e}"),
                    line,
                    None,
                )
            })?
            .len();

        info!(
            "encoded {} -> {} ({})",
            path.display(),
            output_path.display(),
            format_size(output_bytes, DECIMAL)
        );

        Ok(EncodeResult {
            output_path,
            output_bytes,
        })
    }
}
