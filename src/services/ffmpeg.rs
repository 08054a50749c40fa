//! ffprobe-based quality probe
//!
//! Runs `ffprobe` (command-line) on a file and reduces its JSON output to a
//! [`QualityRecord`]: the first video stream's height, then its bitrate
//! (stream, Matroska `BPS` tag, or container bitrate in that order).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::ProbeError;

/// Relative quality signal of one video file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityRecord {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Bits per second
    pub bitrate: Option<u64>,
}

impl QualityRecord {
    /// Compare by resolution class, then by bitrate within a class.
    ///
    /// The class comes from width and height together, so a cropped
    /// 1920x800 encode ranks with full-frame 1080p. Returns `None` when the
    /// records cannot be ordered (a height is unknown, or the classes match
    /// and a bitrate is unknown).
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        let (Some(a), Some(b)) = (self.resolution_class(), other.resolution_class()) else {
            return None;
        };
        match a.cmp(&b) {
            Ordering::Equal => match (self.bitrate, other.bitrate) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => None,
            },
            ordering => Some(ordering),
        }
    }

    /// Rank of the resolution bucket, higher is better
    pub fn resolution_class(&self) -> Option<u8> {
        self.height?;
        let rank = match self.resolution_label() {
            "2160p" => 4,
            "1080p" => 3,
            "720p" => 2,
            "480p" => 1,
            _ => 0,
        };
        Some(rank)
    }

    pub fn resolution_label(&self) -> &'static str {
        match (self.width, self.height) {
            (Some(w), Some(h)) => FfmpegService::detect_resolution(w, h),
            (None, Some(h)) => FfmpegService::detect_resolution(0, h),
            _ => "unknown",
        }
    }
}

impl fmt::Display for QualityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resolution_label())?;
        if let Some(bitrate) = self.bitrate {
            write!(f, " @ {} kbps", bitrate / 1000)?;
        }
        Ok(())
    }
}

/// Media probe collaborator
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<QualityRecord, ProbeError>;
}

/// FFprobe JSON output structures
mod ffprobe {
    use super::*;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub format: Option<Format>,
        pub streams: Option<Vec<Stream>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub format_name: Option<String>,
        pub bit_rate: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub bit_rate: Option<String>,
        pub disposition: Option<Disposition>,
        pub tags: Option<HashMap<String, String>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Disposition {
        pub attached_pic: Option<i32>,
    }
}

/// Reduce ffprobe JSON to a quality record
pub fn quality_from_probe_json(json: &[u8]) -> Result<QualityRecord, ProbeError> {
    let probe: ffprobe::FfprobeOutput = serde_json::from_slice(json)
        .map_err(|e| ProbeError::Failed(format!("unparseable ffprobe output: {}", e)))?;

    let streams = probe.streams.unwrap_or_default();
    // Cover art is reported as a video stream
    let video = streams
        .iter()
        .find(|s| {
            s.codec_type.as_deref() == Some("video")
                && s.disposition
                    .as_ref()
                    .and_then(|d| d.attached_pic)
                    .unwrap_or(0)
                    == 0
        })
        .ok_or(ProbeError::NoVideoStream)?;

    let stream_bitrate = video.bit_rate.as_deref().and_then(|b| b.parse::<u64>().ok());
    let tag_bitrate = video.tags.as_ref().and_then(|tags| {
        tags.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("BPS") || k.to_uppercase().starts_with("BPS-"))
            .and_then(|(_, v)| v.parse::<u64>().ok())
    });
    let container_bitrate = probe
        .format
        .as_ref()
        .and_then(|f| f.bit_rate.as_deref())
        .and_then(|b| b.parse::<u64>().ok());

    let record = QualityRecord {
        width: video.width,
        height: video.height,
        bitrate: stream_bitrate.or(tag_bitrate).or(container_bitrate),
    };

    debug!(
        codec = ?video.codec_name,
        container = ?probe.format.as_ref().and_then(|f| f.format_name.as_deref()),
        quality = %record,
        "Parsed ffprobe output"
    );

    Ok(record)
}

/// Probe service using the ffprobe executable
pub struct FfmpegService {
    /// Path to ffprobe executable
    ffprobe_path: String,
    timeout: Duration,
}

impl FfmpegService {
    pub fn new(ffprobe_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            timeout,
        }
    }

    /// Check if ffprobe is available
    pub async fn is_available(&self) -> bool {
        Command::new(&self.ffprobe_path)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Detect resolution category from video dimensions
    pub fn detect_resolution(width: u32, height: u32) -> &'static str {
        if height >= 2160 || width >= 3840 {
            "2160p"
        } else if height >= 1080 || width >= 1920 {
            "1080p"
        } else if height >= 720 || width >= 1280 {
            "720p"
        } else if height >= 480 || width >= 854 {
            "480p"
        } else {
            "SD"
        }
    }
}

#[async_trait]
impl MediaProbe for FfmpegService {
    async fn probe(&self, path: &Path) -> Result<QualityRecord, ProbeError> {
        debug!(path = %path.display(), "Probing media file with ffprobe");

        let run = Command::new(&self.ffprobe_path)
            .args(["-v", "error"])
            .args(["-print_format", "json"])
            .args(["-show_format", "-show_streams"])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
            .map_err(|e| ProbeError::Spawn(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(ProbeError::Failed(format!(
                "exit code {}: {}",
                exit_code,
                if stderr.is_empty() {
                    "no error output"
                } else {
                    stderr.trim()
                }
            )));
        }

        quality_from_probe_json(&output.stdout)
    }
}
