use serde::{Deserialize, Serialize};

use crate::display::{format_bytes, format_duration, format_upload_date, format_views};
use crate::metadata::{AudioEncoding, VideoEncoding, VideoMetadata};
use crate::tool::ToolStatus;

// === yt-dlp Output Models ===

/// Represents the top-level JSON output from `yt-dlp --dump-json`.
/// Every field is optional; extractors disagree on what they fill in.
#[derive(Deserialize, Debug, Default)]
pub struct RawVideoInfo {
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub duration: Option<f64>,
    pub view_count: Option<u64>,
    pub upload_date: Option<String>,
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub thumbnails: Vec<RawThumbnail>,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
}

#[derive(Deserialize, Debug)]
pub struct RawThumbnail {
    pub url: Option<String>,
}

/// Represents a single format descriptor as yt-dlp reports it.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct RawFormat {
    #[serde(default)]
    pub ext: String,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub abr: Option<f64>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
}

// === API Request/Response Models ===

/// The JSON body for a `POST /video-info` request.
#[derive(Deserialize, Debug, Default)]
pub struct VideoInfoRequest {
    #[serde(default)]
    pub url: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VideoFormatResponse {
    pub quality: String,
    pub format: String,
    pub fps: f64,
    pub size: String,
    pub size_bytes: Option<u64>,
    pub has_audio: bool,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormatResponse {
    pub quality: String,
    pub format: String,
    pub size: String,
    pub size_bytes: Option<u64>,
    pub audio_bitrate: f64,
}

#[derive(Serialize, Debug)]
pub struct FormatsResponse {
    pub video: Vec<VideoFormatResponse>,
    pub audio: Vec<AudioFormatResponse>,
}

/// The response to `POST /video-info`.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfoResponse {
    pub title: String,
    pub thumbnail: String,
    pub duration: String,
    pub duration_seconds: Option<f64>,
    pub views: String,
    pub view_count: Option<u64>,
    pub upload_date: String,
    pub channel: String,
    pub formats: FormatsResponse,
    pub download_available: bool,
}

impl From<&VideoEncoding> for VideoFormatResponse {
    fn from(enc: &VideoEncoding) -> Self {
        VideoFormatResponse {
            quality: enc.quality.clone(),
            format: enc.container.clone(),
            fps: enc.fps,
            size: format_bytes(enc.size_bytes),
            size_bytes: enc.size_bytes,
            has_audio: enc.has_audio,
        }
    }
}

impl From<&AudioEncoding> for AudioFormatResponse {
    fn from(enc: &AudioEncoding) -> Self {
        AudioFormatResponse {
            quality: enc.quality.clone(),
            format: enc.container.clone(),
            size: format_bytes(enc.size_bytes),
            size_bytes: enc.size_bytes,
            audio_bitrate: enc.bitrate,
        }
    }
}

impl From<&VideoMetadata> for VideoInfoResponse {
    fn from(meta: &VideoMetadata) -> Self {
        VideoInfoResponse {
            title: meta.title.clone(),
            thumbnail: meta.thumbnail().unwrap_or_default().to_string(),
            duration: format_duration(meta.duration_secs),
            duration_seconds: meta.duration_secs,
            views: format_views(meta.view_count),
            view_count: meta.view_count,
            upload_date: format_upload_date(meta.upload_date),
            channel: meta.channel.clone(),
            formats: FormatsResponse {
                video: meta.video.iter().map(Into::into).collect(),
                audio: meta.audio.iter().map(Into::into).collect(),
            },
            download_available: meta.download_available(),
        }
    }
}

// === Download & Status Models ===

/// The query parameters for a `GET /download` request. All optional so a
/// missing one is answered with our own 400 instead of an extractor rejection.
#[derive(Deserialize, Debug, Default)]
pub struct DownloadParams {
    pub url: Option<String>,
    pub format: Option<String>,
    pub quality: Option<String>,
    pub mode: Option<String>,
}

/// Events pushed over the download event stream.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DownloadEvent {
    Progress { percent: f64 },
    Complete { filename: String, url: String },
    Error { message: String },
}

impl DownloadEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DownloadEvent::Progress { .. } => "progress",
            DownloadEvent::Complete { .. } => "complete",
            DownloadEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadEvent::Progress { .. })
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Spawned,
    Running,
    Completed,
    Failed,
}

/// Represents the real-time status of a single in-flight download.
#[derive(Serialize, Debug, Clone)]
pub struct JobSnapshot {
    pub id: String,
    pub url: String,
    pub kind: String,
    pub quality: String,
    pub state: JobState,
    pub progress: f64,
}

/// The response to `GET /status`.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(flatten)]
    pub tool: ToolStatus,
    pub active_downloads: Vec<JobSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let progress = serde_json::to_value(DownloadEvent::Progress { percent: 42.5 }).unwrap();
        assert_eq!(progress, serde_json::json!({ "type": "progress", "percent": 42.5 }));

        let complete = DownloadEvent::Complete { filename: "a.mp4".into(), url: "/get-file/a.mp4".into() };
        assert!(complete.is_terminal());
        assert_eq!(complete.kind(), "complete");
        assert_eq!(serde_json::to_value(&complete).unwrap()["type"], "complete");
    }

    #[test]
    fn raw_info_tolerates_sparse_output() {
        let info: RawVideoInfo = serde_json::from_str(r#"{"title":"x","formats":[{"format_id":"18"}]}"#).unwrap();
        assert_eq!(info.title.as_deref(), Some("x"));
        assert_eq!(info.formats.len(), 1);
        assert!(info.thumbnails.is_empty());
    }
}
