use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::display::parse_upload_date;
use crate::models::{RawFormat, RawVideoInfo};
use crate::runner::{clean_error_text, ToolRunner};
use crate::tool::{ToolError, ToolLocator};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("{0}")]
    ExtractionFailed(String),
    #[error("{0}")]
    ParseFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoEncoding {
    /// e.g. `720p`
    pub quality: String,
    pub height: u32,
    pub container: String,
    pub fps: f64,
    pub has_audio: bool,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioEncoding {
    /// e.g. `128kbps`
    pub quality: String,
    pub container: String,
    pub bitrate: f64,
    pub size_bytes: Option<u64>,
}

/// Canonical view of one video, fetched fresh for every request.
#[derive(Debug, Clone)]
pub struct VideoMetadata {
    pub title: String,
    pub channel: String,
    pub duration_secs: Option<f64>,
    pub view_count: Option<u64>,
    pub upload_date: Option<NaiveDate>,
    /// Ordered as the tool lists them; the last one is the largest.
    pub thumbnails: Vec<String>,
    pub video: Vec<VideoEncoding>,
    pub audio: Vec<AudioEncoding>,
}

impl VideoMetadata {
    pub fn thumbnail(&self) -> Option<&str> {
        self.thumbnails.last().map(String::as_str)
    }

    pub fn download_available(&self) -> bool {
        !self.video.is_empty() || !self.audio.is_empty()
    }
}

pub struct MetadataFetcher {
    locator: Arc<ToolLocator>,
    runner: Arc<dyn ToolRunner>,
    output_limit: usize,
    timeout: Duration,
}

impl MetadataFetcher {
    pub fn new(locator: Arc<ToolLocator>, runner: Arc<dyn ToolRunner>, output_limit: usize, timeout: Duration) -> Self {
        MetadataFetcher { locator, runner, output_limit, timeout }
    }

    /// Runs `yt-dlp --dump-json` for a single URL.
    pub async fn fetch(&self, url: &str) -> Result<VideoMetadata, MetadataError> {
        let tool = self.locator.ensure_available().await?;
        tracing::info!("Fetching video info for URL: {}", url);

        let args: Vec<String> = ["--dump-json", "--no-warnings", "--no-playlist", "--", url]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self
            .runner
            .capture(&tool.path, &args, self.output_limit, self.timeout)
            .await
            .map_err(|e| MetadataError::ExtractionFailed(e.to_string()))?;

        if !output.success() || !output.stderr.trim().is_empty() {
            tracing::error!("yt-dlp failed (status {:?}): {}", output.status, output.stderr.trim());
            let detail = clean_error_text(&output.stderr)
                .unwrap_or_else(|| "Failed to get video data from yt-dlp.".to_string());
            return Err(MetadataError::ExtractionFailed(detail));
        }
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Err(MetadataError::ExtractionFailed("yt-dlp returned empty data.".to_string()));
        }

        let meta = parse_metadata(&output.stdout)?;
        tracing::info!(
            "Fetched '{}': {} video and {} audio formats",
            meta.title,
            meta.video.len(),
            meta.audio.len()
        );
        Ok(meta)
    }
}

pub fn parse_metadata(stdout: &[u8]) -> Result<VideoMetadata, MetadataError> {
    let raw: RawVideoInfo = serde_json::from_slice(stdout).map_err(|e| {
        tracing::error!("Failed to parse yt-dlp JSON output: {}", e);
        MetadataError::ParseFailed(format!("Could not parse video information: {}", e))
    })?;
    Ok(normalize(raw))
}

pub fn normalize(raw: RawVideoInfo) -> VideoMetadata {
    let mut thumbnails: Vec<String> = raw.thumbnails.into_iter().filter_map(|t| t.url).collect();
    if thumbnails.is_empty() {
        thumbnails.extend(raw.thumbnail);
    }

    VideoMetadata {
        title: raw.title.unwrap_or_else(|| "Unknown Title".to_string()),
        channel: raw.uploader.or(raw.channel).unwrap_or_else(|| "Unknown".to_string()),
        duration_secs: raw.duration,
        view_count: raw.view_count,
        upload_date: raw.upload_date.as_deref().and_then(parse_upload_date),
        thumbnails,
        video: video_encodings(&raw.formats),
        audio: audio_encodings(&raw.formats),
    }
}

fn codec_present(codec: &Option<String>) -> bool {
    codec.as_deref().map_or(false, |c| !c.is_empty() && c != "none")
}

fn size_of(format: &RawFormat) -> Option<u64> {
    format.filesize.or(format.filesize_approx).filter(|s| *s > 0.0).map(|s| s as u64)
}

/// Video-bearing formats with a height and frame rate, one per quality label.
/// A later variant with audio replaces an earlier one without.
pub fn video_encodings(formats: &[RawFormat]) -> Vec<VideoEncoding> {
    let mut out: Vec<VideoEncoding> = Vec::new();

    for f in formats.iter().filter(|f| codec_present(&f.vcodec)) {
        let (Some(height), Some(fps)) = (f.height, f.fps.filter(|fps| *fps > 0.0)) else {
            continue;
        };
        let candidate = VideoEncoding {
            quality: format!("{}p", height),
            height,
            container: f.ext.clone(),
            fps,
            has_audio: codec_present(&f.acodec),
            size_bytes: size_of(f),
        };
        match out.iter_mut().find(|e| e.quality == candidate.quality) {
            Some(existing) if !existing.has_audio && candidate.has_audio => *existing = candidate,
            Some(_) => {}
            None => out.push(candidate),
        }
    }

    out.sort_by(|a, b| b.height.cmp(&a.height));
    out
}

/// Audio-only formats with a known bitrate, one per rounded kbps label.
pub fn audio_encodings(formats: &[RawFormat]) -> Vec<AudioEncoding> {
    let mut out: Vec<AudioEncoding> = Vec::new();

    for f in formats {
        if f.vcodec.as_deref() != Some("none") || !codec_present(&f.acodec) {
            continue;
        }
        let Some(abr) = f.abr.filter(|abr| *abr > 0.0) else {
            continue;
        };
        let quality = format!("{}kbps", abr.round() as u64);
        if out.iter().any(|e| e.quality == quality) {
            continue;
        }
        out.push(AudioEncoding {
            quality,
            container: f.ext.clone(),
            bitrate: abr,
            size_bytes: size_of(f),
        });
    }

    out.sort_by(|a, b| b.bitrate.total_cmp(&a.bitrate));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DeployMode};
    use crate::runner::fake::FakeRunner;
    use crate::runner::CapturedOutput;

    fn video(height: u32, fps: Option<f64>, acodec: &str) -> RawFormat {
        RawFormat {
            ext: "mp4".into(),
            vcodec: Some("avc1".into()),
            acodec: Some(acodec.into()),
            height: Some(height),
            fps,
            ..RawFormat::default()
        }
    }

    fn audio(abr: Option<f64>, ext: &str) -> RawFormat {
        RawFormat {
            ext: ext.into(),
            vcodec: Some("none".into()),
            acodec: Some("opus".into()),
            abr,
            filesize_approx: Some(1_000_000.0),
            ..RawFormat::default()
        }
    }

    #[test]
    fn dedupe_prefers_variant_with_audio() {
        let formats = vec![video(720, Some(30.0), "none"), video(720, Some(30.0), "mp4a"), video(480, Some(30.0), "mp4a")];
        let out = video_encodings(&formats);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].quality, "720p");
        assert!(out[0].has_audio);
        assert_eq!(out[1].quality, "480p");
    }

    #[test]
    fn dedupe_keeps_first_when_later_adds_nothing() {
        let mut first = video(1080, Some(60.0), "mp4a");
        first.filesize = Some(10.0);
        let mut second = video(1080, Some(30.0), "mp4a");
        second.filesize = Some(20.0);
        let out = video_encodings(&[first, second]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].fps, 60.0);
    }

    #[test]
    fn video_sorted_descending_and_incomplete_dropped() {
        let formats = vec![video(360, Some(30.0), "none"), video(1080, None, "none"), video(2160, Some(60.0), "none")];
        let labels: Vec<_> = video_encodings(&formats).into_iter().map(|e| e.quality).collect();
        assert_eq!(labels, vec!["2160p", "360p"]);
    }

    #[test]
    fn audio_filtered_deduped_and_sorted() {
        let formats = vec![
            audio(Some(48.2), "webm"),
            audio(Some(129.5), "m4a"),
            audio(None, "webm"),
            audio(Some(129.6), "webm"),
            video(720, Some(30.0), "mp4a"),
        ];
        let out = audio_encodings(&formats);
        let labels: Vec<_> = out.iter().map(|e| e.quality.as_str()).collect();
        assert_eq!(labels, vec!["130kbps", "48kbps"]);
        assert_eq!(out[0].container, "m4a");
        assert_eq!(out[0].size_bytes, Some(1_000_000));
    }

    #[test]
    fn normalize_fills_defaults_and_prefers_last_thumbnail() {
        let raw: RawVideoInfo = serde_json::from_str(
            r#"{"uploader":"Chan","upload_date":"20240305","duration":61,
                "thumbnails":[{"url":"small.jpg"},{"url":"big.jpg"}]}"#,
        )
        .unwrap();
        let meta = normalize(raw);
        assert_eq!(meta.title, "Unknown Title");
        assert_eq!(meta.channel, "Chan");
        assert_eq!(meta.thumbnail(), Some("big.jpg"));
        assert_eq!(meta.upload_date, NaiveDate::from_ymd_opt(2024, 3, 5));
        assert!(!meta.download_available());
    }

    #[test]
    fn malformed_output_is_parse_failure() {
        let err = parse_metadata(b"{not json").unwrap_err();
        assert!(matches!(err, MetadataError::ParseFailed(_)));
    }

    fn fetcher_with(dump: CapturedOutput) -> (tempfile::TempDir, Arc<FakeRunner>, MetadataFetcher) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(if cfg!(windows) { "yt-dlp.exe" } else { "yt-dlp" }), b"").unwrap();
        let config = Config {
            mode: DeployMode::Hosted,
            tool_directory: dir.path().to_string_lossy().to_string(),
            ..Config::default()
        };

        let runner = Arc::new(FakeRunner::default());
        {
            let mut captures = runner.captures.lock().unwrap();
            captures.push_back(Ok(CapturedOutput { status: Some(0), stdout: b"2024.08.06\n".to_vec(), stderr: String::new() }));
            captures.push_back(Ok(dump));
        }
        let locator = Arc::new(ToolLocator::new(&config, runner.clone()).unwrap());
        let fetcher = MetadataFetcher::new(locator, runner.clone(), 1024 * 1024, Duration::from_secs(5));
        (dir, runner, fetcher)
    }

    #[tokio::test]
    async fn fetch_maps_tool_output() {
        let json = r#"{"title":"Clip","formats":[{"ext":"mp4","vcodec":"avc1","acodec":"mp4a","height":720,"fps":30}]}"#;
        let (_dir, runner, fetcher) =
            fetcher_with(CapturedOutput { status: Some(0), stdout: json.as_bytes().to_vec(), stderr: String::new() });

        let meta = fetcher.fetch("https://youtu.be/abc").await.unwrap();
        assert_eq!(meta.title, "Clip");
        assert_eq!(meta.video[0].quality, "720p");

        let args = runner.last_call();
        assert_eq!(args.first().map(String::as_str), Some("--dump-json"));
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/abc"));
    }

    #[tokio::test]
    async fn fetch_surfaces_cleaned_tool_error() {
        let (_dir, _runner, fetcher) = fetcher_with(CapturedOutput {
            status: Some(1),
            stdout: Vec::new(),
            stderr: "ERROR: [youtube] abc: Video unavailable\n".to_string(),
        });
        match fetcher.fetch("https://youtu.be/abc").await {
            Err(MetadataError::ExtractionFailed(msg)) => assert_eq!(msg, "[youtube] abc: Video unavailable"),
            other => panic!("unexpected result: {:?}", other.map(|m| m.title)),
        }
    }

    #[tokio::test]
    async fn stderr_alone_is_failure() {
        let (_dir, _runner, fetcher) = fetcher_with(CapturedOutput {
            status: Some(0),
            stdout: b"{}".to_vec(),
            stderr: "ERROR: something odd".to_string(),
        });
        assert!(matches!(fetcher.fetch("https://x.test/v").await, Err(MetadataError::ExtractionFailed(_))));
    }

    #[tokio::test]
    async fn empty_output_is_extraction_failure() {
        let (_dir, _runner, fetcher) =
            fetcher_with(CapturedOutput { status: Some(0), stdout: b"\n".to_vec(), stderr: String::new() });
        match fetcher.fetch("https://x.test/v").await {
            Err(MetadataError::ExtractionFailed(msg)) => assert_eq!(msg, "yt-dlp returned empty data."),
            other => panic!("unexpected result: {:?}", other.map(|m| m.title)),
        }
    }
}
