//! Human-readable renderings used in API responses and download headers.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

static UNSAFE_FILENAME_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9\s\-_.]").unwrap());

const MAX_FILENAME_CHARS: usize = 100;

/// `1:02:05` for an hour or more, `4:05` below that.
pub fn format_duration(seconds: Option<f64>) -> String {
    let total = match seconds {
        Some(s) if s > 0.0 => s.floor() as u64,
        _ => return "0:00".to_string(),
    };
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{}:{:02}", minutes, secs)
    }
}

pub fn format_views(views: Option<u64>) -> String {
    match views {
        None | Some(0) => "0".to_string(),
        Some(v) if v >= 1_000_000 => format!("{:.1}M", v as f64 / 1_000_000.0),
        Some(v) if v >= 1_000 => format!("{:.0}K", v as f64 / 1_000.0),
        Some(v) => v.to_string(),
    }
}

/// 1024-based size with at most two decimals, e.g. `1.5 MB`.
pub fn format_bytes(bytes: Option<u64>) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    let bytes = match bytes {
        Some(b) if b > 0 => b,
        Some(_) => return "0 Bytes".to_string(),
        None => return "Unknown".to_string(),
    };

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rendered = format!("{:.2}", value);
    let rendered = rendered.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", rendered, UNITS[unit])
}

/// yt-dlp reports upload dates as `YYYYMMDD`.
pub fn parse_upload_date(raw: &str) -> Option<NaiveDate> {
    if raw.len() != 8 {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y%m%d").ok()
}

pub fn format_upload_date(date: Option<NaiveDate>) -> String {
    date.map_or_else(|| "Unknown".to_string(), |d| d.format("%-d %B %Y").to_string())
}

pub fn sanitize_filename(name: &str) -> String {
    UNSAFE_FILENAME_CHARS
        .replace_all(name, "_")
        .chars()
        .take(MAX_FILENAME_CHARS)
        .collect()
}

pub fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("m4a") => "audio/mp4",
        Some("mp3") => "audio/mpeg",
        Some("opus") | Some("ogg") => "audio/ogg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(format_duration(None), "0:00");
        assert_eq!(format_duration(Some(75.9)), "1:15");
        assert_eq!(format_duration(Some(3725.0)), "1:02:05");
    }

    #[test]
    fn views() {
        assert_eq!(format_views(None), "0");
        assert_eq!(format_views(Some(999)), "999");
        assert_eq!(format_views(Some(12_345)), "12K");
        assert_eq!(format_views(Some(1_234_567)), "1.2M");
    }

    #[test]
    fn bytes() {
        assert_eq!(format_bytes(None), "Unknown");
        assert_eq!(format_bytes(Some(512)), "512 Bytes");
        assert_eq!(format_bytes(Some(1024)), "1 KB");
        assert_eq!(format_bytes(Some(1536)), "1.5 KB");
        assert_eq!(format_bytes(Some(5 * 1024 * 1024 * 1024 * 1024)), "5120 GB");
    }

    #[test]
    fn upload_dates() {
        let date = parse_upload_date("20240305");
        assert_eq!(format_upload_date(date), "5 March 2024");
        assert_eq!(parse_upload_date("2024-03-05"), None);
        assert_eq!(parse_upload_date("20241340"), None);
        assert_eq!(format_upload_date(None), "Unknown");
    }

    #[test]
    fn filenames_are_sanitized_and_truncated() {
        assert_eq!(sanitize_filename("Rick Astley - Never/Gonna.mp4"), "Rick Astley - Never_Gonna.mp4");
        assert_eq!(sanitize_filename("a\"b'c"), "a_b_c");
        assert_eq!(sanitize_filename(&"x".repeat(300)).len(), 100);
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for(Path::new("a.MP4")), "video/mp4");
        assert_eq!(content_type_for(Path::new("a.mp3")), "audio/mpeg");
        assert_eq!(content_type_for(Path::new("a")), "application/octet-stream");
    }
}
