//! Download orchestration: one yt-dlp subprocess per request, its progress
//! relayed as typed events, and its files removed on every exit path.

use axum::body::Bytes;
use once_cell::sync::Lazy;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tokio_util::io::ReaderStream;
use url::Url;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::StreamMode;
use crate::display::sanitize_filename;
use crate::error::AppError;
use crate::models::{DownloadEvent, DownloadParams, JobSnapshot, JobState};
use crate::runner::{clean_error_text, ProcessEvent, SystemRunner, ToolProcess, ToolRunner};
use crate::tool::{ResolvedTool, ToolLocator};

static PROGRESS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[download\]\s+(?P<progress>[\d\.]+)%").unwrap());
static VIDEO_QUALITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?P<height>\d{2,4})p$").unwrap());
static AUDIO_QUALITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?P<kbps>\d{1,4})kbps$").unwrap());
static INTERMEDIATE_FILE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.f\d+\.\w+$").unwrap());

const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'\\');

const PARTIAL_SUFFIXES: [&str; 5] = [".part", ".ytdl", ".temp", ".tmp", ".download"];
const STDERR_TAIL_LINES: usize = 20;
const FILENAME_LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);
const FILENAME_LOOKUP_LIMIT: usize = 64 * 1024;

/// In-flight jobs by id, shared with `/status`.
pub type JobRegistry = Arc<Mutex<HashMap<String, JobSnapshot>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadKind {
    Video,
    Audio,
}

impl DownloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadKind::Video => "video",
            DownloadKind::Audio => "audio",
        }
    }

    fn preferred_ext(&self) -> &'static str {
        match self {
            DownloadKind::Video => "mp4",
            DownloadKind::Audio => "mp3",
        }
    }
}

/// A validated `GET /download` request.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub kind: DownloadKind,
    pub quality: String,
    pub mode: Option<StreamMode>,
}

impl DownloadRequest {
    pub fn from_params(params: &DownloadParams) -> Result<Self, AppError> {
        let (Some(url), Some(format), Some(quality)) = (
            non_empty(&params.url),
            non_empty(&params.format),
            non_empty(&params.quality),
        ) else {
            return Err(AppError::InvalidRequest("Missing required parameters: url, format, quality".to_string()));
        };

        validate_source_url(url)?;

        let kind = match format {
            "video" => DownloadKind::Video,
            "audio" => DownloadKind::Audio,
            other => return Err(AppError::InvalidRequest(format!("Unsupported format '{}', expected video or audio", other))),
        };

        let quality_ok = match kind {
            DownloadKind::Video => VIDEO_QUALITY.is_match(quality),
            DownloadKind::Audio => quality == "best" || AUDIO_QUALITY.is_match(quality),
        };
        if !quality_ok {
            return Err(AppError::InvalidRequest(format!("Invalid {} quality '{}'", kind.as_str(), quality)));
        }

        let mode = match non_empty(&params.mode) {
            None => None,
            Some(m) => Some(
                StreamMode::parse(m)
                    .ok_or_else(|| AppError::InvalidRequest(format!("Unsupported mode '{}', expected events or raw", m)))?,
            ),
        };

        Ok(DownloadRequest { url: url.to_string(), kind, quality: quality.to_string(), mode })
    }

    /// yt-dlp `-f` expression: the requested bound first, then progressively
    /// looser fallbacks so an unavailable quality still yields something.
    pub fn format_selector(&self) -> String {
        match self.kind {
            DownloadKind::Video => {
                let height = VIDEO_QUALITY
                    .captures(&self.quality)
                    .and_then(|c| c.name("height"))
                    .map_or("1080", |m| m.as_str());
                format!(
                    "bestvideo[height<={h}][ext=mp4]+bestaudio[ext=m4a]/bestvideo[height<={h}]+bestaudio/best[height<={h}][ext=mp4]/best[height<={h}]/best",
                    h = height
                )
            }
            DownloadKind::Audio => match AUDIO_QUALITY.captures(&self.quality).and_then(|c| c.name("kbps")) {
                Some(kbps) => format!("bestaudio[abr<={}]/bestaudio[ext=m4a]/bestaudio/best", kbps.as_str()),
                None => "bestaudio[ext=m4a]/bestaudio/best".to_string(),
            },
        }
    }

    fn job_args(&self, output_template: &Path, ffmpeg_location: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-f".into(),
            self.format_selector(),
            "--ffmpeg-location".into(),
            ffmpeg_location.into(),
            "-o".into(),
            output_template.to_string_lossy().to_string(),
            "--restrict-filenames".into(),
            "--no-playlist".into(),
            "--newline".into(),
            "--progress".into(),
            "--embed-metadata".into(),
        ];
        match self.kind {
            DownloadKind::Video => args.extend(["--merge-output-format".into(), "mp4".into()]),
            DownloadKind::Audio => args.extend([
                "--extract-audio".into(),
                "--audio-format".into(),
                "mp3".into(),
                "--embed-thumbnail".into(),
            ]),
        }
        args.extend(["--".into(), self.url.clone()]);
        args
    }

    fn raw_args(&self, ffmpeg_location: &str) -> Vec<String> {
        vec![
            "-f".into(),
            self.format_selector(),
            "--ffmpeg-location".into(),
            ffmpeg_location.into(),
            "-o".into(),
            "-".into(),
            "--no-playlist".into(),
            "--no-warnings".into(),
            "--".into(),
            self.url.clone(),
        ]
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn validate_source_url(raw: &str) -> Result<(), AppError> {
    let url = Url::parse(raw).map_err(|e| AppError::InvalidRequest(format!("Invalid URL '{}': {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().map_or(true, str::is_empty) {
        return Err(AppError::InvalidRequest(format!("Unsupported URL '{}'", raw)));
    }
    Ok(())
}

/// Percentage from a `[download]  42.3% of ...` line, clamped to 0-100.
pub fn parse_progress(line: &str) -> Option<f64> {
    PROGRESS_REGEX
        .captures(line)
        .and_then(|caps| caps.name("progress"))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|p| p.clamp(0.0, 100.0))
}

/// The error line worth showing: the last `ERROR:` line, else the last line.
fn last_error_line(tail: &VecDeque<String>) -> Option<String> {
    tail.iter()
        .rev()
        .find(|line| line.contains("ERROR:"))
        .or_else(|| tail.back())
        .and_then(|line| clean_error_text(line))
}

pub fn file_url(filename: &str) -> String {
    format!("/get-file/{}", utf8_percent_encode(filename, PATH_SEGMENT))
}

/// Every file in the temp directory that carries one job's unique id. Removed
/// on drop unless handed off to the retrieval endpoint.
pub struct JobFiles {
    dir: PathBuf,
    id: String,
    armed: bool,
}

impl JobFiles {
    pub fn new(dir: impl Into<PathBuf>, id: impl Into<String>) -> Self {
        JobFiles { dir: dir.into(), id: id.into(), armed: true }
    }

    /// Picks the finished output and renames it to a name `/get-file`
    /// accepts. On success the file belongs to the retrieval endpoint.
    pub async fn hand_off(&mut self, preferred_ext: &str) -> Option<PathBuf> {
        let (dir, id, ext) = (self.dir.clone(), self.id.clone(), preferred_ext.to_string());
        let output = match tokio::task::spawn_blocking(move || select_output(&dir, &id, &ext)).await {
            Ok(output) => output?,
            Err(e) => {
                tracing::warn!("Output scan for {} failed: {}", self.id, e);
                return None;
            }
        };

        let name = output.file_name()?.to_string_lossy().to_string();
        let target = self.dir.join(hand_off_name(&name));
        if target != output {
            if let Err(e) = tokio::fs::rename(&output, &target).await {
                tracing::warn!("Failed to rename {} for hand-off: {}", output.display(), e);
                return None;
            }
        }
        self.armed = false;
        Some(target)
    }

    pub async fn cleanup(&mut self) {
        self.armed = false;
        let (dir, id) = (self.dir.clone(), self.id.clone());
        if let Err(e) = tokio::task::spawn_blocking(move || remove_matching(&dir, &id)).await {
            tracing::warn!("Cleanup for {} failed: {}", self.id, e);
        }
    }
}

impl Drop for JobFiles {
    fn drop(&mut self) {
        if self.armed {
            remove_matching(&self.dir, &self.id);
        }
    }
}

fn matching(dir: &Path, id: &str) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name().to_string_lossy().contains(id))
        .map(|e| e.into_path())
        .collect()
}

/// The finished output: not a partial or per-stream intermediate, with the
/// expected extension preferred, then the largest file.
fn select_output(dir: &Path, id: &str, preferred_ext: &str) -> Option<PathBuf> {
    let mut candidates: Vec<(bool, u64, PathBuf)> = matching(dir, id)
        .into_iter()
        .filter(|path| {
            let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            !PARTIAL_SUFFIXES.iter().any(|s| name.ends_with(s))
                && !name.contains(".part-Frag")
                && !INTERMEDIATE_FILE.is_match(&name)
        })
        .map(|path| {
            let preferred = path.extension().map_or(false, |e| e == preferred_ext);
            let size = path.metadata().map(|m| m.len()).unwrap_or(0);
            (preferred, size, path)
        })
        .collect();
    candidates.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
    candidates.into_iter().next().map(|(_, _, path)| path)
}

fn remove_matching(dir: &Path, id: &str) {
    for path in matching(dir, id) {
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!("Removed {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}

/// `[A-Za-z0-9_-]` stem and extension, so the name survives `/get-file`
/// untouched. Runs of anything else collapse to one `_`.
fn hand_off_name(name: &str) -> String {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (name, ""),
    };

    let mut safe = String::with_capacity(stem.len());
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            safe.push(c);
        } else if !safe.ends_with('_') {
            safe.push('_');
        }
    }
    let ext: String = ext.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if ext.is_empty() {
        safe
    } else {
        format!("{}.{}", safe, ext)
    }
}

/// One subprocess and its files, driven one event at a time.
/// `Spawned → Running → {Completed, Failed}`; after the terminal event
/// `next_event` only returns `None`.
pub struct DownloadJob {
    id: String,
    process: Box<dyn ToolProcess>,
    files: JobFiles,
    kind: DownloadKind,
    state: JobState,
    progress: f64,
    stderr_tail: VecDeque<String>,
    timeout: Duration,
    deadline: tokio::time::Instant,
}

impl DownloadJob {
    pub fn new(id: String, process: Box<dyn ToolProcess>, files: JobFiles, kind: DownloadKind, timeout: Duration) -> Self {
        DownloadJob {
            id,
            process,
            files,
            kind,
            state: JobState::Spawned,
            progress: 0.0,
            stderr_tail: VecDeque::with_capacity(STDERR_TAIL_LINES),
            timeout,
            deadline: tokio::time::Instant::now() + timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, JobState::Completed | JobState::Failed)
    }

    pub async fn next_event(&mut self) -> Option<DownloadEvent> {
        loop {
            if self.is_terminal() {
                return None;
            }

            let event = match tokio::time::timeout_at(self.deadline, self.process.next_event()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Some(self.fail("yt-dlp ended without reporting an exit status".to_string()).await),
                Err(_) => {
                    tracing::warn!("Download {} exceeded {:?}, killing yt-dlp", self.id, self.timeout);
                    self.process.kill().await;
                    return Some(self.fail(timed_out(self.timeout)).await);
                }
            };

            match event {
                ProcessEvent::Stdout(line) => {
                    self.state = JobState::Running;
                    if let Some(percent) = parse_progress(&line) {
                        self.progress = percent;
                        return Some(DownloadEvent::Progress { percent });
                    }
                }
                ProcessEvent::Stderr(line) => {
                    self.state = JobState::Running;
                    tracing::debug!("yt-dlp stderr [{}]: {}", self.id, line);
                    if self.stderr_tail.len() == STDERR_TAIL_LINES {
                        self.stderr_tail.pop_front();
                    }
                    self.stderr_tail.push_back(line);
                }
                ProcessEvent::Exited(Some(0)) => return Some(self.complete().await),
                ProcessEvent::Exited(code) => {
                    let message = last_error_line(&self.stderr_tail).unwrap_or_else(|| match code {
                        Some(code) => format!("Download failed: yt-dlp exited with code {}", code),
                        None => "Download failed: yt-dlp was terminated".to_string(),
                    });
                    return Some(self.fail(message).await);
                }
            }
        }
    }

    async fn complete(&mut self) -> DownloadEvent {
        match self.files.hand_off(self.kind.preferred_ext()).await {
            Some(path) => {
                let filename = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
                tracing::info!("Download {} completed: {}", self.id, filename);
                self.state = JobState::Completed;
                self.progress = 100.0;
                DownloadEvent::Complete { url: file_url(&filename), filename }
            }
            None => self.fail("MissingOutput: yt-dlp exited successfully but produced no file".to_string()).await,
        }
    }

    async fn fail(&mut self, message: String) -> DownloadEvent {
        tracing::error!("Download {} failed: {}", self.id, message);
        self.state = JobState::Failed;
        self.files.cleanup().await;
        DownloadEvent::Error { message }
    }

    /// Kills the subprocess if it is still running and removes every file the
    /// job produced, including a completed output nobody received.
    pub async fn abort(&mut self) {
        if !self.is_terminal() {
            self.process.kill().await;
            self.state = JobState::Failed;
        }
        self.files.cleanup().await;
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// A raw-mode response: the tool's stdout, already known to be non-empty.
pub struct RawDownload {
    pub filename: String,
    pub body: ByteStream,
}

pub struct Orchestrator {
    locator: Arc<ToolLocator>,
    runner: Arc<dyn ToolRunner>,
    temp_dir: PathBuf,
    timeout: Duration,
    handoff_ttl: Duration,
    jobs: JobRegistry,
}

impl Orchestrator {
    pub fn new(
        locator: Arc<ToolLocator>,
        runner: Arc<dyn ToolRunner>,
        temp_dir: PathBuf,
        timeout: Duration,
        handoff_ttl: Duration,
    ) -> Self {
        Orchestrator {
            locator,
            runner,
            temp_dir,
            timeout,
            handoff_ttl,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn active_jobs(&self) -> Vec<JobSnapshot> {
        let map = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.values().cloned().collect()
    }

    /// Opens the event channel, then spawns the subprocess and relays its
    /// events until the terminal one or until the receiver goes away.
    pub fn start_download(self: &Arc<Self>, tool: ResolvedTool, request: DownloadRequest) -> ReceiverStream<DownloadEvent> {
        let (tx, rx) = mpsc::channel(1);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.spawn_job(&tool, &request).await {
                Ok(job) => this.drive(job, &request, tx).await,
                Err(message) => {
                    tracing::error!("Could not start download for {}: {}", request.url, message);
                    let _ = tx.send(DownloadEvent::Error { message }).await;
                }
            }
        });
        ReceiverStream::new(rx)
    }

    async fn spawn_job(&self, tool: &ResolvedTool, request: &DownloadRequest) -> Result<DownloadJob, String> {
        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|e| format!("Failed to prepare temporary directory: {}", e))?;

        let id = Uuid::new_v4().to_string();
        let template = self.temp_dir.join(format!("%(title).80B-{}.%(ext)s", id));
        let args = request.job_args(&template, self.locator.ffmpeg_location());
        tracing::info!("Starting {} download {} ({}) for {}", request.kind.as_str(), id, request.quality, request.url);

        let files = JobFiles::new(&self.temp_dir, &id);
        let process = self
            .runner
            .stream(&tool.path, &args)
            .await
            .map_err(|e| format!("Failed to start yt-dlp process: {}", e))?;
        Ok(DownloadJob::new(id, process, files, request.kind, self.timeout))
    }

    pub(crate) async fn drive(&self, mut job: DownloadJob, request: &DownloadRequest, tx: mpsc::Sender<DownloadEvent>) {
        self.track(&job, request);

        loop {
            tokio::select! {
                _ = tx.closed() => {
                    tracing::info!("Client disconnected from download {}, stopping yt-dlp", job.id());
                    job.abort().await;
                    break;
                }
                event = job.next_event() => {
                    let Some(event) = event else { break };
                    self.track(&job, request);

                    let terminal = event.is_terminal();
                    let handed_off = match &event {
                        DownloadEvent::Complete { filename, .. } => Some(self.temp_dir.join(filename)),
                        _ => None,
                    };
                    if tx.send(event).await.is_err() {
                        tracing::info!("Client went away before download {} was delivered", job.id());
                        job.abort().await;
                        break;
                    }
                    if let Some(path) = handed_off {
                        self.expire_after(path);
                    }
                    if terminal {
                        break;
                    }
                }
            }
        }

        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(job.id());
    }

    fn track(&self, job: &DownloadJob, request: &DownloadRequest) {
        let mut map = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.insert(
            job.id().to_string(),
            JobSnapshot {
                id: job.id().to_string(),
                url: request.url.clone(),
                kind: request.kind.as_str().to_string(),
                quality: request.quality.clone(),
                state: job.state(),
                progress: job.progress(),
            },
        );
    }

    /// Deletes a handed-off file that was never retrieved.
    fn expire_after(&self, path: PathBuf) {
        let ttl = self.handoff_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::info!("Removed unclaimed download {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove unclaimed download {}: {}", path.display(), e),
            }
        });
    }

    /// Raw mode: pipes yt-dlp's stdout into the response. Waits for the first
    /// chunk so a failure before any bytes can still become an error status.
    /// The whole run, first chunk included, is bounded by the download timeout.
    pub async fn start_raw(&self, tool: &ResolvedTool, request: &DownloadRequest) -> Result<RawDownload, AppError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let filename = self.predicted_filename(tool, request).await;
        let args = request.raw_args(self.locator.ffmpeg_location());
        tracing::info!("Starting raw {} stream ({}) for {}", request.kind.as_str(), request.quality, request.url);

        let child = SystemRunner.spawn_piped(&tool.path, &args)?;
        let (tx, mut rx) = mpsc::channel::<io::Result<Bytes>>(1);
        tokio::spawn(pump_raw(child, tx, deadline, self.timeout));

        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(Ok(first))) => {
                let rest = ReceiverStream::new(rx);
                let body = tokio_stream::once(Ok(first)).chain(rest);
                Ok(RawDownload { filename, body: Box::pin(body) })
            }
            Ok(Some(Err(e))) => Err(AppError::DownloadFailed(e.to_string())),
            Ok(None) => Err(AppError::DownloadFailed("yt-dlp produced no output".to_string())),
            // dropping `rx` makes the pump kill the process
            Err(_) => Err(AppError::DownloadFailed(timed_out(self.timeout))),
        }
    }

    /// Suggested download name from `--get-filename`, with a generic fallback.
    async fn predicted_filename(&self, tool: &ResolvedTool, request: &DownloadRequest) -> String {
        let fallback = format!("download.{}", request.kind.preferred_ext());
        let args: Vec<String> = vec![
            "--get-filename".into(),
            "-f".into(),
            request.format_selector(),
            "-o".into(),
            "%(title)s.%(ext)s".into(),
            "--no-warnings".into(),
            "--no-playlist".into(),
            "--".into(),
            request.url.clone(),
        ];
        match self.runner.capture(&tool.path, &args, FILENAME_LOOKUP_LIMIT, FILENAME_LOOKUP_TIMEOUT).await {
            Ok(out) if out.success() && out.stderr.trim().is_empty() => {
                let name = String::from_utf8_lossy(&out.stdout);
                let name = sanitize_filename(name.lines().next().unwrap_or_default().trim());
                if name.is_empty() {
                    fallback
                } else {
                    name
                }
            }
            Ok(out) => {
                tracing::warn!("Couldn't get filename: {}", out.stderr.trim());
                fallback
            }
            Err(e) => {
                tracing::warn!("Couldn't get filename: {}", e);
                fallback
            }
        }
    }
}

fn timed_out(timeout: Duration) -> String {
    format!("Download timed out after {} seconds", timeout.as_secs())
}

/// Moves stdout chunks into `tx` until EOF, the deadline, or the receiver
/// going away. The child is killed on every path except a clean exit.
async fn pump_raw(mut child: Child, tx: mpsc::Sender<io::Result<Bytes>>, deadline: tokio::time::Instant, timeout: Duration) {
    let (Some(stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.kill().await;
        let _ = tx.send(Err(io::Error::new(io::ErrorKind::Other, "yt-dlp output was not captured"))).await;
        return;
    };

    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        let text = String::from_utf8_lossy(&buf).to_string();
        if !text.trim().is_empty() {
            tracing::debug!("yt-dlp stderr: {}", text.trim());
        }
        text
    });

    let mut reader = ReaderStream::new(stdout);
    loop {
        tokio::select! {
            _ = tx.closed() => {
                tracing::info!("Client disconnected from raw stream, stopping yt-dlp");
                let _ = child.kill().await;
                return;
            }
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!("Raw stream exceeded {:?}, killing yt-dlp", timeout);
                let _ = child.kill().await;
                let _ = tx.send(Err(io::Error::new(io::ErrorKind::TimedOut, timed_out(timeout)))).await;
                return;
            }
            chunk = reader.next() => match chunk {
                Some(Ok(bytes)) => {
                    if tx.send(Ok(bytes)).await.is_err() {
                        let _ = child.kill().await;
                        return;
                    }
                }
                Some(Err(e)) => {
                    let _ = child.kill().await;
                    let _ = tx.send(Err(e)).await;
                    return;
                }
                None => break,
            }
        }
    }

    let status = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!("yt-dlp closed stdout but kept running past {:?}, killing it", timeout);
            let _ = child.kill().await;
            let _ = tx.send(Err(io::Error::new(io::ErrorKind::TimedOut, timed_out(timeout)))).await;
            return;
        }
    };
    match status {
        Ok(status) if status.success() => tracing::info!("Raw stream finished"),
        other => {
            let stderr = tokio::time::timeout_at(deadline, stderr_task)
                .await
                .ok()
                .and_then(|joined| joined.ok())
                .unwrap_or_default();
            let message = clean_error_text(&stderr)
                .unwrap_or_else(|| format!("yt-dlp exited with {:?}", other.map(|s| s.code())));
            tracing::error!("Raw stream failed: {}", message);
            let _ = tx.send(Err(io::Error::new(io::ErrorKind::Other, message))).await;
        }
    }
}
