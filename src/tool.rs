use reqwest::{redirect, Client};
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::{Config, DeployMode};
use crate::runner::ToolRunner;

#[cfg(windows)]
const BINARY_NAME: &str = "yt-dlp.exe";
#[cfg(not(windows))]
const BINARY_NAME: &str = "yt-dlp";

const VERSION_TIMEOUT: Duration = Duration::from_secs(15);
const VERSION_OUTPUT_LIMIT: usize = 4096;
const FETCH_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("yt-dlp was not found on PATH")]
    NotFound,
    #[error("yt-dlp at {path} failed its version check: {reason}")]
    Broken { path: PathBuf, reason: String },
    #[error("failed to download yt-dlp from {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("I/O error while installing yt-dlp: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ResolvedTool {
    pub path: PathBuf,
    pub version: String,
}

/// Body of `GET /status` (minus the job list) and of `tool status`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub installed: bool,
    pub path: Option<String>,
    pub version: Option<String>,
    pub mode: DeployMode,
}

/// Finds, verifies and, in hosted mode, installs the yt-dlp binary.
pub struct ToolLocator {
    mode: DeployMode,
    install_dir: PathBuf,
    release_url: String,
    ffmpeg_location: String,
    runner: Arc<dyn ToolRunner>,
    client: Client,
    resolved: Mutex<Option<ResolvedTool>>,
}

impl ToolLocator {
    pub fn new(config: &Config, runner: Arc<dyn ToolRunner>) -> Result<Self, ToolError> {
        let client = Client::builder()
            .redirect(redirect::Policy::limited(10))
            .connect_timeout(FETCH_CONNECT_TIMEOUT)
            .timeout(config.tool_fetch_timeout())
            .user_agent(concat!("ytdlp-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ToolError::Fetch {
                url: config.ytdlp_release_url.clone(),
                reason: e.to_string(),
            })?;

        Ok(ToolLocator {
            mode: config.mode,
            install_dir: PathBuf::from(&config.tool_directory),
            release_url: config.ytdlp_release_url.clone(),
            ffmpeg_location: config.ffmpeg_location.clone(),
            runner,
            client,
            resolved: Mutex::new(None),
        })
    }

    /// Location passed to `--ffmpeg-location`.
    pub fn ffmpeg_location(&self) -> &str {
        match self.mode {
            DeployMode::Local => "ffmpeg",
            DeployMode::Hosted => &self.ffmpeg_location,
        }
    }

    /// Returns a verified binary, installing it first in hosted mode. Callers
    /// serialize here, so at most one install runs at a time.
    pub async fn ensure_available(&self) -> Result<ResolvedTool, ToolError> {
        let mut cached = self.resolved.lock().await;
        if let Some(tool) = cached.as_ref() {
            if tool.path.exists() {
                return Ok(tool.clone());
            }
            tracing::warn!("Cached yt-dlp at {} disappeared, resolving again", tool.path.display());
            *cached = None;
        }

        let tool = match self.mode {
            DeployMode::Local => self.resolve_local().await?,
            DeployMode::Hosted => self.resolve_hosted().await?,
        };
        tracing::info!("Using yt-dlp {} at {}", tool.version, tool.path.display());
        *cached = Some(tool.clone());
        Ok(tool)
    }

    /// Reports what is installed without fetching anything.
    pub async fn status(&self) -> ToolStatus {
        let mut cached = self.resolved.lock().await;
        if cached.as_ref().map_or(true, |tool| !tool.path.exists()) {
            let candidate = match self.mode {
                DeployMode::Local => find_on_path(BINARY_NAME, std::env::var_os("PATH")),
                DeployMode::Hosted => Some(self.install_dir.join(BINARY_NAME)).filter(|p| p.is_file()),
            };
            *cached = match candidate {
                Some(path) => match self.verify(&path).await {
                    Ok(version) => Some(ResolvedTool { path, version }),
                    Err(_) => None,
                },
                None => None,
            };
        }

        ToolStatus {
            installed: cached.is_some(),
            path: cached.as_ref().map(|t| t.path.display().to_string()),
            version: cached.as_ref().map(|t| t.version.clone()),
            mode: self.mode,
        }
    }

    async fn resolve_local(&self) -> Result<ResolvedTool, ToolError> {
        let path = find_on_path(BINARY_NAME, std::env::var_os("PATH")).ok_or(ToolError::NotFound)?;
        let version = self
            .verify(&path)
            .await
            .map_err(|reason| ToolError::Broken { path: path.clone(), reason })?;
        Ok(ResolvedTool { path, version })
    }

    async fn resolve_hosted(&self) -> Result<ResolvedTool, ToolError> {
        let target = self.install_dir.join(BINARY_NAME);

        if target.exists() {
            match self.verify(&target).await {
                Ok(version) => return Ok(ResolvedTool { path: target, version }),
                Err(reason) => {
                    tracing::warn!("yt-dlp at {} is not working ({}), re-downloading", target.display(), reason);
                    fs::remove_file(&target).await?;
                }
            }
        }

        fs::create_dir_all(&self.install_dir).await?;
        tracing::info!("Downloading latest yt-dlp from {}", self.release_url);
        self.fetch(&target).await?;
        make_executable(&target).await?;

        let version = self
            .verify(&target)
            .await
            .map_err(|reason| ToolError::Broken { path: target.clone(), reason })?;
        Ok(ResolvedTool { path: target, version })
    }

    /// Streams the release into a sibling file and renames it into place.
    async fn fetch(&self, target: &Path) -> Result<(), ToolError> {
        let partial = target.with_extension("download");
        if let Err(e) = self.fetch_to(&partial).await {
            if let Err(cleanup) = fs::remove_file(&partial).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove partial download {}: {}", partial.display(), cleanup);
                }
            }
            return Err(e);
        }
        fs::rename(&partial, target).await?;
        Ok(())
    }

    async fn fetch_to(&self, partial: &Path) -> Result<(), ToolError> {
        let fetch_error = |reason: String| ToolError::Fetch { url: self.release_url.clone(), reason };

        let mut response = self
            .client
            .get(&self.release_url)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_error(format!("server answered {}", response.status())));
        }

        let mut file = fs::File::create(partial).await?;
        while let Some(chunk) = response.chunk().await.map_err(|e| fetch_error(e.to_string()))? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn verify(&self, path: &Path) -> Result<String, String> {
        let args = ["--version".to_string()];
        match self.runner.capture(path, &args, VERSION_OUTPUT_LIMIT, VERSION_TIMEOUT).await {
            Ok(out) if out.success() => {
                let version = String::from_utf8_lossy(&out.stdout).trim().to_string();
                if version.is_empty() {
                    Err("empty version output".to_string())
                } else {
                    Ok(version)
                }
            }
            Ok(out) => Err(format!("exit status {:?}: {}", out.status, out.stderr.trim())),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata().map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// First executable `binary` found in a PATH-style list of directories.
pub fn find_on_path(binary: &str, path_var: Option<OsString>) -> Option<PathBuf> {
    let path_var = path_var?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeRunner;
    use crate::runner::CapturedOutput;

    fn version_output(status: i32, stdout: &str) -> CapturedOutput {
        CapturedOutput { status: Some(status), stdout: stdout.as_bytes().to_vec(), stderr: String::new() }
    }

    fn hosted_config(dir: &Path) -> Config {
        Config {
            mode: DeployMode::Hosted,
            tool_directory: dir.to_string_lossy().to_string(),
            // nothing listens on the discard port
            ytdlp_release_url: "http://127.0.0.1:9/yt-dlp".to_string(),
            ffmpeg_location: "/opt/ffmpeg/bin/ffmpeg".to_string(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn hosted_binary_that_answers_is_used_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(BINARY_NAME), b"#!/bin/sh\n").unwrap();
        let runner = Arc::new(FakeRunner::with_capture(version_output(0, "2024.08.06\n")));
        let locator = ToolLocator::new(&hosted_config(dir.path()), runner.clone()).unwrap();

        let tool = locator.ensure_available().await.unwrap();
        assert_eq!(tool.path, dir.path().join(BINARY_NAME));
        assert_eq!(tool.version, "2024.08.06");

        // no second version query is queued, so this only passes from cache
        let again = locator.ensure_available().await.unwrap();
        assert_eq!(again.version, "2024.08.06");
        assert_eq!(runner.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn broken_binary_is_deleted_and_fetch_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join(BINARY_NAME);
        std::fs::write(&target, b"not a program").unwrap();
        let runner = Arc::new(FakeRunner::with_capture(version_output(126, "")));
        let locator = ToolLocator::new(&hosted_config(dir.path()), runner).unwrap();

        let err = locator.ensure_available().await.unwrap_err();
        assert!(matches!(err, ToolError::Fetch { .. }), "unexpected error: {err}");
        assert!(!target.exists());
        assert!(!target.with_extension("download").exists());
    }

    #[tokio::test]
    async fn status_does_not_install() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::default());
        let locator = ToolLocator::new(&hosted_config(dir.path()), runner.clone()).unwrap();

        let status = locator.status().await;
        assert!(!status.installed);
        assert_eq!(status.path, None);
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn ffmpeg_location_follows_mode() {
        let dir = tempfile::tempdir().unwrap();
        let hosted = ToolLocator::new(&hosted_config(dir.path()), Arc::new(FakeRunner::default())).unwrap();
        assert_eq!(hosted.ffmpeg_location(), "/opt/ffmpeg/bin/ffmpeg");

        let local_config = Config { mode: DeployMode::Local, ..hosted_config(dir.path()) };
        let local = ToolLocator::new(&local_config, Arc::new(FakeRunner::default())).unwrap();
        assert_eq!(local.ffmpeg_location(), "ffmpeg");
    }

    #[tokio::test]
    async fn stalled_release_server_times_out() {
        let dir = tempfile::tempdir().unwrap();
        // accepts connections through the backlog but never answers
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = Config {
            ytdlp_release_url: format!("http://{}/yt-dlp", silent.local_addr().unwrap()),
            tool_fetch_timeout_secs: 1,
            ..hosted_config(dir.path())
        };
        let locator = ToolLocator::new(&config, Arc::new(FakeRunner::default())).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), locator.ensure_available())
            .await
            .expect("fetch should give up on its own");
        assert!(matches!(result, Err(ToolError::Fetch { .. })));
        assert!(!dir.path().join(BINARY_NAME).exists());
    }

    #[cfg(unix)]
    #[test]
    fn find_on_path_skips_non_executables() {
        use std::os::unix::fs::PermissionsExt;

        let plain = tempfile::tempdir().unwrap();
        let exec = tempfile::tempdir().unwrap();
        std::fs::write(plain.path().join("yt-dlp"), b"").unwrap();
        let good = exec.path().join("yt-dlp");
        std::fs::write(&good, b"").unwrap();
        std::fs::set_permissions(&good, std::fs::Permissions::from_mode(0o755)).unwrap();

        let path_var = std::env::join_paths([plain.path(), exec.path()]).unwrap();
        assert_eq!(find_on_path("yt-dlp", Some(path_var)), Some(good));
        assert_eq!(find_on_path("yt-dlp", None), None);
    }
}
