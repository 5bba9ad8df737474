use anyhow::{anyhow, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

pub const DEFAULT_RELEASE_URL: &str = "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp";

/// How the external binaries are obtained.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    /// Use the yt-dlp and ffmpeg already installed on PATH.
    #[default]
    Local,
    /// Fetch yt-dlp into the tool directory at startup.
    Hosted,
}

impl DeployMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "hosted" => Some(Self::Hosted),
            _ => None,
        }
    }
}

/// Transport used by `GET /download` when the request does not pick one.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Server-sent progress events, then a `/get-file` hand-off.
    #[default]
    Events,
    /// The tool's stdout piped straight into the response body.
    Raw,
}

impl StreamMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "events" => Some(Self::Events),
            "raw" => Some(Self::Raw),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig { max_requests: 5, window_secs: 60 }
    }
}

/// The structure of our configuration file (config.toml)
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub mode: DeployMode,
    pub stream_mode: StreamMode,
    /// Scoped directory holding in-flight and handed-off downloads.
    pub temp_directory: String,
    /// Where `hosted` mode keeps the fetched yt-dlp binary.
    pub tool_directory: String,
    pub ytdlp_release_url: String,
    pub ffmpeg_location: String,
    /// Key the rate limiter on the first `X-Forwarded-For` hop. Only safe
    /// behind a proxy that overwrites the header.
    pub trust_forwarded_for: bool,
    pub rate_limit: RateLimitConfig,
    /// Upper bound on one yt-dlp release download.
    pub tool_fetch_timeout_secs: u64,
    pub metadata_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub handoff_ttl_secs: u64,
    pub max_metadata_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        let temp_dir = std::env::temp_dir().join("ytdlp-relay");
        let tool_dir = ProjectDirs::from("com", "YtdlpRelay", "ytdlp-relay")
            .map(|dirs| dirs.data_local_dir().join("bin"))
            .unwrap_or_else(|| PathBuf::from("bin"));

        Config {
            host: "127.0.0.1".to_string(),
            port: 3000,
            mode: DeployMode::default(),
            stream_mode: StreamMode::default(),
            temp_directory: temp_dir.to_string_lossy().to_string(),
            tool_directory: tool_dir.to_string_lossy().to_string(),
            ytdlp_release_url: DEFAULT_RELEASE_URL.to_string(),
            ffmpeg_location: "ffmpeg".to_string(),
            trust_forwarded_for: false,
            rate_limit: RateLimitConfig::default(),
            tool_fetch_timeout_secs: 5 * 60,
            metadata_timeout_secs: 60,
            download_timeout_secs: 30 * 60,
            handoff_ttl_secs: 10 * 60,
            max_metadata_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn tool_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_fetch_timeout_secs)
    }

    pub fn handoff_ttl(&self) -> Duration {
        Duration::from_secs(self.handoff_ttl_secs)
    }

    /// Applies the environment on top of the file values. Unparseable values are
    /// logged and ignored.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var("HOST") {
            self.host = host;
        }
        if let Some(port) = var("PORT") {
            match port.trim().parse() {
                Ok(port) => self.port = port,
                Err(_) => tracing::warn!("Ignoring invalid PORT value '{}'", port),
            }
        }
        if var("VERCEL_ENV").as_deref() == Some("production") {
            self.mode = DeployMode::Hosted;
        }
        if let Some(mode) = var("DEPLOY_MODE") {
            match DeployMode::parse(&mode) {
                Some(mode) => self.mode = mode,
                None => tracing::warn!("Ignoring invalid DEPLOY_MODE value '{}'", mode),
            }
        }
        if let Some(trust) = var("TRUST_FORWARDED_FOR") {
            match trust.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.trust_forwarded_for = true,
                "0" | "false" | "no" => self.trust_forwarded_for = false,
                _ => tracing::warn!("Ignoring invalid TRUST_FORWARDED_FOR value '{}'", trust),
            }
        }
        if let Some(mode) = var("STREAM_MODE") {
            match StreamMode::parse(&mode) {
                Some(mode) => self.stream_mode = mode,
                None => tracing::warn!("Ignoring invalid STREAM_MODE value '{}'", mode),
            }
        }
    }
}

/// Returns the cross-platform path to the configuration file, creating the directory if needed.
async fn get_config_path() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("com", "YtdlpRelay", "ytdlp-relay")
        .ok_or_else(|| anyhow!("Could not find a valid home directory to store config"))?;

    let config_dir = project_dirs.config_dir();
    fs::create_dir_all(config_dir).await?;

    Ok(config_dir.join("config.toml"))
}

/// Loads the configuration from the file, or creates a default one if it doesn't exist,
/// then layers the process environment on top.
pub async fn load_config() -> Result<Config> {
    let config_path = get_config_path().await?;

    let mut config = if !config_path.exists() {
        tracing::info!(
            "No config file found. Creating a default one at: {}",
            config_path.display()
        );
        let default_config = Config::default();
        save_config(&default_config).await?;
        default_config
    } else {
        let config_content = fs::read_to_string(&config_path).await?;
        toml::from_str(&config_content)
            .map_err(|e| anyhow!("Failed to parse config file at {}: {}", config_path.display(), e))?
    };

    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}

/// Saves the provided configuration object to the file.
pub async fn save_config(config: &Config) -> Result<()> {
    let config_path = get_config_path().await?;
    let toml_string = toml::to_string_pretty(config)?;
    fs::write(config_path, toml_string).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config: Config = toml::from_str("port = 8081\n[rate_limit]\nmax_requests = 2\n").unwrap();
        assert_eq!(config.port, 8081);
        assert_eq!(config.rate_limit.max_requests, 2);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.mode, DeployMode::Local);
        assert_eq!(config.max_metadata_bytes, 10 * 1024 * 1024);
        assert!(!config.trust_forwarded_for);
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("PORT", "9000"),
            ("DEPLOY_MODE", "hosted"),
            ("STREAM_MODE", "raw"),
            ("TRUST_FORWARDED_FOR", "true"),
        ]));
        assert!(config.trust_forwarded_for);
        assert_eq!(config.port, 9000);
        assert_eq!(config.mode, DeployMode::Hosted);
        assert_eq!(config.stream_mode, StreamMode::Raw);
    }

    #[test]
    fn vercel_production_implies_hosted() {
        let mut config = Config::default();
        config.apply_env(env(&[("VERCEL_ENV", "production")]));
        assert_eq!(config.mode, DeployMode::Hosted);
    }

    #[test]
    fn invalid_environment_values_are_ignored() {
        let mut config = Config::default();
        config.apply_env(env(&[("PORT", "eighty"), ("DEPLOY_MODE", "cloud"), ("TRUST_FORWARDED_FOR", "maybe")]));
        assert_eq!(config.port, 3000);
        assert!(!config.trust_forwarded_for);
        assert_eq!(config.mode, DeployMode::Local);
    }
}
