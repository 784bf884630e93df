// src/config.rs - JSON configuration loading and validation
//
// Recognized top-level sections: server, ffmpeg, source, process, logging.
// Unknown keys anywhere in a section are a configuration error.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Floor for the per-viewer send queue, matching the disconnect budget a
/// slow client gets before eviction.
pub const MIN_SEND_QUEUE_BYTES: usize = 4 * 1024 * 1024;

/// Seconds of stream data the send queue should be able to absorb.
const SEND_QUEUE_SECONDS: u64 = 2;

// Encoder settings are checked against fixed sets so a typo fails at load
// time instead of surfacing as an encoder crash on the first viewer.
const VALID_VIDEO_CODECS: &[&str] = &["libx264", "libx265", "mpeg4", "vp8", "vp9"];
const VALID_AUDIO_CODECS: &[&str] = &["aac", "mp3", "libopus", "pcm_s16le"];
const VALID_PRESETS: &[&str] = &[
    "ultrafast", "superfast", "veryfast", "faster", "fast", "medium", "slow", "slower", "veryslow",
];
const VALID_TUNES: &[&str] = &[
    "film",
    "animation",
    "grain",
    "stillimage",
    "fastdecode",
    "zerolatency",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FfmpegConfig {
    /// Encoder executable. Resolved against PATH when not absolute.
    #[serde(default = "default_ffmpeg_path")]
    pub path: String,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    /// Video bitrate in ffmpeg notation ("2M", "2500k", "800000").
    #[serde(default = "default_bitrate")]
    pub bitrate: String,
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_tune")]
    pub tune: String,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            path: default_ffmpeg_path(),
            video_codec: default_video_codec(),
            audio_codec: default_audio_codec(),
            bitrate: default_bitrate(),
            framerate: default_framerate(),
            preset: default_preset(),
            tune: default_tune(),
        }
    }
}

/// Capture source. The variant decides which grab arguments the command
/// builder emits.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Screen {
        #[serde(default = "default_display_index")]
        display_index: u32,
        #[serde(default)]
        region: Option<Region>,
    },
    Window {
        window_title: String,
        #[serde(default)]
        window_class: Option<String>,
    },
    WindowRegion {
        window_title: String,
        region: Region,
    },
    /// Window captured while not in the foreground.
    WindowBg {
        window_title: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    /// Crashes tolerated per window before the breaker trips.
    #[serde(default = "default_crash_threshold")]
    pub crash_threshold: u32,
    /// Sliding window for crash accounting, seconds.
    #[serde(default = "default_crash_window")]
    pub crash_window: u64,
    /// Delay before the encoder is torn down once the last viewer leaves,
    /// seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            crash_threshold: default_crash_threshold(),
            crash_window: default_crash_window(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// One of DEBUG, INFO, WARNING, ERROR, CRITICAL.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}
fn default_video_codec() -> String {
    "libx264".to_string()
}
fn default_audio_codec() -> String {
    "aac".to_string()
}
fn default_bitrate() -> String {
    "2M".to_string()
}
fn default_framerate() -> u32 {
    30
}
fn default_preset() -> String {
    "ultrafast".to_string()
}
fn default_tune() -> String {
    "zerolatency".to_string()
}
fn default_display_index() -> u32 {
    1
}
fn default_crash_threshold() -> u32 {
    3
}
fn default_crash_window() -> u64 {
    60
}
fn default_shutdown_timeout() -> u64 {
    30
}
fn default_log_level() -> String {
    "INFO".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Config> {
        let config: Config =
            serde_json::from_str(content).map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::ConfigInvalid("server.port must not be 0".into()));
        }
        if self.ffmpeg.path.trim().is_empty() {
            return Err(Error::ConfigInvalid("ffmpeg.path must not be empty".into()));
        }
        if self.ffmpeg.framerate == 0 {
            return Err(Error::ConfigInvalid(
                "ffmpeg.framerate must be at least 1".into(),
            ));
        }
        validate_choice("ffmpeg.video_codec", &self.ffmpeg.video_codec, VALID_VIDEO_CODECS)?;
        validate_choice("ffmpeg.audio_codec", &self.ffmpeg.audio_codec, VALID_AUDIO_CODECS)?;
        validate_choice("ffmpeg.preset", &self.ffmpeg.preset, VALID_PRESETS)?;
        validate_choice("ffmpeg.tune", &self.ffmpeg.tune, VALID_TUNES)?;
        parse_bitrate(&self.ffmpeg.bitrate)?;
        if self.process.crash_threshold == 0 {
            return Err(Error::ConfigInvalid(
                "process.crash_threshold must be at least 1".into(),
            ));
        }
        if self.process.crash_window == 0 {
            return Err(Error::ConfigInvalid(
                "process.crash_window must be at least 1".into(),
            ));
        }
        parse_log_level(&self.logging.level)?;
        match &self.source {
            SourceConfig::Screen { region, .. } => {
                if let Some(region) = region {
                    validate_region(region)?;
                }
            }
            SourceConfig::Window { window_title, .. }
            | SourceConfig::WindowBg { window_title } => {
                validate_window_title(window_title)?;
            }
            SourceConfig::WindowRegion {
                window_title,
                region,
            } => {
                validate_window_title(window_title)?;
                validate_region(region)?;
            }
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.process.shutdown_timeout)
    }

    pub fn crash_window(&self) -> Duration {
        Duration::from_secs(self.process.crash_window)
    }

    /// Per-viewer send queue budget: enough bytes for a couple of seconds at
    /// the configured bitrate, floored at [`MIN_SEND_QUEUE_BYTES`].
    pub fn send_queue_capacity(&self) -> usize {
        let bits_per_sec = parse_bitrate(&self.ffmpeg.bitrate).unwrap_or(0);
        let from_bitrate = (bits_per_sec / 8).saturating_mul(SEND_QUEUE_SECONDS) as usize;
        from_bitrate.max(MIN_SEND_QUEUE_BYTES)
    }

    pub fn log_level(&self) -> log::LevelFilter {
        // Validated at load time; fall back to Info if called on an
        // unvalidated instance.
        parse_log_level(&self.logging.level).unwrap_or(log::LevelFilter::Info)
    }
}

fn validate_choice(key: &str, value: &str, valid: &[&str]) -> Result<()> {
    if valid.contains(&value) {
        return Ok(());
    }
    Err(Error::ConfigInvalid(format!(
        "{key} must be one of {} (got {value:?})",
        valid.join(", ")
    )))
}

fn validate_region(region: &Region) -> Result<()> {
    if region.width == 0 || region.height == 0 {
        return Err(Error::ConfigInvalid(
            "source region width and height must be positive".into(),
        ));
    }
    Ok(())
}

fn validate_window_title(title: &str) -> Result<()> {
    if title.trim().is_empty() {
        return Err(Error::ConfigInvalid(
            "source.window_title must not be empty".into(),
        ));
    }
    Ok(())
}

/// Parses ffmpeg bitrate notation into bits per second.
pub fn parse_bitrate(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::ConfigInvalid("ffmpeg.bitrate must not be empty".into()));
    }
    let (digits, multiplier) = match value.as_bytes()[value.len() - 1] {
        b'k' | b'K' => (&value[..value.len() - 1], 1_000),
        b'm' | b'M' => (&value[..value.len() - 1], 1_000_000),
        _ => (value, 1),
    };
    let number: u64 = digits
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("invalid ffmpeg.bitrate: {value:?}")))?;
    if number == 0 {
        return Err(Error::ConfigInvalid("ffmpeg.bitrate must be positive".into()));
    }
    Ok(number * multiplier)
}

/// Maps the configured level name onto a `log` filter.
pub fn parse_log_level(name: &str) -> Result<log::LevelFilter> {
    match name.to_ascii_uppercase().as_str() {
        "DEBUG" => Ok(log::LevelFilter::Debug),
        "INFO" => Ok(log::LevelFilter::Info),
        "WARNING" => Ok(log::LevelFilter::Warn),
        "ERROR" => Ok(log::LevelFilter::Error),
        "CRITICAL" => Ok(log::LevelFilter::Error),
        other => Err(Error::ConfigInvalid(format!(
            "logging.level must be one of DEBUG, INFO, WARNING, ERROR, CRITICAL (got {other:?})"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "server": {"host": "0.0.0.0", "port": 8765},
        "ffmpeg": {
            "video_codec": "libx264",
            "audio_codec": "aac",
            "bitrate": "2500k",
            "framerate": 30,
            "preset": "ultrafast",
            "tune": "zerolatency"
        },
        "source": {"type": "screen", "display_index": 1},
        "process": {"crash_threshold": 3, "crash_window": 60, "shutdown_timeout": 30},
        "logging": {"level": "DEBUG", "file": "stream.log"}
    }"#;

    #[test]
    fn test_full_config_parses() {
        let config = Config::from_json(FULL).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8765);
        assert_eq!(config.ffmpeg.bitrate, "2500k");
        assert_eq!(config.process.shutdown_timeout, 30);
        assert_eq!(config.log_level(), log::LevelFilter::Debug);
        assert!(matches!(config.source, SourceConfig::Screen { .. }));
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = Config::from_json(
            r#"{"server": {"port": 9000}, "source": {"type": "screen"}}"#,
        )
        .unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.ffmpeg.path, "ffmpeg");
        assert_eq!(config.ffmpeg.framerate, 30);
        assert_eq!(config.process.crash_threshold, 3);
        assert_eq!(config.process.crash_window, 60);
        assert_eq!(config.process.shutdown_timeout, 30);
        assert_eq!(config.logging.level, "INFO");
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let result = Config::from_json(
            r#"{"server": {"port": 9000}, "source": {"type": "screen"}, "extra": 1}"#,
        );
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_unknown_section_key_rejected() {
        let result = Config::from_json(
            r#"{"server": {"port": 9000, "bogus": true}, "source": {"type": "screen"}}"#,
        );
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_window_source_requires_title() {
        let result = Config::from_json(
            r#"{"server": {"port": 9000}, "source": {"type": "window", "window_title": "  "}}"#,
        );
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_bad_level_rejected() {
        let result = Config::from_json(
            r#"{"server": {"port": 9000}, "source": {"type": "screen"},
                "logging": {"level": "VERBOSE"}}"#,
        );
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_unknown_video_codec_rejected() {
        let result = Config::from_json(
            r#"{"server": {"port": 9000}, "source": {"type": "screen"},
                "ffmpeg": {"video_codec": "h265_magic"}}"#,
        );
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_unknown_audio_codec_rejected() {
        let result = Config::from_json(
            r#"{"server": {"port": 9000}, "source": {"type": "screen"},
                "ffmpeg": {"audio_codec": "flac"}}"#,
        );
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_unknown_preset_rejected() {
        let result = Config::from_json(
            r#"{"server": {"port": 9000}, "source": {"type": "screen"},
                "ffmpeg": {"preset": "garbage"}}"#,
        );
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_unknown_tune_rejected() {
        let result = Config::from_json(
            r#"{"server": {"port": 9000}, "source": {"type": "screen"},
                "ffmpeg": {"tune": "latency"}}"#,
        );
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_alternate_codecs_accepted() {
        let config = Config::from_json(
            r#"{"server": {"port": 9000}, "source": {"type": "screen"},
                "ffmpeg": {"video_codec": "vp9", "audio_codec": "libopus",
                           "preset": "veryfast", "tune": "film"}}"#,
        )
        .unwrap();
        assert_eq!(config.ffmpeg.video_codec, "vp9");
        assert_eq!(config.ffmpeg.audio_codec, "libopus");
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let result = Config::from_json(
            r#"{"server": {"port": 9000}, "source": {"type": "screen"},
                "process": {"crash_threshold": 0}}"#,
        );
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_parse_bitrate_notations() {
        assert_eq!(parse_bitrate("2M").unwrap(), 2_000_000);
        assert_eq!(parse_bitrate("2500k").unwrap(), 2_500_000);
        assert_eq!(parse_bitrate("800000").unwrap(), 800_000);
        assert!(parse_bitrate("fast").is_err());
        assert!(parse_bitrate("0").is_err());
        assert!(parse_bitrate("").is_err());
    }

    #[test]
    fn test_send_queue_floor() {
        let config = Config::from_json(
            r#"{"server": {"port": 9000}, "source": {"type": "screen"},
                "ffmpeg": {"bitrate": "500k"}}"#,
        )
        .unwrap();
        // 2s at 500kbit/s is far below the floor.
        assert_eq!(config.send_queue_capacity(), MIN_SEND_QUEUE_BYTES);
    }

    #[test]
    fn test_send_queue_scales_with_bitrate() {
        let config = Config::from_json(
            r#"{"server": {"port": 9000}, "source": {"type": "screen"},
                "ffmpeg": {"bitrate": "40M"}}"#,
        )
        .unwrap();
        // 2s at 40Mbit/s = 10 MB.
        assert_eq!(config.send_queue_capacity(), 10_000_000);
    }
}
