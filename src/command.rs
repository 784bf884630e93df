// src/command.rs - Encoder command-line construction
//
// The coordinator only sees the `CommandBuilder` capability; everything
// ffmpeg-specific lives here.

use crate::config::{Config, FfmpegConfig, SourceConfig};
#[cfg(windows)]
use crate::config::Region;
#[cfg(not(windows))]
use crate::error::Error;
use crate::error::Result;

/// Produces the argv used to spawn the encoder process. argv[0] is the
/// executable.
pub trait CommandBuilder: Send {
    fn build(&self) -> Result<Vec<String>>;
}

/// Builds an ffmpeg invocation that captures the configured source and
/// writes an FLV stream to stdout.
pub struct FfmpegCommandBuilder {
    ffmpeg: FfmpegConfig,
    source: SourceConfig,
}

impl FfmpegCommandBuilder {
    pub fn new(config: &Config) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            source: config.source.clone(),
        }
    }
}

impl CommandBuilder for FfmpegCommandBuilder {
    fn build(&self) -> Result<Vec<String>> {
        let mut cmd = vec![self.ffmpeg.path.clone()];
        cmd.extend(input_args(&self.source, self.ffmpeg.framerate)?);
        cmd.extend(video_args(&self.ffmpeg));
        cmd.extend(audio_args(&self.ffmpeg));
        cmd.extend(output_args());
        Ok(cmd)
    }
}

fn video_args(ffmpeg: &FfmpegConfig) -> Vec<String> {
    vec![
        "-c:v".into(),
        ffmpeg.video_codec.clone(),
        "-preset".into(),
        ffmpeg.preset.clone(),
        "-tune".into(),
        ffmpeg.tune.clone(),
        // Baseline profile keeps the stream decodable by browser FLV players.
        "-profile:v".into(),
        "baseline".into(),
        "-level".into(),
        "3.1".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-b:v".into(),
        ffmpeg.bitrate.clone(),
        // One keyframe per second so late joiners never wait long for a GOP.
        "-g".into(),
        ffmpeg.framerate.to_string(),
    ]
}

fn audio_args(ffmpeg: &FfmpegConfig) -> Vec<String> {
    vec![
        "-c:a".into(),
        ffmpeg.audio_codec.clone(),
        "-b:a".into(),
        "128k".into(),
        "-ar".into(),
        "44100".into(),
    ]
}

fn output_args() -> Vec<String> {
    vec!["-f".into(), "flv".into(), "pipe:1".into()]
}

#[cfg(windows)]
fn input_args(source: &SourceConfig, framerate: u32) -> Result<Vec<String>> {
    let mut args = grab_preamble("gdigrab", framerate);
    match source {
        SourceConfig::Screen { region, .. } => {
            args.push("-i".into());
            args.push("desktop".into());
            if let Some(region) = region {
                args.extend(region_args(region));
            }
        }
        SourceConfig::Window { window_title, .. } | SourceConfig::WindowBg { window_title } => {
            args.push("-i".into());
            args.push(format!("title={window_title}"));
        }
        SourceConfig::WindowRegion {
            window_title,
            region,
        } => {
            args.push("-i".into());
            args.push(format!("title={window_title}"));
            args.extend(region_args(region));
        }
    }
    Ok(args)
}

#[cfg(not(windows))]
fn input_args(source: &SourceConfig, framerate: u32) -> Result<Vec<String>> {
    let mut args = grab_preamble("x11grab", framerate);
    match source {
        SourceConfig::Screen {
            display_index,
            region,
        } => {
            // Display indices are 1-based in the config.
            let display = display_index.saturating_sub(1);
            match region {
                Some(region) => {
                    args.push("-video_size".into());
                    args.push(format!("{}x{}", region.width, region.height));
                    args.push("-i".into());
                    args.push(format!(":{}.0+{},{}", display, region.x, region.y));
                }
                None => {
                    args.push("-i".into());
                    args.push(format!(":{display}.0"));
                }
            }
            Ok(args)
        }
        SourceConfig::Window { .. }
        | SourceConfig::WindowRegion { .. }
        | SourceConfig::WindowBg { .. } => Err(Error::Source(
            "window capture sources require a display grabber that can target \
             windows; only screen sources are supported on this platform"
                .into(),
        )),
    }
}

fn grab_preamble(device: &str, framerate: u32) -> Vec<String> {
    vec![
        "-f".into(),
        device.into(),
        "-framerate".into(),
        framerate.to_string(),
        // Generous realtime buffer so a slow consumer does not drop frames
        // at the capture stage.
        "-rtbufsize".into(),
        "100M".into(),
    ]
}

#[cfg(windows)]
fn region_args(region: &Region) -> Vec<String> {
    vec![
        "-offset_x".into(),
        region.x.to_string(),
        "-offset_y".into(),
        region.y.to_string(),
        "-video_size".into(),
        format!("{}x{}", region.width, region.height),
    ]
}
