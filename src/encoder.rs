// src/encoder.rs - Encoder capability
//
// The coordinator depends on this trait only; `FfmpegEncoder` is the one
// concrete implementation today.

use crate::command::FfmpegCommandBuilder;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::supervisor::ProcessSupervisor;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::Duration;

pub trait Encoder: Send {
    /// Starts the encoder and hands back its stdout byte stream.
    fn start(&mut self) -> Result<Box<dyn Read + Send>>;

    /// Two-phase stop; idempotent; true iff the process is confirmed gone.
    fn stop(&mut self, grace: Duration) -> bool;

    fn is_running(&mut self) -> bool;

    /// Non-blocking exit-code check.
    fn poll(&mut self) -> Option<i32>;

    fn pid(&self) -> Option<u32>;

    /// Recent stderr lines for crash diagnostics.
    fn stderr_tail(&self) -> Vec<String>;
}

pub struct FfmpegEncoder {
    supervisor: ProcessSupervisor,
}

impl FfmpegEncoder {
    pub fn new(config: &Config) -> Self {
        Self {
            supervisor: ProcessSupervisor::new(Box::new(FfmpegCommandBuilder::new(config))),
        }
    }
}

impl Encoder for FfmpegEncoder {
    fn start(&mut self) -> Result<Box<dyn Read + Send>> {
        let stdout = self.supervisor.start()?;
        Ok(Box::new(stdout))
    }

    fn stop(&mut self, grace: Duration) -> bool {
        self.supervisor.stop(grace)
    }

    fn is_running(&mut self) -> bool {
        self.supervisor.is_running()
    }

    fn poll(&mut self) -> Option<i32> {
        self.supervisor.poll()
    }

    fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    fn stderr_tail(&self) -> Vec<String> {
        self.supervisor.stderr_tail()
    }
}

/// Startup check that the encoder executable exists and runs. Used to fail
/// fast (exit code 3) instead of tripping the breaker on the first viewer.
pub fn probe_executable(path: &str) -> Result<()> {
    match Command::new(path)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::EncoderNotFound(path.to_string()))
        }
        Err(e) => Err(Error::EncoderNotFound(format!("{path}: {e}"))),
    }
}
