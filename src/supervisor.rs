// src/supervisor.rs - Encoder subprocess lifecycle
//
// Spawns the child from an injected argv, pipes stdout (stream data) and
// stderr (diagnostics), and tears down in two phases: graceful terminate,
// then kill with a bounded force-wait.

use crate::command::CommandBuilder;
use crate::error::{Error, Result};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default graceful-terminate deadline before the child is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Hard deadline for the post-kill wait.
const KILL_WAIT: Duration = Duration::from_secs(2);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Stderr lines retained for crash diagnostics.
const STDERR_TAIL_LINES: usize = 30;

pub struct ProcessSupervisor {
    builder: Box<dyn CommandBuilder>,
    child: Option<Child>,
    pid: Option<u32>,
    started_at: Option<Instant>,
    exit_code: Option<i32>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_thread: Option<JoinHandle<()>>,
}

impl ProcessSupervisor {
    pub fn new(builder: Box<dyn CommandBuilder>) -> Self {
        Self {
            builder,
            child: None,
            pid: None,
            started_at: None,
            exit_code: None,
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
            stderr_thread: None,
        }
    }

    /// Spawns the child and returns its stdout pipe for the forwarder.
    pub fn start(&mut self) -> Result<ChildStdout> {
        if self.is_running() {
            return Err(Error::EncoderStartFailed("already running".into()));
        }

        let argv = self.builder.build()?;
        if argv.is_empty() {
            return Err(Error::EncoderStartFailed("empty command line".into()));
        }
        info!("starting encoder: {}", argv.join(" "));

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::EncoderStartFailed(format!("{}: {}", argv[0], e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::EncoderStartFailed("stdout pipe missing".into()))?;

        if let Some(stderr) = child.stderr.take() {
            self.stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
            let tail = self.stderr_tail.clone();
            let handle = std::thread::Builder::new()
                .name("encoder-stderr".to_string())
                .spawn(move || drain_stderr(stderr, tail))
                .map_err(|e| Error::EncoderStartFailed(format!("stderr thread: {e}")))?;
            self.stderr_thread = Some(handle);
        }

        let pid = child.id();
        info!("encoder started, pid {pid}");
        self.pid = Some(pid);
        self.started_at = Some(Instant::now());
        self.exit_code = None;
        self.child = Some(child);
        Ok(stdout)
    }

    /// Non-blocking exit check. `None` while the child is alive or after it
    /// has been reaped by `stop`.
    pub fn poll(&mut self) -> Option<i32> {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let code = status.code().unwrap_or(-1);
                    self.exit_code = Some(code);
                    return Some(code);
                }
                Ok(None) => return None,
                Err(e) => {
                    debug!("try_wait failed: {e}");
                    return None;
                }
            }
        }
        self.exit_code
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            None => false,
            Some(child) => matches!(child.try_wait(), Ok(None)),
        }
    }

    /// Two-phase stop: request graceful termination, wait up to `grace`,
    /// then kill and force-wait a bounded time. Idempotent; returns true
    /// iff the child is confirmed exited.
    pub fn stop(&mut self, grace: Duration) -> bool {
        let Some(mut child) = self.child.take() else {
            return true;
        };
        let pid = child.id();

        if let Ok(Some(status)) = child.try_wait() {
            info!("encoder (pid {pid}) already exited with {status}");
            self.finish(status.code());
            return true;
        }

        info!("stopping encoder (pid {pid})...");
        request_terminate(&mut child);

        if let Some(status) = wait_with_deadline(&mut child, grace) {
            info!("encoder (pid {pid}) terminated gracefully with {status}");
            self.finish(status.code());
            return true;
        }

        warn!("encoder (pid {pid}) ignored termination for {grace:?}, killing");
        if let Err(e) = child.kill() {
            debug!("kill failed: {e}");
        }
        match wait_with_deadline(&mut child, KILL_WAIT) {
            Some(status) => {
                info!("encoder (pid {pid}) killed ({status})");
                self.finish(status.code());
                true
            }
            None => {
                warn!("encoder (pid {pid}) still not reaped after kill");
                self.child = Some(child);
                false
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Last stderr lines from the current or most recent run.
    pub fn stderr_tail(&self) -> Vec<String> {
        match self.stderr_tail.lock() {
            Ok(tail) => tail.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn finish(&mut self, code: Option<i32>) {
        self.exit_code = code.or(Some(-1));
        self.started_at = None;
        if let Some(handle) = self.stderr_thread.take() {
            // The drain thread ends once the pipe hits EOF.
            let _ = handle.join();
        }
    }
}

fn drain_stderr(stderr: std::process::ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let reader = BufReader::new(stderr);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        let line = line.trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        debug!("encoder: {line}");
        if let Ok(mut tail) = tail.lock() {
            if tail.len() >= STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}

#[cfg(unix)]
fn request_terminate(child: &mut Child) {
    let pid = child.id() as libc::pid_t;
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn request_terminate(child: &mut Child) {
    let _ = child.kill();
}

fn wait_with_deadline(child: &mut Child, deadline: Duration) -> Option<std::process::ExitStatus> {
    let until = Instant::now() + deadline;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(e) => {
                debug!("try_wait failed: {e}");
                return None;
            }
        }
        if Instant::now() >= until {
            return None;
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    struct StaticCommand(Vec<&'static str>);

    impl CommandBuilder for StaticCommand {
        fn build(&self) -> Result<Vec<String>> {
            Ok(self.0.iter().map(|s| s.to_string()).collect())
        }
    }

    fn supervisor(argv: Vec<&'static str>) -> ProcessSupervisor {
        ProcessSupervisor::new(Box::new(StaticCommand(argv)))
    }

    #[test]
    fn test_spawn_failure_reported() {
        let mut sup = supervisor(vec!["/nonexistent/encoder-binary"]);
        assert!(matches!(
            sup.start(),
            Err(Error::EncoderStartFailed(_))
        ));
        assert!(!sup.is_running());
    }

    #[cfg(unix)]
    #[test]
    fn test_stdout_read_to_eof_and_exit_code() {
        let mut sup = supervisor(vec!["sh", "-c", "printf hello"]);
        let mut stdout = sup.start().unwrap();
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
        // The child exits on its own; poll observes it shortly after.
        let deadline = Instant::now() + Duration::from_secs(5);
        let code = loop {
            if let Some(code) = sup.poll() {
                break code;
            }
            assert!(Instant::now() < deadline, "child never exited");
            std::thread::sleep(Duration::from_millis(20));
        };
        assert_eq!(code, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_graceful_stop() {
        let mut sup = supervisor(vec!["sleep", "30"]);
        let _stdout = sup.start().unwrap();
        assert!(sup.is_running());
        assert!(sup.stop(Duration::from_secs(2)));
        assert!(!sup.is_running());
    }

    #[cfg(unix)]
    #[test]
    fn test_force_kill_after_grace() {
        // Child ignores SIGTERM, so the grace deadline must escalate.
        let mut sup = supervisor(vec!["sh", "-c", "trap '' TERM; sleep 30"]);
        let _stdout = sup.start().unwrap();
        assert!(sup.stop(Duration::from_millis(200)));
        assert!(!sup.is_running());
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_is_idempotent() {
        let mut sup = supervisor(vec!["sleep", "30"]);
        let _stdout = sup.start().unwrap();
        assert!(sup.stop(Duration::from_secs(2)));
        assert!(sup.stop(Duration::from_secs(2)));
        assert!(!sup.is_running());
    }

    #[cfg(unix)]
    #[test]
    fn test_stderr_tail_captured() {
        let mut sup = supervisor(vec!["sh", "-c", "echo warming up >&2; echo fault >&2"]);
        let _stdout = sup.start().unwrap();
        // stop() joins the stderr drain thread, so the tail is complete.
        assert!(sup.stop(Duration::from_secs(2)));
        let tail = sup.stderr_tail();
        assert!(tail.contains(&"warming up".to_string()));
        assert!(tail.contains(&"fault".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_double_start_rejected() {
        let mut sup = supervisor(vec!["sleep", "30"]);
        let _stdout = sup.start().unwrap();
        assert!(sup.start().is_err());
        assert!(sup.stop(Duration::from_secs(2)));
    }
}
