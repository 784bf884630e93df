// src/coordinator.rs - Streaming lifecycle state machine
//
// Single owner of all mutable streaming state (viewer registry, GOP
// buffer, encoder handle, crash ledger), driven by a mailbox. Viewer
// workers, the forwarder and the signal handler only ever talk to it
// through events; state transitions are atomic with respect to the
// mailbox.
//
// Lifecycle:
// - first viewer starts the encoder, last viewer arms a grace timer
// - the timer is cancelled by any reconnect and re-armed on the next drain
// - unexpected encoder exits go through the crash breaker: restart while
//   within budget, otherwise Faulted (new viewers get a policy close)

use crate::client::{ClientManager, CloseReason, QueueSender, Viewer, ViewerId};
use crate::config::Config;
use crate::encoder::Encoder;
use crate::forwarder::{self, ForwarderStats};
use crate::gop::GopBuffer;
use crate::health::HealthMonitor;
use crate::supervisor::DEFAULT_STOP_GRACE;
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::fmt;
use std::net::SocketAddr;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Pause before respawning a crashed encoder, so a persistently failing
/// command does not hot-spin through its crash budget.
const RESTART_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub enum Event {
    ViewerConnect {
        id: ViewerId,
        peer: SocketAddr,
        queue: QueueSender,
    },
    ViewerDisconnect {
        id: ViewerId,
    },
    EncoderData {
        generation: u64,
        chunk: Bytes,
    },
    EncoderEof {
        generation: u64,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Starting,
    Running,
    Draining,
    Stopping,
    Faulted,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Idle => "idle",
            StreamState::Starting => "starting",
            StreamState::Running => "running",
            StreamState::Draining => "draining",
            StreamState::Stopping => "stopping",
            StreamState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Final result of the coordinator loop, mapped to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Clean,
    Faulted,
}

/// Point-in-time service status.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub state: StreamState,
    pub viewers: usize,
    pub encoder_active: bool,
    pub bytes_forwarded: u64,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Delay between the last viewer leaving and encoder teardown.
    pub shutdown_grace: Duration,
    /// Graceful-terminate deadline handed to the encoder on stop.
    pub stop_grace: Duration,
}

impl CoordinatorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            shutdown_grace: config.shutdown_grace(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

pub struct Coordinator {
    cfg: CoordinatorConfig,
    state: StreamState,
    encoder: Box<dyn Encoder>,
    health: HealthMonitor,
    clients: ClientManager,
    gop: GopBuffer,
    stats: ForwarderStats,
    events_tx: Sender<Event>,
    /// Encoder run counter; events tagged with an older generation are
    /// from a run that no longer exists.
    generation: u64,
    drain_deadline: Option<Instant>,
    forwarder: Option<JoinHandle<()>>,
}

impl Coordinator {
    pub fn new(
        cfg: CoordinatorConfig,
        encoder: Box<dyn Encoder>,
        health: HealthMonitor,
        events_tx: Sender<Event>,
    ) -> Self {
        Self {
            cfg,
            state: StreamState::Idle,
            encoder,
            health,
            clients: ClientManager::new(),
            gop: GopBuffer::new(),
            stats: ForwarderStats::default(),
            events_tx,
            generation: 0,
            drain_deadline: None,
            forwarder: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Point-in-time view of the service, for logs and introspection. The
    /// encoder is alive exactly in the starting/running/draining states.
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state,
            viewers: self.clients.count(),
            encoder_active: matches!(
                self.state,
                StreamState::Starting | StreamState::Running | StreamState::Draining
            ),
            bytes_forwarded: self.stats.bytes_read,
        }
    }

    /// Event loop. Returns once a shutdown event arrives (or every other
    /// sender disappears, which only happens in tests).
    pub fn run(mut self, events: Receiver<Event>) -> Outcome {
        info!("coordinator ready (state: {})", self.state);
        loop {
            let event = if let Some(deadline) = self.drain_deadline {
                match events.recv_deadline(deadline) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => {
                        self.on_drain_deadline();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match events.recv() {
                    Ok(event) => event,
                    Err(_) => break,
                }
            };

            match event {
                Event::ViewerConnect { id, peer, queue } => self.on_viewer_connect(id, peer, queue),
                Event::ViewerDisconnect { id } => self.on_viewer_disconnect(id),
                Event::EncoderData { generation, chunk } => self.on_encoder_data(generation, chunk),
                Event::EncoderEof { generation } => self.on_encoder_eof(generation),
                Event::Shutdown => {
                    self.on_shutdown();
                    break;
                }
            }
        }
        if self.encoder.is_running() {
            self.encoder.stop(self.cfg.stop_grace);
        }
        if self.state == StreamState::Faulted {
            Outcome::Faulted
        } else {
            Outcome::Clean
        }
    }

    pub(crate) fn on_viewer_connect(&mut self, id: ViewerId, peer: SocketAddr, queue: QueueSender) {
        match self.state {
            StreamState::Faulted => {
                info!("{id} refused: service is faulted");
                queue.close(CloseReason::Policy);
            }
            StreamState::Idle | StreamState::Stopping => {
                self.clients.add(Viewer::new(id, peer, queue));
                self.start_encoder();
            }
            StreamState::Starting => {
                // The live stream will carry the header from byte 0.
                self.clients.add(Viewer::new(id, peer, queue));
            }
            StreamState::Running => {
                self.clients.add(Viewer::new(id, peer, queue));
                self.deliver_bootstrap(id);
            }
            StreamState::Draining => {
                info!("viewer returned during drain; shutdown timer cancelled");
                self.drain_deadline = None;
                self.state = StreamState::Running;
                self.clients.add(Viewer::new(id, peer, queue));
                self.deliver_bootstrap(id);
            }
        }
    }

    pub(crate) fn on_viewer_disconnect(&mut self, id: ViewerId) {
        if !self.clients.remove(id) {
            // Already evicted; the worker exit event still arrives.
            return;
        }
        info!("{id} disconnected ({} viewer(s) left)", self.clients.count());
        self.maybe_arm_drain();
    }

    pub(crate) fn on_encoder_data(&mut self, generation: u64, chunk: Bytes) {
        if generation != self.generation {
            return;
        }
        if !matches!(self.state, StreamState::Running | StreamState::Draining) {
            return;
        }
        self.gop.ingest(&chunk);
        let log_cue = self.stats.record_chunk(chunk.len());
        if !self.clients.is_empty() {
            let evicted = self.clients.broadcast(&chunk);
            if evicted > 0 {
                self.stats.viewers_evicted += evicted as u64;
                self.maybe_arm_drain();
            }
        }
        if log_cue {
            let gop = self.gop.stats();
            debug!(
                "forwarded {} chunks / {} bytes to {} viewer(s) (evicted {}, gop ready: {})",
                self.stats.chunks,
                self.stats.bytes_read,
                self.clients.count(),
                self.stats.viewers_evicted,
                gop.ready,
            );
        }
    }

    pub(crate) fn on_encoder_eof(&mut self, generation: u64) {
        if generation != self.generation {
            return;
        }
        if !matches!(self.state, StreamState::Running | StreamState::Draining) {
            return;
        }

        let exit_code = self.encoder.poll();
        error!("encoder exited unexpectedly (exit code {exit_code:?})");
        for line in self.encoder.stderr_tail() {
            debug!("encoder stderr: {line}");
        }
        // Reap whatever is left of the child.
        self.encoder.stop(Duration::from_secs(0));
        self.forwarder.take();

        let now = Instant::now();
        self.health.record_crash(now);
        if self.health.should_restart(now) {
            info!(
                "restarting encoder ({}/{} crashes in window)",
                self.health.crash_count(now),
                self.health.threshold()
            );
            std::thread::sleep(RESTART_DELAY);
            self.start_encoder();
        } else {
            error!(
                "encoder crashed {} times within the window; entering faulted state",
                self.health.crash_count(now)
            );
            self.enter_faulted();
        }
    }

    pub(crate) fn on_drain_deadline(&mut self) {
        self.drain_deadline = None;
        // A viewer may have raced the timer; fire only when still drained.
        if self.state != StreamState::Draining || !self.clients.is_empty() {
            return;
        }
        info!("shutdown grace elapsed; stopping encoder");
        self.state = StreamState::Stopping;
        if !self.encoder.stop(self.cfg.stop_grace) {
            warn!("encoder did not confirm exit");
        }
        self.generation += 1;
        self.forwarder.take();
        self.gop.reset();
        self.health.reset();
        self.state = StreamState::Idle;
        info!("encoder stopped; waiting for viewers");
    }

    pub(crate) fn on_shutdown(&mut self) {
        let status = self.status();
        info!(
            "shutting down (state: {}, {} viewer(s), {} bytes forwarded)",
            status.state, status.viewers, status.bytes_forwarded
        );
        self.clients.close_all(CloseReason::Normal);
        if self.encoder.is_running() {
            self.encoder.stop(self.cfg.stop_grace);
        }
        self.generation += 1;
        self.forwarder.take();
        self.gop.reset();
        self.health.reset();
        self.drain_deadline = None;
        if self.state != StreamState::Faulted {
            self.state = StreamState::Idle;
        }
    }

    fn start_encoder(&mut self) {
        self.state = StreamState::Starting;
        match self.encoder.start() {
            Ok(stdout) => {
                self.generation += 1;
                self.gop.reset();
                match forwarder::spawn(stdout, self.generation, self.events_tx.clone()) {
                    Ok(handle) => {
                        self.forwarder = Some(handle);
                        // A crash during drain keeps the armed timer.
                        self.state = if self.clients.is_empty() && self.drain_deadline.is_some() {
                            StreamState::Draining
                        } else {
                            StreamState::Running
                        };
                        info!(
                            "encoder running (pid {:?}, generation {})",
                            self.encoder.pid(),
                            self.generation
                        );
                    }
                    Err(e) => {
                        error!("failed to spawn forwarder: {e}");
                        self.encoder.stop(self.cfg.stop_grace);
                        self.handle_start_failure();
                    }
                }
            }
            Err(e) => {
                error!("encoder start failed: {e}");
                self.handle_start_failure();
            }
        }
    }

    fn handle_start_failure(&mut self) {
        let now = Instant::now();
        self.health.record_crash(now);
        if self.health.should_restart(now) {
            // Evict the triggering viewers; the next connect retries.
            self.clients.close_all(CloseReason::Internal);
            self.drain_deadline = None;
            self.state = StreamState::Idle;
        } else {
            self.enter_faulted();
        }
    }

    fn enter_faulted(&mut self) {
        self.state = StreamState::Faulted;
        self.drain_deadline = None;
        self.clients.close_all(CloseReason::Policy);
        self.gop.reset();
        self.forwarder.take();
    }

    fn deliver_bootstrap(&mut self, id: ViewerId) {
        if !self.gop.is_ready() {
            debug!("bootstrap not ready yet; {id} starts with live bytes");
            return;
        }
        let blob = self.gop.bootstrap();
        let len = blob.len();
        if self.clients.send_to(id, blob) {
            debug!("bootstrap ({len} bytes) queued for {id}");
        } else {
            warn!("{id} could not take the bootstrap blob");
            self.stats.viewers_evicted += 1;
            self.maybe_arm_drain();
        }
    }

    fn maybe_arm_drain(&mut self) {
        if self.state == StreamState::Running && self.clients.is_empty() {
            self.state = StreamState::Draining;
            self.drain_deadline = Some(Instant::now() + self.cfg.shutdown_grace);
            info!(
                "no viewers left; encoder stops in {:?} unless someone reconnects",
                self.cfg.shutdown_grace
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub(crate) fn drain_deadline(&self) -> Option<Instant> {
        self.drain_deadline
    }

    #[cfg(test)]
    pub(crate) fn viewer_count(&self) -> usize {
        self.clients.count()
    }

    #[cfg(test)]
    pub(crate) fn bootstrap(&self) -> Bytes {
        self.gop.bootstrap()
    }
}
