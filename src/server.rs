// src/server.rs - WebSocket listener and per-viewer workers
//
// The accept loop hands every connection to its own worker thread. A
// worker performs the upgrade handshake, registers the viewer with the
// coordinator, then alternates between draining its send queue and polling
// the socket for a client-side close. Viewer-to-server messages are
// ignored by contract; the server only ever emits binary FLV frames plus
// a close frame.

use crate::client::{queue_pair, CloseReason, ViewerId, ViewerMsg};
use crate::coordinator::Event;
use crate::error::{Error, Result};
use crossbeam_channel::{RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::{Message, WebSocket};

const STATUS_RUN: usize = 0;
const STATUS_END: usize = 1;

/// Idle sleep of the non-blocking accept loop.
const ACCEPT_IDLE: Duration = Duration::from_millis(100);

/// Upgrade handshake must finish within this budget.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket read timeout once streaming; bounds the close-detection latency.
const SOCKET_POLL: Duration = Duration::from_millis(10);

/// How long a worker waits on its queue before polling the socket.
const QUEUE_POLL: Duration = Duration::from_millis(25);

/// A socket write that stalls longer than this counts as a dead viewer.
const WRITE_STALL: Duration = Duration::from_secs(5);

/// Close-handshake polls before the worker gives up waiting for the ack.
const CLOSE_DRAIN_POLLS: usize = 50;

pub struct WsServer {
    local_addr: SocketAddr,
    status: Arc<AtomicUsize>,
    accept_thread: Option<JoinHandle<()>>,
}

impl WsServer {
    /// Binds the listener and starts accepting viewers. Each accepted
    /// connection gets a dedicated worker thread wired to the coordinator
    /// mailbox.
    pub fn start(
        host: &str,
        port: u16,
        events: Sender<Event>,
        queue_capacity: usize,
    ) -> Result<WsServer> {
        let listener = TcpListener::bind((host, port))
            .map_err(|e| Error::Server(format!("bind {host}:{port}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Server(format!("local_addr: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::Server(format!("set_nonblocking: {e}")))?;

        let status = Arc::new(AtomicUsize::new(STATUS_RUN));
        let accept_status = status.clone();
        let accept_thread = std::thread::Builder::new()
            .name("ws-accept".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            let peer = match stream.peer_addr() {
                                Ok(peer) => peer,
                                Err(_) => continue,
                            };
                            let events = events.clone();
                            let capacity = queue_capacity;
                            let spawned = std::thread::Builder::new()
                                .name(format!("viewer-{peer}"))
                                .spawn(move || viewer_worker(stream, peer, events, capacity));
                            if let Err(e) = spawned {
                                warn!("could not spawn worker for {peer}: {e}");
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            if accept_status.load(Ordering::Acquire) == STATUS_END {
                                info!("listener stopped");
                                break;
                            }
                            std::thread::sleep(ACCEPT_IDLE);
                        }
                        Err(e) => {
                            debug!("accept error: {e}");
                        }
                    }
                }
            })
            .map_err(|e| Error::Server(format!("accept thread: {e}")))?;

        info!("listening on ws://{local_addr}/");
        Ok(WsServer {
            local_addr,
            status,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new viewers. Existing workers wind down through
    /// their queues (the coordinator closes them on shutdown).
    pub fn stop(&mut self) {
        self.status.store(STATUS_END, Ordering::Release);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn viewer_worker(stream: TcpStream, peer: SocketAddr, events: Sender<Event>, capacity: usize) {
    let _ = stream.set_nodelay(true);
    if stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).is_err()
        || stream.set_write_timeout(Some(WRITE_STALL)).is_err()
    {
        return;
    }

    let mut ws = match tungstenite::accept(stream) {
        Ok(ws) => ws,
        Err(e) => {
            debug!("handshake with {peer} failed: {e}");
            return;
        }
    };
    let _ = ws.get_ref().set_read_timeout(Some(SOCKET_POLL));

    let id = ViewerId::next();
    let (queue, rx) = queue_pair(capacity);
    if events
        .send(Event::ViewerConnect { id, peer, queue })
        .is_err()
    {
        let _ = ws.close(None);
        return;
    }

    let mut close_reason = None;
    'conn: loop {
        match rx.recv_timeout(QUEUE_POLL) {
            Ok(first) => {
                // Drain everything queued behind the first message before
                // touching the socket again.
                let mut next = Some(first);
                while let Some(msg) = next.take() {
                    match msg {
                        ViewerMsg::Data(data) => {
                            if let Err(e) = ws.send(Message::Binary(data.to_vec())) {
                                debug!("{id} send failed: {e}");
                                break 'conn;
                            }
                        }
                        ViewerMsg::Close(reason) => {
                            close_reason = Some(reason);
                            break 'conn;
                        }
                    }
                    next = rx.try_recv().ok();
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        match ws.read() {
            Ok(Message::Close(_)) => {
                debug!("{id} sent close");
                break;
            }
            // Anything else a viewer sends is ignored by contract.
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e)) if is_timeout(e) => {}
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                break;
            }
            Err(e) => {
                debug!("{id} transport error: {e}");
                break;
            }
        }
    }

    if let Some(reason) = close_reason {
        send_close(&mut ws, reason);
    }
    let _ = events.send(Event::ViewerDisconnect { id });
    debug!("{id} worker exited");
}

fn send_close(ws: &mut WebSocket<TcpStream>, reason: CloseReason) {
    let frame = CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: "".into(),
    };
    if ws.close(Some(frame)).is_err() {
        return;
    }
    let _ = ws.flush();
    // Give the peer a bounded chance to ack the close.
    for _ in 0..CLOSE_DRAIN_POLLS {
        match ws.read() {
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e)) if is_timeout(e) => {}
            Err(_) => break,
        }
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_viewer_session_end_to_end() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut server = WsServer::start("127.0.0.1", 0, tx, 1024 * 1024).unwrap();
        let addr = server.local_addr();

        // Stand-in coordinator: greet the viewer with one binary chunk,
        // then close normally, then wait for the worker exit event.
        let coordinator = std::thread::spawn(move || {
            let queue = loop {
                match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                    Event::ViewerConnect { queue, .. } => break queue,
                    _ => continue,
                }
            };
            assert!(queue.try_send(Bytes::from_static(b"FLV\x01stream-bytes")));
            queue.close(CloseReason::Normal);
            loop {
                match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                    Event::ViewerDisconnect { .. } => break,
                    _ => continue,
                }
            }
        });

        let (mut ws, _response) = tungstenite::connect(format!("ws://{addr}/")).unwrap();
        // Client chatter must be ignored, not answered.
        ws.send(Message::Text("hello?".to_string())).unwrap();

        let msg = ws.read().unwrap();
        match msg {
            Message::Binary(data) => assert_eq!(data, b"FLV\x01stream-bytes"),
            other => panic!("expected binary frame, got {other:?}"),
        }

        // Next comes the server's normal close.
        let frame = loop {
            match ws.read() {
                Ok(Message::Close(frame)) => break frame,
                Ok(_) => continue,
                Err(e) => panic!("expected close frame, got {e}"),
            }
        };
        assert_eq!(frame.unwrap().code, CloseCode::Normal);

        coordinator.join().unwrap();
        server.stop();
    }

    #[test]
    fn test_policy_close_carries_1008() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut server = WsServer::start("127.0.0.1", 0, tx, 1024).unwrap();
        let addr = server.local_addr();

        let coordinator = std::thread::spawn(move || loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                Event::ViewerConnect { queue, .. } => queue.close(CloseReason::Policy),
                Event::ViewerDisconnect { .. } => break,
                _ => continue,
            }
        });

        let (mut ws, _response) = tungstenite::connect(format!("ws://{addr}/")).unwrap();
        let frame = loop {
            match ws.read() {
                Ok(Message::Close(frame)) => break frame,
                Ok(_) => continue,
                Err(e) => panic!("expected close frame, got {e}"),
            }
        };
        assert_eq!(u16::from(frame.unwrap().code), 1008);

        coordinator.join().unwrap();
        server.stop();
    }
}
