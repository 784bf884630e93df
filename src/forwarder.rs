// src/forwarder.rs - Encoder stdout pump
//
// A dedicated thread performs the blocking pipe reads so the coordinator
// loop never waits on the encoder. Chunks are tagged with the encoder run
// generation; events from a dead run are discarded by the coordinator.

use crate::coordinator::Event;
use bytes::Bytes;
use crossbeam_channel::Sender;
use log::debug;
use std::io::Read;
use std::thread::JoinHandle;

/// Read size per pipe read.
pub const READ_CHUNK_SIZE: usize = 8192;

/// Forwarding counters, owned by the coordinator.
#[derive(Debug, Default, Clone)]
pub struct ForwarderStats {
    pub bytes_read: u64,
    pub chunks: u64,
    pub viewers_evicted: u64,
}

impl ForwarderStats {
    /// Records one forwarded chunk; true every 1000 chunks as a cue to log.
    pub fn record_chunk(&mut self, len: usize) -> bool {
        self.bytes_read += len as u64;
        self.chunks += 1;
        self.chunks % 1000 == 0
    }
}

/// Spawns the pump thread. It exits on stdout EOF (encoder gone) or when
/// the coordinator mailbox closes.
pub fn spawn(
    mut stdout: Box<dyn Read + Send>,
    generation: u64,
    events: Sender<Event>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("forwarder-{generation}"))
        .spawn(move || {
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) => {
                        debug!("encoder stdout EOF (generation {generation})");
                        let _ = events.send(Event::EncoderEof { generation });
                        break;
                    }
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        if events.send(Event::EncoderData { generation, chunk }).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("encoder stdout read failed: {e}");
                        let _ = events.send(Event::EncoderEof { generation });
                        break;
                    }
                }
            }
        })
}
