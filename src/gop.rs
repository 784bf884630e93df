// src/gop.rs - Bootstrap cache for late joiners
//
// Holds the FLV header prefix (header + onMetaData tag), the previous
// complete GOP and the GOP currently being written. A fresh viewer that
// receives `bootstrap()` followed by the live stream starts at a keyframe
// and decodes immediately.
//
// The buffer never holds more than the header prefix plus two GOPs; a GOP
// that grows past the byte cap is discarded and accumulation pauses until
// the next keyframe.

use crate::flv::{FlvScanner, ScanEvent, Tag, TAG_TYPE_AUDIO, TAG_TYPE_SCRIPT, TAG_TYPE_VIDEO};
use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use std::collections::VecDeque;

/// Cap on a single cached GOP. Keyframe interval times bitrate stays far
/// below this for any sane encoder configuration.
pub const DEFAULT_MAX_GOP_BYTES: usize = 16 * 1024 * 1024;

/// Complete GOPs retained in addition to the one being written.
const FROZEN_GOPS: usize = 1;

#[derive(Debug, Clone, Default)]
pub struct GopStats {
    pub header_bytes: usize,
    pub metadata_bytes: usize,
    pub frozen_gops: usize,
    pub current_tags: usize,
    pub ready: bool,
}

pub struct GopBuffer {
    scanner: FlvScanner,
    header: Option<Bytes>,
    metadata: Option<Bytes>,
    /// Set once the metadata window has passed (first a/v tag seen).
    header_sealed: bool,
    frozen: VecDeque<Bytes>,
    current: Vec<Bytes>,
    current_bytes: usize,
    /// After a reset, desync or an oversized GOP, tags are skipped until
    /// the next keyframe opens a clean GOP.
    awaiting_keyframe: bool,
    max_gop_bytes: usize,
    events: Vec<ScanEvent>,
}

impl Default for GopBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl GopBuffer {
    pub fn new() -> Self {
        Self::with_max_gop_bytes(DEFAULT_MAX_GOP_BYTES)
    }

    pub fn with_max_gop_bytes(max_gop_bytes: usize) -> Self {
        Self {
            scanner: FlvScanner::new(),
            header: None,
            metadata: None,
            header_sealed: false,
            frozen: VecDeque::with_capacity(FROZEN_GOPS),
            current: Vec::new(),
            current_bytes: 0,
            awaiting_keyframe: false,
            max_gop_bytes,
            events: Vec::new(),
        }
    }

    /// Consumes a raw chunk from the encoder. Forwarding the same chunk to
    /// viewers is the caller's job; this only maintains bootstrap state.
    pub fn ingest(&mut self, chunk: &[u8]) {
        let mut events = std::mem::take(&mut self.events);
        events.clear();
        self.scanner.push(chunk, &mut events);
        for event in events.drain(..) {
            match event {
                ScanEvent::Header(bytes) => {
                    debug!("FLV header captured ({} bytes)", bytes.len());
                    self.header = Some(bytes);
                }
                ScanEvent::Tag(tag) => self.handle_tag(tag),
                ScanEvent::Desync => {
                    // Hold what we have; the interrupted GOP must not be
                    // extended across the gap, so cache nothing until the
                    // next keyframe.
                    warn!("FLV stream desynced; bootstrap frozen until a clean tag boundary");
                    self.awaiting_keyframe = true;
                }
            }
        }
        self.events = events;
    }

    /// Bytes a fresh decoder needs: header prefix, previous GOP, current
    /// GOP. Empty until the header has been observed.
    pub fn bootstrap(&self) -> Bytes {
        let Some(header) = &self.header else {
            return Bytes::new();
        };
        let metadata_len = self.metadata.as_ref().map_or(0, |m| m.len());
        let frozen_len: usize = self.frozen.iter().map(|g| g.len()).sum();
        let mut out =
            BytesMut::with_capacity(header.len() + metadata_len + frozen_len + self.current_bytes);
        out.extend_from_slice(header);
        if let Some(metadata) = &self.metadata {
            out.extend_from_slice(metadata);
        }
        for gop in &self.frozen {
            out.extend_from_slice(gop);
        }
        for tag in &self.current {
            out.extend_from_slice(tag);
        }
        out.freeze()
    }

    /// True once a late joiner would actually get a keyframe out of
    /// `bootstrap()`.
    pub fn is_ready(&self) -> bool {
        self.header.is_some() && (!self.frozen.is_empty() || !self.current.is_empty())
    }

    /// Discards everything; used when the encoder restarts.
    pub fn reset(&mut self) {
        self.scanner.reset();
        self.header = None;
        self.metadata = None;
        self.header_sealed = false;
        self.frozen.clear();
        self.current.clear();
        self.current_bytes = 0;
        self.awaiting_keyframe = false;
        debug!("GOP buffer reset");
    }

    pub fn stats(&self) -> GopStats {
        GopStats {
            header_bytes: self.header.as_ref().map_or(0, |h| h.len()),
            metadata_bytes: self.metadata.as_ref().map_or(0, |m| m.len()),
            frozen_gops: self.frozen.len(),
            current_tags: self.current.len(),
            ready: self.is_ready(),
        }
    }

    fn handle_tag(&mut self, tag: Tag) {
        if !self.header_sealed {
            match tag.tag_type {
                TAG_TYPE_SCRIPT if tag.is_metadata && self.metadata.is_none() => {
                    debug!("onMetaData captured ({} bytes)", tag.bytes.len());
                    self.metadata = Some(tag.bytes);
                    self.header_sealed = true;
                    return;
                }
                TAG_TYPE_SCRIPT => return,
                // First audio/video tag ends the metadata window.
                _ => self.header_sealed = true,
            }
        }

        match tag.tag_type {
            TAG_TYPE_VIDEO if tag.is_keyframe => {
                self.freeze_current();
                self.awaiting_keyframe = false;
                self.push_current(tag.bytes);
            }
            TAG_TYPE_VIDEO | TAG_TYPE_AUDIO => {
                // Tags before the first keyframe are undecodable on their
                // own and are not cached.
                if !self.awaiting_keyframe && !self.current.is_empty() {
                    self.push_current(tag.bytes);
                }
            }
            _ => {}
        }
    }

    fn push_current(&mut self, bytes: Bytes) {
        self.current_bytes += bytes.len();
        self.current.push(bytes);
        if self.current_bytes > self.max_gop_bytes {
            warn!(
                "current GOP exceeded {} bytes without a keyframe; discarding",
                self.max_gop_bytes
            );
            self.drop_current();
        }
    }

    fn freeze_current(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let mut gop = BytesMut::with_capacity(self.current_bytes);
        for tag in self.current.drain(..) {
            gop.extend_from_slice(&tag);
        }
        self.current_bytes = 0;
        if self.frozen.len() >= FROZEN_GOPS {
            self.frozen.pop_front();
        }
        self.frozen.push_back(gop.freeze());
    }

    fn drop_current(&mut self) {
        self.current.clear();
        self.current_bytes = 0;
        self.awaiting_keyframe = true;
    }

    #[cfg(test)]
    fn frozen_count(&self) -> usize {
        self.frozen.len()
    }

    #[cfg(test)]
    fn current_len(&self) -> usize {
        self.current.len()
    }
}
