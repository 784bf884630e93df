// src/flv.rs - Incremental FLV stream scanner
//
// Parses just enough of the container to find the header, tag boundaries
// and keyframes. Never blocks and never rewrites bytes; a malformed stream
// flips the scanner into a desynced state where it hunts for the next
// plausible tag boundary while callers keep forwarding raw bytes.

use bytes::{Bytes, BytesMut};

/// Fixed FLV file header length ("FLV", version, flags, data offset).
pub const HEADER_LEN: usize = 9;
/// Length of a PreviousTagSize field.
pub const PREV_TAG_SIZE_LEN: usize = 4;
/// Tag header: type(1) + data size(3) + timestamp(3) + ts-ext(1) + stream id(3).
pub const TAG_HEADER_LEN: usize = 11;

pub const TAG_TYPE_AUDIO: u8 = 8;
pub const TAG_TYPE_VIDEO: u8 = 9;
pub const TAG_TYPE_SCRIPT: u8 = 18;

/// Upper nibble of the first video payload byte for a keyframe.
pub const FRAME_TYPE_KEY: u8 = 1;

/// Tags longer than this are treated as stream corruption. Real encoder
/// output stays far below; the 24-bit size field tops out just under 16 MiB.
const MAX_TAG_DATA: usize = 8 * 1024 * 1024;

/// A complete tag unit: 11-byte tag header, payload, trailing
/// PreviousTagSize. Concatenating the header prefix and tag units
/// reproduces the original byte stream exactly.
#[derive(Debug, Clone)]
pub struct Tag {
    pub tag_type: u8,
    pub timestamp: u32,
    pub is_keyframe: bool,
    pub is_metadata: bool,
    pub bytes: Bytes,
}

#[derive(Debug)]
pub enum ScanEvent {
    /// File header plus PreviousTagSize0, emitted once per stream.
    Header(Bytes),
    Tag(Tag),
    /// The stream stopped making sense; tag events pause until resync.
    Desync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Header,
    Tags,
    Desynced,
}

pub struct FlvScanner {
    buf: BytesMut,
    state: ScanState,
    saw_header: bool,
}

impl Default for FlvScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl FlvScanner {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            state: ScanState::Header,
            saw_header: false,
        }
    }

    pub fn is_desynced(&self) -> bool {
        self.state == ScanState::Desynced
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = ScanState::Header;
        self.saw_header = false;
    }

    /// Feeds a chunk and appends any completed events.
    pub fn push(&mut self, chunk: &[u8], events: &mut Vec<ScanEvent>) {
        self.buf.extend_from_slice(chunk);
        loop {
            match self.state {
                ScanState::Header => {
                    if !self.scan_header(events) {
                        break;
                    }
                }
                ScanState::Tags => {
                    if !self.scan_tag(events) {
                        break;
                    }
                }
                ScanState::Desynced => {
                    if !self.try_resync() {
                        break;
                    }
                    self.state = ScanState::Tags;
                }
            }
        }
    }

    fn scan_header(&mut self, events: &mut Vec<ScanEvent>) -> bool {
        if self.buf.len() < HEADER_LEN {
            return false;
        }
        if &self.buf[0..3] != b"FLV" {
            log::warn!("stream does not start with an FLV signature");
            self.enter_desync(events);
            return false;
        }
        let data_offset = be_u32(&self.buf[5..9]) as usize;
        if data_offset < HEADER_LEN || data_offset > HEADER_LEN + 1024 {
            log::warn!("implausible FLV data offset {data_offset}");
            self.enter_desync(events);
            return false;
        }
        let prefix_len = data_offset + PREV_TAG_SIZE_LEN;
        if self.buf.len() < prefix_len {
            return false;
        }
        let header = self.buf.split_to(prefix_len).freeze();
        self.saw_header = true;
        events.push(ScanEvent::Header(header));
        self.state = ScanState::Tags;
        true
    }

    fn scan_tag(&mut self, events: &mut Vec<ScanEvent>) -> bool {
        if self.buf.len() < TAG_HEADER_LEN {
            return false;
        }
        let tag_type = self.buf[0];
        let data_size = be_u24(&self.buf[1..4]) as usize;
        if !is_tag_type(tag_type) || data_size > MAX_TAG_DATA {
            log::warn!("malformed FLV tag (type {tag_type}, size {data_size})");
            self.enter_desync(events);
            return false;
        }
        let total = TAG_HEADER_LEN + data_size + PREV_TAG_SIZE_LEN;
        if self.buf.len() < total {
            return false;
        }

        let timestamp = (u32::from(self.buf[7]) << 24) | be_u24(&self.buf[4..7]);
        let payload = &self.buf[TAG_HEADER_LEN..TAG_HEADER_LEN + data_size];
        let is_keyframe =
            tag_type == TAG_TYPE_VIDEO && !payload.is_empty() && payload[0] >> 4 == FRAME_TYPE_KEY;
        let is_metadata = tag_type == TAG_TYPE_SCRIPT && is_on_metadata(payload);

        let bytes = self.buf.split_to(total).freeze();
        events.push(ScanEvent::Tag(Tag {
            tag_type,
            timestamp,
            is_keyframe,
            is_metadata,
            bytes,
        }));
        true
    }

    fn enter_desync(&mut self, events: &mut Vec<ScanEvent>) {
        self.state = ScanState::Desynced;
        events.push(ScanEvent::Desync);
        if !self.saw_header {
            // The header cannot reappear mid-stream; nothing to resync to.
            self.buf.clear();
        }
    }

    /// Looks for the next byte offset that could start a tag. Returns true
    /// when the buffer now begins at a plausible boundary.
    fn try_resync(&mut self) -> bool {
        if !self.saw_header {
            self.buf.clear();
            return false;
        }
        for i in 0..self.buf.len() {
            if !is_tag_type(self.buf[i]) {
                continue;
            }
            if self.buf.len() - i < TAG_HEADER_LEN {
                // Possible boundary at the tail; keep it and wait for more.
                let _ = self.buf.split_to(i);
                return false;
            }
            if plausible_tag_header(&self.buf[i..]) {
                let _ = self.buf.split_to(i);
                return true;
            }
        }
        // Nothing plausible; keep only a partial-header tail.
        let keep = TAG_HEADER_LEN - 1;
        if self.buf.len() > keep {
            let drop = self.buf.len() - keep;
            let _ = self.buf.split_to(drop);
        }
        false
    }
}

fn is_tag_type(byte: u8) -> bool {
    matches!(byte, TAG_TYPE_AUDIO | TAG_TYPE_VIDEO | TAG_TYPE_SCRIPT)
}

fn plausible_tag_header(buf: &[u8]) -> bool {
    debug_assert!(buf.len() >= TAG_HEADER_LEN);
    let data_size = be_u24(&buf[1..4]) as usize;
    if data_size > MAX_TAG_DATA {
        return false;
    }
    // Stream id is always zero in FLV.
    buf[8] == 0 && buf[9] == 0 && buf[10] == 0
}

/// AMF0 string "onMetaData" at the start of a script payload.
fn is_on_metadata(payload: &[u8]) -> bool {
    const NAME: &[u8] = b"onMetaData";
    payload.len() >= 3 + NAME.len()
        && payload[0] == 0x02
        && usize::from(u16::from_be_bytes([payload[1], payload[2]])) == NAME.len()
        && payload[3..3 + NAME.len()].eq_ignore_ascii_case(NAME)
}

fn be_u24(buf: &[u8]) -> u32 {
    (u32::from(buf[0]) << 16) | (u32::from(buf[1]) << 8) | u32::from(buf[2])
}

fn be_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// 9-byte FLV header (audio+video flags) plus PreviousTagSize0.
    pub(crate) fn header() -> Vec<u8> {
        let mut bytes = vec![b'F', b'L', b'V', 0x01, 0x05];
        bytes.extend_from_slice(&(HEADER_LEN as u32).to_be_bytes());
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes
    }

    /// Tag unit with trailing PreviousTagSize.
    pub(crate) fn tag(tag_type: u8, timestamp: u32, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(TAG_HEADER_LEN + payload.len() + PREV_TAG_SIZE_LEN);
        bytes.push(tag_type);
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
        bytes.extend_from_slice(&timestamp.to_be_bytes()[1..]);
        bytes.push((timestamp >> 24) as u8);
        bytes.extend_from_slice(&[0, 0, 0]);
        bytes.extend_from_slice(payload);
        bytes.extend_from_slice(&((TAG_HEADER_LEN + payload.len()) as u32).to_be_bytes());
        bytes
    }

    pub(crate) fn video_tag(timestamp: u32, keyframe: bool, body_len: usize) -> Vec<u8> {
        let mut payload = vec![0u8; body_len.max(1)];
        payload[0] = if keyframe { 0x17 } else { 0x27 };
        tag(TAG_TYPE_VIDEO, timestamp, &payload)
    }

    pub(crate) fn audio_tag(timestamp: u32, body_len: usize) -> Vec<u8> {
        tag(TAG_TYPE_AUDIO, timestamp, &vec![0xAFu8; body_len.max(1)])
    }

    pub(crate) fn metadata_tag() -> Vec<u8> {
        let mut payload = vec![0x02, 0x00, 0x0A];
        payload.extend_from_slice(b"onMetaData");
        // A token ECMA array so the payload is not just the name.
        payload.extend_from_slice(&[0x08, 0x00, 0x00, 0x00, 0x00]);
        tag(TAG_TYPE_SCRIPT, 0, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    fn scan(chunks: &[&[u8]]) -> (FlvScanner, Vec<ScanEvent>) {
        let mut scanner = FlvScanner::new();
        let mut events = Vec::new();
        for chunk in chunks {
            scanner.push(chunk, &mut events);
        }
        (scanner, events)
    }

    #[test]
    fn test_header_then_tags() {
        let mut stream = header();
        stream.extend(metadata_tag());
        stream.extend(video_tag(0, true, 16));
        let (_, events) = scan(&[&stream]);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ScanEvent::Header(h) if h.len() == 13));
        match &events[1] {
            ScanEvent::Tag(tag) => {
                assert_eq!(tag.tag_type, TAG_TYPE_SCRIPT);
                assert!(tag.is_metadata);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &events[2] {
            ScanEvent::Tag(tag) => {
                assert_eq!(tag.tag_type, TAG_TYPE_VIDEO);
                assert!(tag.is_keyframe);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_byte_at_a_time_feed() {
        let mut stream = header();
        stream.extend(video_tag(40, true, 8));
        stream.extend(audio_tag(42, 4));
        let chunks: Vec<&[u8]> = stream.chunks(1).collect();
        let (scanner, events) = scan(&chunks);
        assert!(!scanner.is_desynced());
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[2],
            ScanEvent::Tag(tag) if tag.tag_type == TAG_TYPE_AUDIO));
    }

    #[test]
    fn test_tag_units_reassemble_stream() {
        let mut stream = header();
        stream.extend(video_tag(0, true, 8));
        stream.extend(video_tag(33, false, 8));
        let (_, events) = scan(&[&stream]);
        let mut reassembled = Vec::new();
        for event in &events {
            match event {
                ScanEvent::Header(bytes) => reassembled.extend_from_slice(bytes),
                ScanEvent::Tag(tag) => reassembled.extend_from_slice(&tag.bytes),
                ScanEvent::Desync => panic!("desync"),
            }
        }
        assert_eq!(reassembled, stream);
    }

    #[test]
    fn test_extended_timestamp() {
        let mut stream = header();
        stream.extend(video_tag(0x0123_4567, true, 4));
        let (_, events) = scan(&[&stream]);
        match &events[1] {
            ScanEvent::Tag(tag) => assert_eq!(tag.timestamp, 0x0123_4567),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_non_flv_stream_desyncs_without_resync() {
        let (mut scanner, events) = scan(&[b"GARBAGE STREAM DATA"]);
        assert!(matches!(events.last(), Some(ScanEvent::Desync)));
        assert!(scanner.is_desynced());
        // More garbage stays ignored; no header means no recovery.
        let mut events = Vec::new();
        scanner.push(b"more garbage", &mut events);
        assert!(events.is_empty());
        assert!(scanner.is_desynced());
    }

    #[test]
    fn test_desync_and_resync_at_tag_boundary() {
        let mut stream = header();
        stream.extend(video_tag(0, true, 8));
        // Corrupt tag: invalid type byte where a tag should start.
        stream.extend_from_slice(&[0x55, 0x00, 0x00, 0x04, 0, 0, 0, 0, 0, 0, 0]);
        let (mut scanner, events) = scan(&[&stream]);
        assert!(scanner.is_desynced());
        assert!(matches!(events.last(), Some(ScanEvent::Desync)));

        // A clean keyframe tag lets the scanner pick the stream back up.
        let recovery = video_tag(100, true, 8);
        let mut events = Vec::new();
        scanner.push(&recovery, &mut events);
        assert!(!scanner.is_desynced());
        assert!(events
            .iter()
            .any(|e| matches!(e, ScanEvent::Tag(tag) if tag.is_keyframe)));
    }

    #[test]
    fn test_oversized_tag_is_malformed() {
        let mut stream = header();
        // Claimed data size of 0xFFFFFF exceeds the plausibility cap.
        stream.extend_from_slice(&[TAG_TYPE_VIDEO, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0, 0, 0, 0]);
        let (scanner, events) = scan(&[&stream]);
        assert!(scanner.is_desynced());
        assert!(matches!(events.last(), Some(ScanEvent::Desync)));
    }

    #[test]
    fn test_reset_restarts_header_parse() {
        let mut stream = header();
        stream.extend(video_tag(0, true, 8));
        let (mut scanner, _) = scan(&[&stream]);
        scanner.reset();
        let mut events = Vec::new();
        scanner.push(&header(), &mut events);
        assert!(matches!(events.first(), Some(ScanEvent::Header(_))));
    }

    #[test]
    fn test_interframe_not_keyframe() {
        let mut stream = header();
        stream.extend(video_tag(0, false, 8));
        let (_, events) = scan(&[&stream]);
        match &events[1] {
            ScanEvent::Tag(tag) => assert!(!tag.is_keyframe),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
