//! Frame extraction from a chunked byte stream.
//!
//! A [`FrameDecoder`] accumulates arbitrary-sized chunks and hands back every complete
//! JSON-object candidate found so far, keeping the incomplete remainder for the next
//! call. Adapters only see the trait, so the matching policy can be swapped without
//! touching them.
//!
//! Two policies exist:
//!
//! - [`BraceFrameDecoder`] (default) pairs the first `{` with the first `}` after it.
//!   It does **not** count nesting: `{"a":{"b":1}}` yields the candidate `{"a":{"b":1}`
//!   (which then fails to parse) and leaves `}` behind. Devices in the field only send
//!   flat objects and this behavior is kept for compatibility.
//! - [`DepthAwareFrameDecoder`] tracks brace depth and JSON string literals. Opt-in.
//!
//! Both keep raw bytes and decode each candidate with lossy UTF-8, so undecodable bytes
//! are replaced instead of failing and a multi-byte character split across two chunks
//! survives. Both cap the retained buffer; on overflow the buffer is discarded and a
//! warning is logged.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default cap on retained, not-yet-framed bytes.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 64 * 1024;

/// Turns a chunked byte stream into JSON-object candidates.
pub trait FrameDecoder: Send {
    /// Ingest a chunk and return every complete candidate, in stream order.
    fn feed(&mut self, chunk: &[u8]) -> Vec<String>;

    /// Drop any buffered bytes.
    fn reset(&mut self);

    /// Number of bytes currently retained.
    fn buffered_len(&self) -> usize;

    /// Number of times the buffer was discarded for exceeding its cap.
    fn overflows(&self) -> u64;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Which [`FrameDecoder`] an adapter builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingStrategy {
    /// First `{` to first following `}`; not nesting-aware.
    #[default]
    Brace,
    /// Depth-counting scanner that respects string literals.
    DepthAware,
}

impl FramingStrategy {
    /// Build a decoder for this strategy.
    pub fn build(self, max_buffer_bytes: usize) -> Box<dyn FrameDecoder> {
        match self {
            FramingStrategy::Brace => Box::new(BraceFrameDecoder::with_capacity_limit(max_buffer_bytes)),
            FramingStrategy::DepthAware => {
                Box::new(DepthAwareFrameDecoder::with_capacity_limit(max_buffer_bytes))
            }
        }
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Discard everything when the retained bytes exceed `max`. Returns true on overflow.
fn enforce_cap(buffer: &mut BytesMut, max: usize, decoder: &'static str) -> bool {
    if buffer.len() <= max {
        return false;
    }
    warn!(
        decoder,
        retained = buffer.len(),
        limit = max,
        "Frame buffer exceeded its cap without a complete frame; discarding"
    );
    buffer.clear();
    true
}

/// Naive brace matcher: first `{`, first `}` at or after it.
pub struct BraceFrameDecoder {
    buffer: BytesMut,
    max_buffer_bytes: usize,
    overflows: u64,
}

impl BraceFrameDecoder {
    /// Decoder with the default buffer cap.
    pub fn new() -> Self {
        Self::with_capacity_limit(DEFAULT_MAX_BUFFER_BYTES)
    }

    /// Decoder retaining at most `max_buffer_bytes` between calls.
    pub fn with_capacity_limit(max_buffer_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            max_buffer_bytes: max_buffer_bytes.max(1),
            overflows: 0,
        }
    }
}

impl Default for BraceFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder for BraceFrameDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = self.buffer.iter().position(|&b| b == b'{') else {
                // Nothing here can ever start a frame.
                self.buffer.clear();
                break;
            };
            let Some(len) = self.buffer[start..].iter().position(|&b| b == b'}') else {
                self.buffer.advance(start);
                break;
            };
            let end = start + len + 1;
            frames.push(lossy(&self.buffer[start..end]));
            self.buffer.advance(end);
        }

        let name = self.name();
        if enforce_cap(&mut self.buffer, self.max_buffer_bytes, name) {
            self.overflows += 1;
        }
        frames
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn overflows(&self) -> u64 {
        self.overflows
    }

    fn name(&self) -> &'static str {
        "brace"
    }
}

/// Depth-counting scanner. Braces inside string literals are ignored.
///
/// Scan state survives between calls, so each byte is looked at once.
pub struct DepthAwareFrameDecoder {
    buffer: BytesMut,
    max_buffer_bytes: usize,
    overflows: u64,
    /// Bytes of `buffer` already scanned.
    scanned: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl DepthAwareFrameDecoder {
    /// Decoder with the default buffer cap.
    pub fn new() -> Self {
        Self::with_capacity_limit(DEFAULT_MAX_BUFFER_BYTES)
    }

    /// Decoder retaining at most `max_buffer_bytes` between calls.
    pub fn with_capacity_limit(max_buffer_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            max_buffer_bytes: max_buffer_bytes.max(1),
            overflows: 0,
            scanned: 0,
            depth: 0,
            in_string: false,
            escaped: false,
        }
    }

    fn clear_state(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }
}

impl Default for DepthAwareFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder for DepthAwareFrameDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while self.scanned < self.buffer.len() {
            let byte = self.buffer[self.scanned];

            if self.depth == 0 {
                if byte == b'{' {
                    // Drop inter-frame garbage so the frame starts at offset 0.
                    self.buffer.advance(self.scanned);
                    self.scanned = 1;
                    self.depth = 1;
                } else {
                    self.scanned += 1;
                }
                continue;
            }

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
            } else {
                match byte {
                    b'"' => self.in_string = true,
                    b'{' => self.depth += 1,
                    b'}' => self.depth -= 1,
                    _ => {}
                }
            }
            self.scanned += 1;

            if self.depth == 0 {
                frames.push(lossy(&self.buffer[..self.scanned]));
                self.buffer.advance(self.scanned);
                self.scanned = 0;
            }
        }

        if self.depth == 0 {
            // Only garbage left.
            self.clear_state();
        } else if self.buffer.len() > self.max_buffer_bytes {
            let name = self.name();
            enforce_cap(&mut self.buffer, self.max_buffer_bytes, name);
            self.clear_state();
            self.overflows += 1;
        }
        frames
    }

    fn reset(&mut self) {
        self.clear_state();
    }

    fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn overflows(&self) -> u64 {
        self.overflows
    }

    fn name(&self) -> &'static str {
        "depth_aware"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_objects_in_one_chunk() {
        let mut decoder = BraceFrameDecoder::new();
        let frames = decoder.feed(br#"{"a":1}{"b":2}"#);
        assert_eq!(frames, vec![r#"{"a":1}"#.to_string(), r#"{"b":2}"#.to_string()]);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn object_split_across_feeds() {
        let mut decoder = BraceFrameDecoder::new();
        assert!(decoder.feed(br#"{"a":1"#).is_empty());
        assert_eq!(decoder.feed(b"}"), vec![r#"{"a":1}"#.to_string()]);
    }

    #[test]
    fn garbage_between_frames_is_skipped() {
        let mut decoder = BraceFrameDecoder::new();
        let frames = decoder.feed(b"boot ok\r\n{\"a\":1}\n\nnoise{\"b\":2}\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn nested_object_is_truncated_by_brace_policy() {
        let mut decoder = BraceFrameDecoder::new();
        let frames = decoder.feed(br#"{"a":{"b":1}}"#);
        assert_eq!(frames, vec![r#"{"a":{"b":1}"#.to_string()]);
        // The trailing brace can never start a frame.
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let mut decoder = BraceFrameDecoder::new();
        let frames = decoder.feed(b"{\"s\":\"\xff\"}");
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains('\u{FFFD}'));
    }

    #[test]
    fn multibyte_char_split_across_chunks_survives() {
        let text = "{\"s\":\"°C\"}".as_bytes();
        let split = text.iter().position(|&b| b == 0xC2).unwrap() + 1;
        let mut decoder = BraceFrameDecoder::new();
        assert!(decoder.feed(&text[..split]).is_empty());
        assert_eq!(decoder.feed(&text[split..]), vec!["{\"s\":\"°C\"}".to_string()]);
    }

    #[test]
    fn unbalanced_open_braces_respect_cap() {
        let mut decoder = BraceFrameDecoder::with_capacity_limit(4096);
        let flood = vec![b'{'; 10_000];
        assert!(decoder.feed(&flood).is_empty());
        assert!(decoder.buffered_len() <= 4096);
        assert_eq!(decoder.overflows(), 1);

        // Still usable afterwards.
        assert_eq!(decoder.feed(br#"{"a":1}"#).len(), 1);
    }

    #[test]
    fn unbalanced_open_braces_in_small_chunks_respect_cap() {
        let mut decoder = BraceFrameDecoder::with_capacity_limit(1024);
        for _ in 0..10_000 {
            decoder.feed(b"{");
            assert!(decoder.buffered_len() <= 1024);
        }
    }

    #[test]
    fn depth_aware_handles_nesting_and_strings() {
        let mut decoder = DepthAwareFrameDecoder::new();
        let frames = decoder.feed(br#"{"a":{"b":1}}{"s":"}{\"}"}"#);
        assert_eq!(
            frames,
            vec![r#"{"a":{"b":1}}"#.to_string(), r#"{"s":"}{\"}"}"#.to_string()]
        );
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn depth_aware_resumes_across_feeds() {
        let mut decoder = DepthAwareFrameDecoder::new();
        assert!(decoder.feed(br#"xx{"a":{"b""#).is_empty());
        assert!(decoder.feed(br#":"}"}"#).is_empty());
        assert_eq!(decoder.feed(b"}\n"), vec![r#"{"a":{"b":"}"}}"#.to_string()]);
    }

    #[test]
    fn depth_aware_respects_cap() {
        let mut decoder = DepthAwareFrameDecoder::with_capacity_limit(512);
        assert!(decoder.feed(&vec![b'{'; 10_000]).is_empty());
        assert!(decoder.buffered_len() <= 512);
        assert_eq!(decoder.overflows(), 1);
        assert_eq!(decoder.feed(br#"{"a":1}"#).len(), 1);
    }

    #[test]
    fn strategy_builds_matching_decoder() {
        assert_eq!(FramingStrategy::Brace.build(128).name(), "brace");
        assert_eq!(FramingStrategy::DepthAware.build(128).name(), "depth_aware");
    }
}
