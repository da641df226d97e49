//! Server-sent event framing.
//!
//! Upstream chunks arrive at arbitrary byte boundaries; the relay needs
//! whole events to recognise the end marker and to avoid forwarding half an
//! event when an attempt dies.

use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;

pub const DONE_EVENT: &[u8] = b"data: [DONE]\n\n";

/// Default cap on a single unterminated event.
pub const DEFAULT_MAX_EVENT_BYTES: usize = 1024 * 1024;

/// An upstream event grew past the framer's limit without a terminator.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("upstream event exceeds {limit} bytes without a terminator")]
pub struct EventTooLarge {
    pub limit: usize,
}

/// Splits a byte stream into complete `\n\n`-terminated events.
///
/// Carriage returns are dropped so `\r\n\r\n` separators work too. At most
/// `max_pending` bytes of an unfinished event are held.
#[derive(Debug)]
pub struct SseFramer {
    buf: BytesMut,
    /// Prefix of `buf` already searched for a separator.
    scanned: usize,
    max_pending: usize,
}

impl Default for SseFramer {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_EVENT_BYTES)
    }
}

impl SseFramer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scanned: 0,
            max_pending,
        }
    }

    /// Feed a chunk, returning every event it completes.
    ///
    /// # Errors
    /// `EventTooLarge` once the unterminated remainder passes the limit. The
    /// framer should be reset before it is used again.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, EventTooLarge> {
        self.buf
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        let mut events = Vec::new();
        while let Some(pos) = self.next_separator() {
            let mut event = self.buf.split_to(pos + 2);
            self.scanned = 0;
            // Collapse extra blank lines between events.
            if event.len() == 2 {
                continue;
            }
            let leading = event.iter().take_while(|b| **b == b'\n').count();
            event.advance(leading);
            events.push(event.freeze());
        }
        self.scanned = self.buf.len();
        if self.buf.len() > self.max_pending {
            return Err(EventTooLarge {
                limit: self.max_pending,
            });
        }
        Ok(events)
    }

    /// Start of the next `\n\n`, resuming where the last search stopped.
    fn next_separator(&self) -> Option<usize> {
        // Back up one byte: the separator may straddle two chunks.
        let from = self.scanned.saturating_sub(1);
        self.buf[from..]
            .windows(2)
            .position(|w| w == b"\n\n")
            .map(|pos| from + pos)
    }

    /// Bytes of an event that has not been terminated yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Whatever is left at a clean end of body, as a terminated event.
    pub fn finish(&mut self) -> Option<Bytes> {
        let rest = self.buf.split();
        self.scanned = 0;
        let trimmed = rest.as_ref().trim_ascii();
        if trimmed.is_empty() {
            return None;
        }
        let mut event = BytesMut::with_capacity(trimmed.len() + 2);
        event.extend_from_slice(trimmed);
        event.extend_from_slice(b"\n\n");
        Some(event.freeze())
    }

    /// Drop a partial event, e.g. when its attempt failed.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }
}

/// True for the `data: [DONE]` end marker.
#[must_use]
pub fn is_done_event(event: &[u8]) -> bool {
    event
        .split(|b| *b == b'\n')
        .filter_map(|line| line.strip_prefix(b"data:"))
        .any(|data| data.trim_ascii() == b"[DONE]")
}

/// `data: <json>\n\n`.
///
/// # Errors
/// Serialization failures.
pub fn data_event<T: Serialize>(payload: &T) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_vec(payload)?;
    let mut out = BytesMut::with_capacity(json.len() + 8);
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(&json);
    out.extend_from_slice(b"\n\n");
    Ok(out.freeze())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn events_split_across_chunks() {
        let mut f = SseFramer::new();
        assert!(f.push(b"data: {\"a\"").unwrap().is_empty());
        let out = f.push(b":1}\n\ndata: {\"b\":2}\n").unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"data: {\"a\":1}\n\n")]);
        assert!(f.pending() > 0);
        let out = f.push(b"\n").unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"data: {\"b\":2}\n\n")]);
        assert_eq!(f.pending(), 0);
    }

    #[test]
    fn crlf_separators() {
        let mut f = SseFramer::new();
        let out = f.push(b"data: x\r\n\r\ndata: y\r\n\r\n").unwrap();
        assert_eq!(
            out,
            vec![
                Bytes::from_static(b"data: x\n\n"),
                Bytes::from_static(b"data: y\n\n"),
            ]
        );
    }

    #[test]
    fn extra_blank_lines_are_skipped() {
        let mut f = SseFramer::new();
        let out = f.push(b"\n\n\ndata: x\n\n\n\n").unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"data: x\n\n")]);
    }

    #[test]
    fn done_marker_detection() {
        assert!(is_done_event(b"data: [DONE]\n\n"));
        assert!(is_done_event(b"data:[DONE]\n\n"));
        assert!(!is_done_event(b"data: {\"text\":\"[DONE]\"}\n\n"));
        assert!(!is_done_event(b": keep-alive\n\n"));
    }

    #[test]
    fn finish_terminates_leftover() {
        let mut f = SseFramer::new();
        f.push(b"data: tail").unwrap();
        assert_eq!(f.finish(), Some(Bytes::from_static(b"data: tail\n\n")));
        assert_eq!(f.finish(), None);
    }

    #[test]
    fn reset_drops_partial_event() {
        let mut f = SseFramer::new();
        f.push(b"data: half").unwrap();
        f.reset();
        assert_eq!(f.pending(), 0);
        assert_eq!(f.finish(), None);
    }

    #[test]
    fn separator_split_across_chunks() {
        let mut f = SseFramer::new();
        assert!(f.push(b"data: a\n").unwrap().is_empty());
        let out = f.push(b"\ndata: b").unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"data: a\n\n")]);
        assert_eq!(f.pending(), b"data: b".len());
    }

    #[test]
    fn unterminated_event_is_capped() {
        let mut f = SseFramer::with_limit(64);
        let chunk = [b'x'; 32];
        assert!(f.push(&chunk).unwrap().is_empty());
        assert!(f.push(&chunk).unwrap().is_empty());
        assert_eq!(f.push(&chunk), Err(EventTooLarge { limit: 64 }));

        f.reset();
        let out = f.push(b"data: ok\n\n").unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"data: ok\n\n")]);
    }

    #[test]
    fn completed_events_do_not_count_toward_the_cap() {
        let mut f = SseFramer::with_limit(16);
        let out = f.push(b"data: 0123456789abcdef\n\ndata: t").unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(f.pending(), b"data: t".len());
    }

    #[test]
    fn data_event_wraps_json() {
        let ev = data_event(&serde_json::json!({"k": 1})).unwrap();
        assert_eq!(&ev[..], b"data: {\"k\":1}\n\n");
    }
}
