//! Watch stream framing
//!
//! The API server sends one JSON document per line. Chunk boundaries from
//! the HTTP body do not line up with frames, so bytes are buffered until a
//! newline arrives.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::resource::{EventPhase, StatusBody};

/// Longest line accepted before the buffer is discarded
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// A decoded upstream frame
#[derive(Debug, Clone, PartialEq)]
pub enum WatchFrame {
    /// ADDED, MODIFIED or DELETED with the full object
    Event {
        /// Change phase
        phase: EventPhase,
        /// Resource object
        object: serde_json::Value,
    },
    /// Progress marker carrying only a resource version
    Bookmark {
        /// New cursor, if the server sent one
        resource_version: Option<String>,
    },
    /// Upstream status error
    Error(StatusBody),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    object: serde_json::Value,
}

/// Parse one complete frame
pub fn parse_frame(line: &[u8]) -> Result<WatchFrame> {
    let raw: RawFrame = serde_json::from_slice(line)?;

    let phase = match raw.event_type.as_str() {
        "ADDED" => EventPhase::Added,
        "MODIFIED" => EventPhase::Modified,
        "DELETED" => EventPhase::Deleted,
        "BOOKMARK" => {
            return Ok(WatchFrame::Bookmark {
                resource_version: crate::resource::object_resource_version(&raw.object)
                    .map(str::to_string),
            })
        }
        "ERROR" => {
            let status = serde_json::from_value(raw.object)?;
            return Ok(WatchFrame::Error(status));
        }
        other => return Err(Error::Parse(format!("unknown event type '{}'", other))),
    };

    if !raw.object.is_object() {
        return Err(Error::Parse(format!(
            "{:?} frame without an object",
            phase
        )));
    }
    Ok(WatchFrame::Event {
        phase,
        object: raw.object,
    })
}

/// Reassembles newline-delimited frames from arbitrary chunks
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no newline
    scanned: usize,
}

impl FrameDecoder {
    /// Empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk.
    ///
    /// Fails when an unterminated line grows past the frame limit; the
    /// partial line is dropped so decoding can resume at the next newline.
    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > MAX_FRAME_BYTES && !self.buf[self.scanned..].contains(&b'\n') {
            let len = self.buf.len();
            self.buf.clear();
            self.scanned = 0;
            return Err(Error::Parse(format!(
                "frame exceeds {} bytes ({} buffered)",
                MAX_FRAME_BYTES, len
            )));
        }
        Ok(())
    }

    /// Next complete frame, skipping blank lines
    pub fn next_frame(&mut self) -> Option<Result<WatchFrame>> {
        loop {
            let Some(pos) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') else {
                self.scanned = self.buf.len();
                return None;
            };
            let pos = self.scanned + pos;
            self.scanned = 0;
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = line.trim_ascii();
            if !line.is_empty() {
                return Some(parse_frame(line));
            }
        }
    }

    /// Parse whatever is left once the stream has ended
    pub fn finish(&mut self) -> Option<Result<WatchFrame>> {
        let rest = std::mem::take(&mut self.buf);
        self.scanned = 0;
        let rest = rest.trim_ascii();
        if rest.is_empty() {
            None
        } else {
            Some(parse_frame(rest))
        }
    }
}
