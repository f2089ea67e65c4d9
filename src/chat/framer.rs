//! Stream framer — splits the response byte stream into `data:` frames.
//!
//! Frames are blocks of lines terminated by a blank line (`\n\n` or
//! `\r\n\r\n`). The buffer holds raw bytes so a UTF-8 character split across
//! two chunks decodes correctly, and the output depends only on the total
//! bytes received, never on where the chunk boundaries fell.

use tracing::{debug, warn};

/// Longest delimiter minus one: the most of a delimiter a partial frame can hold.
const DELIMITER_SLACK: usize = 3;

/// One complete frame's payload (the `data:` lines, joined).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: String,
}

/// A frame exceeded the configured size limit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Frame of at least {size} bytes exceeds limit of {limit} bytes")]
pub struct FrameTooLarge {
    pub size: usize,
    pub limit: usize,
}

/// What one [`StreamFramer::push`] produced.
///
/// `frames` holds every frame completed before the overflow, if any, so the
/// caller sees the same frames however the stream was chunked.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Pushed {
    pub frames: Vec<Frame>,
    pub overflow: Option<FrameTooLarge>,
}

/// Incremental frame decoder for one exchange.
#[derive(Debug)]
pub struct StreamFramer {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched without finding a delimiter.
    scanned: usize,
    max_frame_bytes: usize,
}

impl StreamFramer {
    /// Create a framer that rejects frames larger than `max_frame_bytes`.
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_frame_bytes,
        }
    }

    /// Feed one chunk; returns every frame it completed, in order.
    ///
    /// Frames without a `data:` line (comments, heartbeats) and frames that
    /// are not valid UTF-8 are dropped. Once `overflow` is set the framer
    /// should not be fed again.
    pub fn push(&mut self, chunk: &[u8]) -> Pushed {
        self.buffer.extend_from_slice(chunk);

        let mut pushed = Pushed::default();
        while let Some(raw) = self.drain_next() {
            if raw.len() > self.max_frame_bytes {
                pushed.overflow = Some(FrameTooLarge {
                    size: raw.len(),
                    limit: self.max_frame_bytes,
                });
                return pushed;
            }
            if raw.is_empty() {
                continue;
            }
            let Ok(text) = std::str::from_utf8(&raw) else {
                warn!(bytes = raw.len(), "Dropping frame with invalid UTF-8");
                continue;
            };
            match extract_data(text) {
                Some(data) => pushed.frames.push(Frame { data }),
                None => debug!(frame = %text, "Skipping frame without data line"),
            }
        }

        if self.buffer.len() > self.max_frame_bytes + DELIMITER_SLACK {
            pushed.overflow = Some(FrameTooLarge {
                size: self.buffer.len() - DELIMITER_SLACK,
                limit: self.max_frame_bytes,
            });
        }

        pushed
    }

    /// Bytes received after the last delimiter that never formed a frame.
    #[cfg(test)]
    fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// End of stream. Any undelimited remainder is discarded; returns its size.
    pub fn finish(self) -> usize {
        let leftover = self.buffer.len();
        if leftover > 0 {
            debug!(bytes = leftover, "Discarding unterminated trailing frame");
        }
        leftover
    }

    fn drain_next(&mut self) -> Option<Vec<u8>> {
        // A delimiter may straddle the end of the previous scan.
        let from = self.scanned.saturating_sub(DELIMITER_SLACK);
        let Some((pos, delim_len)) = find_boundary(&self.buffer, from) else {
            self.scanned = self.buffer.len();
            return None;
        };
        let frame = self.buffer[..pos].to_vec();
        self.buffer.drain(..pos + delim_len);
        self.scanned = 0;
        Some(frame)
    }
}

/// Earliest `\n\n` or `\r\n\r\n` at or after `from`.
fn find_boundary(buffer: &[u8], from: usize) -> Option<(usize, usize)> {
    (from..buffer.len()).find_map(|i| {
        let rest = &buffer[i..];
        if rest.starts_with(b"\n\n") {
            Some((i, 2))
        } else if rest.starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else {
            None
        }
    })
}

fn extract_data(frame: &str) -> Option<String> {
    let mut data = String::new();
    let mut found = false;

    for line in frame.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let Some(rest) = line.strip_prefix("data:") else {
            continue;
        };
        let rest = rest.strip_prefix(' ').unwrap_or(rest);
        if found {
            data.push('\n');
        }
        data.push_str(rest);
        found = true;
    }

    found.then_some(data)
}
