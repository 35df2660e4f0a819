//! Line framing for the serial byte stream.
//!
//! The device prints newline-terminated text, but reads from the port return
//! whatever bytes happen to be buffered. [`LineFramer`] accumulates chunks and
//! hands back complete lines. Decoding is lossy: invalid UTF-8 turns into
//! U+FFFD instead of failing the read loop.

/// Longest line kept in the buffer before it is emitted without a newline.
pub const MAX_LINE_LEN: usize = 4096;

/// Buffers raw bytes and emits a line whenever `\n` is seen.
///
/// One framer belongs to one connection; call [`LineFramer::reset`] when the
/// link is reopened so a half-received line never leaks into the next session.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_line_len: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_max_line_len(MAX_LINE_LEN)
    }

    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            max_line_len: max_line_len.max(1),
        }
    }

    /// Feed a chunk and collect every line it completes.
    ///
    /// Lines are trimmed; a trailing `\r` is dropped and blank lines are skipped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &b in bytes {
            if b == b'\n' {
                self.emit(&mut lines);
                continue;
            }
            self.buffer.push(b);
            if self.buffer.len() >= self.max_line_len {
                self.emit_overlong(&mut lines);
            }
        }

        lines
    }

    /// Bytes held for an incomplete line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial line.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn emit(&mut self, lines: &mut Vec<String>) {
        push_line(&self.buffer, lines);
        self.buffer.clear();
    }

    /// Flush a full buffer, holding back a character cut off at the end.
    fn emit_overlong(&mut self, lines: &mut Vec<String>) {
        let split = char_boundary_before_end(&self.buffer);
        push_line(&self.buffer[..split], lines);
        self.buffer.drain(..split);
    }
}

fn push_line(bytes: &[u8], lines: &mut Vec<String>) {
    let text = String::from_utf8_lossy(bytes);
    let line = text.trim();
    if !line.is_empty() {
        lines.push(line.to_string());
    }
}

/// Index where an incomplete trailing UTF-8 sequence starts, or `buf.len()`.
fn char_boundary_before_end(buf: &[u8]) -> usize {
    let len = buf.len();
    let Some(start) = (1..=len.min(4))
        .map(|back| len - back)
        .find(|&i| buf[i] & 0xC0 != 0x80)
    else {
        return len;
    };
    let width = match buf[start] {
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        b if b >= 0xC0 => 2,
        _ => 1,
    };
    if start > 0 && start + width > len {
        start
    } else {
        len
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}
