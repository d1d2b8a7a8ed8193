//! Incremental splitting of raw output bytes into logical lines
//!
//! Terminal programs redraw progress output with `\r` and `\b`. The framer
//! turns such output into a sequence of [`FramedLine`]s where a line flagged
//! `replaces_previous` is a redraw of the line emitted just before it.
//!
//! - `\n` ends the current line.
//! - `\r` ends the current line. Unless it is directly followed by `\n`, the
//!   next line starts as a copy of the ended one and is written over it from
//!   the first column.
//! - `\b` as the first non-space byte of a line removes a character from the
//!   text being built (at the overwrite cursor for an overwritten line).
//!   Anywhere else it ends the current line and the next line starts as that
//!   line minus its last character.

use tokio::io::{AsyncRead, AsyncReadExt};

const BACKSPACE: u8 = 0x08;
const READ_CHUNK: usize = 8 * 1024;

/// A logical line produced by the framer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedLine {
    /// Line text without terminator
    pub text: String,
    /// Whether this line redraws the previous one
    pub replaces_previous: bool,
}

/// Byte-at-a-time line framing state machine
#[derive(Debug, Default)]
pub struct LineFramer {
    line: Vec<char>,
    replacing: bool,
    overwrite: bool,
    cursor: usize,
    read_count: usize,
    after_cr: Option<Vec<char>>,
    utf8: Vec<u8>,
}

impl LineFramer {
    /// Create an empty framer
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning the lines they completed
    pub fn push(&mut self, bytes: &[u8]) -> Vec<FramedLine> {
        let mut out = Vec::new();
        for &b in bytes {
            self.push_byte(b, &mut out);
        }
        out
    }

    /// Signal end of stream, returning the pending partial line if any
    pub fn finish(&mut self) -> Option<FramedLine> {
        self.flush_utf8(true);
        if self.after_cr.take().is_some() {
            // the redrawn text was already emitted when the `\r` arrived
            self.begin_line(Vec::new(), false);
            return None;
        }
        if self.line.is_empty() {
            return None;
        }
        let line = self.emit();
        self.begin_line(Vec::new(), false);
        Some(line)
    }

    fn push_byte(&mut self, b: u8, out: &mut Vec<FramedLine>) {
        if let Some(previous) = self.after_cr.take() {
            if b == b'\n' {
                self.begin_line(Vec::new(), false);
                return;
            }
            self.begin_line(previous, true);
        }
        if b != b' ' {
            self.read_count += 1;
        }

        match b {
            b'\n' => {
                self.flush_utf8(true);
                out.push(self.emit());
                self.begin_line(Vec::new(), false);
            }
            b'\r' => {
                self.flush_utf8(true);
                out.push(self.emit());
                self.after_cr = Some(std::mem::take(&mut self.line));
            }
            BACKSPACE => {
                self.flush_utf8(true);
                if self.read_count == 1 {
                    if self.overwrite {
                        if self.cursor < self.line.len() {
                            self.line.remove(self.cursor);
                        }
                        self.cursor = self.cursor.saturating_sub(1);
                    } else {
                        self.line.pop();
                    }
                    self.read_count = 0;
                } else {
                    let line = self.emit();
                    let mut next: Vec<char> = line.text.chars().collect();
                    next.pop();
                    out.push(line);
                    self.begin_line(next, false);
                }
            }
            _ => {
                self.utf8.push(b);
                self.flush_utf8(false);
            }
        }
    }

    fn begin_line(&mut self, init: Vec<char>, overwrite: bool) {
        self.replacing = !init.is_empty();
        self.line = init;
        self.overwrite = overwrite;
        self.cursor = 0;
        self.read_count = 0;
    }

    fn emit(&self) -> FramedLine {
        FramedLine {
            text: self.line.iter().collect(),
            replaces_previous: self.replacing,
        }
    }

    fn put_char(&mut self, c: char) {
        if self.overwrite {
            if self.cursor < self.line.len() {
                self.line[self.cursor] = c;
            } else {
                self.line.push(c);
            }
            self.cursor += 1;
        } else {
            self.line.push(c);
        }
    }

    /// Decode buffered bytes into chars. Incomplete sequences stay buffered
    /// unless `force` is set, in which case they become U+FFFD.
    fn flush_utf8(&mut self, force: bool) {
        while !self.utf8.is_empty() {
            match std::str::from_utf8(&self.utf8) {
                Ok(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    self.utf8.clear();
                    chars.into_iter().for_each(|c| self.put_char(c));
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if valid > 0 {
                        let chars: Vec<char> = String::from_utf8_lossy(&self.utf8[..valid])
                            .chars()
                            .collect();
                        self.utf8.drain(..valid);
                        chars.into_iter().for_each(|c| self.put_char(c));
                        continue;
                    }
                    match e.error_len() {
                        Some(len) => {
                            self.utf8.drain(..len);
                            self.put_char(char::REPLACEMENT_CHARACTER);
                        }
                        None if force => {
                            self.utf8.clear();
                            self.put_char(char::REPLACEMENT_CHARACTER);
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

/// Read `reader` to the end, framing its bytes into lines and handing each
/// line to `on_line` in order.
pub async fn frame_lines<R, F>(mut reader: R, mut on_line: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(FramedLine),
{
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        for line in framer.push(&buf[..n]) {
            on_line(line);
        }
    }
    if let Some(line) = framer.finish() {
        on_line(line);
    }
    Ok(())
}
