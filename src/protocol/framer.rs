// EMA Gateway
//
// Copyright: 2026, EMA Project
// License: Public Domain License

/// Upper bound on the inbound line buffer; the device never emits frames
/// anywhere near this long, so reaching it means we lost framing.
const MAX_FRAME_BYTES: usize = 4096;

/// Splits the inbound byte stream into complete CR-LF-terminated frames.
///
/// Bytes are accumulated until a `\r\n` pair is seen; the frame is emitted
/// without its terminator. An overfull buffer is flushed with a warning.
pub struct Framer {
    buffer: Vec<u8>,
}

impl Framer {
    pub fn new() -> Framer {
        Framer { buffer: Vec::new() }
    }

    /// Append raw bytes and return every frame completed by them, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut frames = Vec::new();
        for &byte in bytes {
            if byte == b'\n' && self.buffer.last() == Some(&b'\r') {
                self.buffer.pop();
                if !self.buffer.is_empty() {
                    frames.push(String::from_utf8_lossy(&self.buffer).into_owned());
                }
                self.buffer.clear();
            } else {
                self.buffer.push(byte);
                if self.buffer.len() > MAX_FRAME_BYTES {
                    warn!("oversize frame ({} bytes), flushing buffer", self.buffer.len());
                    self.buffer.clear();
                }
            }
        }
        frames
    }

    /// Drop any partially accumulated frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Framer {
    fn default() -> Framer {
        Framer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_split_across_reads() {
        let mut framer = Framer::new();
        assert!(framer.push(b"(X0").is_empty());
        assert!(framer.push(b"07)\r").is_empty());
        let frames = framer.push(b"\n(r)\r\n");
        assert_eq!(frames, vec!["(X007)".to_string(), "(r)".to_string()]);
    }

    #[test]
    fn empty_lines_are_skipped() {
        let mut framer = Framer::new();
        let frames = framer.push(b"\r\n\r\n(s)\r\n");
        assert_eq!(frames, vec!["(s)".to_string()]);
    }

    #[test]
    fn bare_newline_is_data() {
        let mut framer = Framer::new();
        let frames = framer.push(b"(a\nb)\r\n");
        assert_eq!(frames, vec!["(a\nb)".to_string()]);
    }

    #[test]
    fn oversize_buffer_is_flushed() {
        let mut framer = Framer::new();
        let garbage = vec![b'x'; MAX_FRAME_BYTES + 10];
        assert!(framer.push(&garbage).is_empty());
        // Framing recovers on the next well-formed line.
        let frames = framer.push(b"(r)\r\n");
        assert_eq!(frames, vec!["(r)".to_string()]);
    }

    #[test]
    fn reset_drops_partial_frame() {
        let mut framer = Framer::new();
        framer.push(b"(X0");
        framer.reset();
        let frames = framer.push(b"(r)\r\n");
        assert_eq!(frames, vec!["(r)".to_string()]);
    }
}
