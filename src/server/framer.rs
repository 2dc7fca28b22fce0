// Growable byte buffer with cheap front removal
use bytes::BytesMut;

/// Splits one connection's byte stream into trimmed, newline-terminated records.
///
/// The buffer is owned by the framer and only changes through [`Framer::feed`]:
/// new bytes go on the back, completed lines come off the front together with
/// their `\n`. Whatever follows the last newline waits for the next read.
///
/// There is no cap on line length. A client that never sends `\n` makes the
/// buffer grow until it disconnects.
#[derive(Debug, Default)]
pub struct Framer {
    buffer: BytesMut,
    // Prefix of `buffer` already known to hold no newline
    scanned: usize,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every record they completed, in arrival order.
    ///
    /// Blank lines (only whitespace) are swallowed. Invalid UTF-8 is replaced
    /// with U+FFFD rather than dropped.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut records = Vec::new();
        while let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') {
            let pos = self.scanned + offset;
            // Take the line *and* its newline off the front
            let line = self.buffer.split_to(pos + 1);
            self.scanned = 0;

            let text = String::from_utf8_lossy(&line[..pos]);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                records.push(trimmed.to_string());
            }
        }
        self.scanned = self.buffer.len();
        records
    }

    /// Bytes received but not yet part of a complete line
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
