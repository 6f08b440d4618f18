//! Incremental line framing over a byte stream.

/// Reassembles complete lines from arbitrarily chunked byte input.
///
/// Bytes are buffered until a `\n` terminator arrives; the terminator (and a
/// preceding `\r`, if any) is stripped before the line is emitted. Data after
/// the last terminator is retained and prefixed to the next chunk, so a JSON
/// record split across reads is reassembled exactly once. Lines that are
/// blank after trimming are dropped.
///
/// Framing never fails: invalid UTF-8 is replaced lossily and malformed
/// content is simply a line the decoder will reject.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of bytes, returning every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut raw: Vec<u8> = self.pending.drain(..=pos).collect();
            raw.pop(); // the \n
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            let line = String::from_utf8_lossy(&raw).into_owned();
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// The undelivered trailing fragment, if the input so far did not end in
    /// a terminator.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}
