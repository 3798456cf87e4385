/// Reassembles complete lines from a stream of byte chunks.
///
/// Backend streams arrive as arbitrarily split chunks; a `data: {...}` line
/// can be cut anywhere, including inside a multi-byte UTF-8 sequence. The
/// buffer keeps the unterminated tail across calls so every complete line is
/// produced exactly once regardless of chunk boundaries.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and drain all lines completed by it.
    ///
    /// Line terminators are `\n` or `\r\n`; the terminator is stripped. A
    /// trailing `\r` is held back until the next chunk shows whether a `\n`
    /// follows it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        loop {
            let Some(pos) = self.pending.iter().position(|&b| b == b'\n') else {
                break;
            };
            let mut line_bytes: Vec<u8> = self.pending.drain(..=pos).collect();
            line_bytes.pop(); // the \n
            if line_bytes.last() == Some(&b'\r') {
                line_bytes.pop();
            }
            lines.push(String::from_utf8_lossy(&line_bytes).into_owned());
        }
        lines
    }

    /// Drain whatever is left once the stream is done. Returns `None` when
    /// the stream ended exactly on a line boundary.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(tail)
    }
}
