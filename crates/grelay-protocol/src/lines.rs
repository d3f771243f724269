/// Incremental splitter turning byte chunks into logical protocol lines.
///
/// Splitting happens on raw `\n` bytes, so a multi-byte UTF-8 sequence cut by a chunk
/// boundary stays in the remainder until the line is complete. Each line is decoded
/// once, with trailing whitespace trimmed; blank lines are dropped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();

        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            if let Some(line) = decode_line(&self.buffer[start..end]) {
                lines.push(line);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);

        lines
    }

    /// Flushes whatever is left once the reader reports end of data.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end();
    if line.is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::LineSplitter;

    #[test]
    fn keeps_partial_line_across_pushes() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push_bytes(b"data: {\"a\":").is_empty());
        let lines = splitter.push_bytes(b"1}\n\ndata: {\"b\":2}\n");
        assert_eq!(lines, vec!["data: {\"a\":1}", "data: {\"b\":2}"]);
        assert!(splitter.finish().is_none());
    }

    #[test]
    fn trims_crlf_and_skips_blank_lines() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.push_bytes(b": ping \r\n\r\n   \r\ndata: x\r\n");
        assert_eq!(lines, vec![": ping", "data: x"]);
    }

    #[test]
    fn multibyte_sequence_split_between_chunks() {
        let text = "data: 你好\n".as_bytes();
        // Cut inside the first CJK character (3 bytes each).
        let (head, tail) = text.split_at(7);
        let mut splitter = LineSplitter::new();
        assert!(splitter.push_bytes(head).is_empty());
        assert_eq!(splitter.push_bytes(tail), vec!["data: 你好"]);
    }

    #[test]
    fn finish_flushes_remainder() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push_bytes(b"data: tail").is_empty());
        assert_eq!(splitter.finish().as_deref(), Some("data: tail"));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn finish_ignores_whitespace_remainder() {
        let mut splitter = LineSplitter::new();
        splitter.push_bytes(b"data: a\n  \t");
        assert_eq!(splitter.finish(), None);
    }
}
