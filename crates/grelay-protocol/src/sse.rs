use bytes::Bytes;

/// Re-frames one logical line as a standalone SSE block.
pub fn frame_line(line: &str) -> Bytes {
    let mut out = String::with_capacity(line.len() + 2);
    out.push_str(line);
    out.push_str("\n\n");
    Bytes::from(out)
}

pub fn encode_sse(event: Option<&str>, data: &str) -> Bytes {
    // `event:` is optional. For multi-line data, each line gets `data:`.
    let mut out = String::new();
    if let Some(event) = event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

pub const DATA_PREFIX: &str = "data: ";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_event_framing() {
        let bytes = encode_sse(Some("error"), "{\"error\":{}}");
        assert_eq!(&bytes[..], b"event: error\ndata: {\"error\":{}}\n\n");
    }

    #[test]
    fn lines_are_reframed_as_blocks() {
        assert_eq!(&frame_line(": keep-alive")[..], b": keep-alive\n\n");
    }
}
