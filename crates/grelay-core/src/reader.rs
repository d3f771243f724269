use std::collections::VecDeque;
use std::io;

use futures_util::StreamExt;

use grelay_protocol::lines::LineSplitter;

use crate::upstream::ByteStream;

/// Lazy, finite, non-restartable sequence of protocol lines over one upstream body.
///
/// A read error is yielded once; afterwards the reader reports end of data.
pub struct LineReader {
    stream: ByteStream,
    splitter: LineSplitter,
    ready: VecDeque<String>,
    done: bool,
}

impl LineReader {
    pub fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            splitter: LineSplitter::new(),
            ready: VecDeque::new(),
            done: false,
        }
    }

    pub async fn next_line(&mut self) -> Option<Result<String, io::Error>> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Some(Ok(line));
            }
            if self.done {
                return None;
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => self.ready.extend(self.splitter.push_bytes(&chunk)),
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                None => {
                    self.done = true;
                    return self.splitter.finish().map(Ok);
                }
            }
        }
    }
}
