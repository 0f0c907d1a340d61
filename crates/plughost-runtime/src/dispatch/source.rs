//! Command input

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Line-oriented command input.
///
/// `next_command` is raced against cancellation, so implementations must be
/// cancel-safe: dropping the future must not lose a line that has not been
/// returned yet.
#[async_trait]
pub trait CommandSource: Send {
    /// The next line without its terminator, or `None` at end of input.
    async fn next_command(&mut self) -> io::Result<Option<String>>;
}

/// Reads commands line by line from any async reader.
///
/// Bytes that are not valid UTF-8 are replaced with U+FFFD rather than
/// failing the read.
pub struct LineSource<R> {
    reader: BufReader<R>,
    // bytes of a line whose read was cancelled part way
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin + Send> LineSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
        }
    }
}

fn decode_line(mut raw: Vec<u8>) -> String {
    if raw.last() == Some(&b'\n') {
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
    }
    match String::from_utf8(raw) {
        Ok(line) => line,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// Commands from the process's standard input.
pub fn stdin() -> LineSource<tokio::io::Stdin> {
    LineSource::new(tokio::io::stdin())
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> CommandSource for LineSource<R> {
    async fn next_command(&mut self) -> io::Result<Option<String>> {
        // `read_until` keeps partial input in `pending`, so a cancelled call
        // loses nothing.
        let read = self.reader.read_until(b'\n', &mut self.pending).await?;
        if read == 0 && self.pending.is_empty() {
            return Ok(None);
        }
        Ok(Some(decode_line(std::mem::take(&mut self.pending))))
    }
}
