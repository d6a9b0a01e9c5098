//! Streams container logs into `tracing` until the container stops or the
//! pool is closed.

use crate::domain::{LogStream, RuntimeError};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FRAME_HEADER_LEN: usize = 8;
const CANCELED_SENTINEL: &str = "context canceled";

/// Forwards `stream` line by line, tagged with the container name and image.
/// Returns the number of lines forwarded.
pub async fn forward_logs(
    container: String,
    image: String,
    mut stream: LogStream,
    cancel: CancellationToken,
) -> usize {
    let mut decoder = LogDecoder::default();
    let mut forwarded = 0;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("{container}: log stream closed by pool");
                break;
            }
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for line in decoder.push(&bytes) {
                    emit(&container, &image, &line);
                    forwarded += 1;
                }
            }
            Some(Err(e)) => {
                if !is_cancellation(&e) {
                    warn!("{container} log stream error: {e}");
                }
                break;
            }
            None => break,
        }
    }

    if let Some(line) = decoder.finish() {
        emit(&container, &image, &line);
        forwarded += 1;
    }

    forwarded
}

fn emit(container: &str, image: &str, line: &str) {
    info!(target: "testpool::container", container, image, "{line}");
}

/// Splits raw log chunks into lines. Frames of a multiplexed stream
/// (stream byte 0..=2, three zero bytes, big-endian payload length) are
/// unwrapped before splitting; anything else is taken as plain text.
#[derive(Debug, Default)]
pub struct LogDecoder {
    raw: Vec<u8>,
    text: Vec<u8>,
}

enum Head {
    Frame(usize),
    Partial,
    Plain,
}

impl LogDecoder {
    /// Feeds one chunk and returns the lines it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.raw.extend_from_slice(chunk);
        self.unframe();

        let mut lines = Vec::new();
        while let Some(pos) = self.text.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.text.drain(..=pos).collect();
            lines.push(to_line(&line));
        }
        lines
    }

    /// The unterminated tail once the stream is over.
    pub fn finish(mut self) -> Option<String> {
        match head(&self.raw) {
            Head::Frame(_) => self.text.extend_from_slice(&self.raw[FRAME_HEADER_LEN..]),
            Head::Partial => {}
            Head::Plain => self.text.append(&mut self.raw),
        }
        (!self.text.is_empty()).then(|| to_line(&self.text))
    }

    fn unframe(&mut self) {
        loop {
            match head(&self.raw) {
                Head::Frame(len) if self.raw.len() >= FRAME_HEADER_LEN + len => {
                    let end = FRAME_HEADER_LEN + len;
                    self.text.extend_from_slice(&self.raw[FRAME_HEADER_LEN..end]);
                    self.raw.drain(..end);
                }
                Head::Frame(_) | Head::Partial => break,
                Head::Plain => {
                    self.text.append(&mut self.raw);
                    break;
                }
            }
        }
    }
}

fn head(raw: &[u8]) -> Head {
    let prefix = raw.len().min(4);
    if prefix == 0 || raw[0] > 2 || raw[1..prefix].iter().any(|b| *b != 0) {
        return Head::Plain;
    }
    if raw.len() < FRAME_HEADER_LEN {
        return Head::Partial;
    }
    let len = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
    Head::Frame(len as usize)
}

fn to_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

fn is_cancellation(err: &RuntimeError) -> bool {
    err.to_string().contains(CANCELED_SENTINEL)
}
