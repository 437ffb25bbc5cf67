//! Newline-delimited JSON framing over the child's stdio pipes.
//!
//! Outbound messages are written as one JSON document followed by `\n`.
//! Inbound bytes are accumulated in a bounded buffer and split on `\n`; each
//! complete line becomes a [`Frame`]. Bytes after the last delimiter stay
//! buffered until the next read, so chunk boundaries never split or merge
//! messages.

use std::io;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::error::{ProbeError, is_closed_pipe};

const PREVIEW_BYTES: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl StreamSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Value),
    Malformed { line: String, reason: String },
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    /// Parse each line as JSON, reporting failures as [`Frame::Malformed`].
    Json,
    /// Pass each line through as [`Frame::Text`].
    Text,
}

#[derive(Debug)]
pub struct LineFramer {
    mode: FrameMode,
    max_line_bytes: usize,
    next_index: usize,
    discarding: Option<String>,
}

impl LineFramer {
    pub const fn new(mode: FrameMode, max_line_bytes: usize) -> Self {
        Self {
            mode,
            max_line_bytes,
            next_index: 0,
            discarding: None,
        }
    }

    pub const fn json(max_line_bytes: usize) -> Self {
        Self::new(FrameMode::Json, max_line_bytes)
    }

    pub const fn text(max_line_bytes: usize) -> Self {
        Self::new(FrameMode::Text, max_line_bytes)
    }

    fn frame_line(&self, raw: &[u8]) -> Option<Frame> {
        let line = trim_line_end(raw);
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        if line.len() > self.max_line_bytes {
            return Some(self.oversized(preview(line)));
        }
        Some(match self.mode {
            FrameMode::Json => match serde_json::from_slice::<Value>(line) {
                Ok(value) => Frame::Message(value),
                Err(err) => Frame::Malformed {
                    line: String::from_utf8_lossy(line).into_owned(),
                    reason: err.to_string(),
                },
            },
            FrameMode::Text => Frame::Text(String::from_utf8_lossy(line).into_owned()),
        })
    }

    fn oversized(&self, line: String) -> Frame {
        Frame::Malformed {
            line,
            reason: format!("line exceeds {} bytes", self.max_line_bytes),
        }
    }
}

impl Decoder for LineFramer {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        loop {
            let newline = buf[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| offset + self.next_index);

            let Some(pos) = newline else {
                // A trailing `\r` may still be the start of a CRLF delimiter.
                let pending_cr = usize::from(buf.last() == Some(&b'\r'));
                if buf.len() > self.max_line_bytes + pending_cr {
                    if self.discarding.is_none() {
                        self.discarding = Some(preview(buf));
                    }
                    buf.clear();
                    self.next_index = 0;
                } else {
                    self.next_index = buf.len();
                }
                return Ok(None);
            };

            let line = buf.split_to(pos + 1);
            self.next_index = 0;

            if let Some(head) = self.discarding.take() {
                return Ok(Some(self.oversized(head)));
            }
            if let Some(frame) = self.frame_line(&line) {
                return Ok(Some(frame));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if let Some(head) = self.discarding.take() {
            buf.clear();
            return Ok(Some(self.oversized(head)));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split();
        self.next_index = 0;
        Ok(self.frame_line(&rest))
    }
}

/// Push-style wrapper around [`LineFramer`] for callers that receive raw
/// chunks instead of polling a reader.
#[derive(Debug)]
pub struct FrameAssembler {
    buf: BytesMut,
    framer: LineFramer,
}

impl FrameAssembler {
    pub fn new(framer: LineFramer) -> Self {
        Self {
            buf: BytesMut::new(),
            framer,
        }
    }

    pub fn on_data(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = self.framer.decode(&mut self.buf) {
            frames.push(frame);
        }
        frames
    }

    pub fn finish(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = self.framer.decode_eof(&mut self.buf) {
            frames.push(frame);
        }
        frames
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

/// Writing half of the channel: one JSON document per line.
#[derive(Debug)]
pub struct FrameWriter<W> {
    writer: W,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub const fn new(writer: W) -> Self {
        Self {
            writer,
            closed: false,
        }
    }

    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns the number of bytes written, delimiter included.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<usize, ProbeError> {
        if self.closed {
            return Err(ProbeError::ChannelClosed);
        }
        let mut bytes = serde_json::to_vec(message).map_err(ProbeError::Encoding)?;
        bytes.push(b'\n');

        let written = async {
            self.writer.write_all(&bytes).await?;
            self.writer.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                tracing::trace!(bytes = bytes.len(), "frame written");
                Ok(bytes.len())
            }
            Err(err) if is_closed_pipe(err.kind()) => {
                self.closed = true;
                Err(ProbeError::ChannelClosed)
            }
            Err(err) => Err(ProbeError::Io(err)),
        }
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn preview(bytes: &[u8]) -> String {
    let end = bytes.len().min(PREVIEW_BYTES);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
