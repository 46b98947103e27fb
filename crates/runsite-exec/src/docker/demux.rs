//! Demultiplexing of the Docker exec output stream
//!
//! Without a tty, Docker sends stdout and stderr over one connection, each
//! piece prefixed by an 8 byte header:
//!
//! ```text
//! [stream type, 0, 0, 0, len (u32, big endian)] payload...
//! ```
//!
//! Headers and payloads may be split across reads at any byte.

use bytes::{Buf, Bytes, BytesMut};
use tracing::warn;

use crate::options::{ChunkDecoder, LineBreakHold, OutputChunk, OutputStream};
use crate::result::CommandResult;

const HEADER_LEN: usize = 8;

/// One demultiplexed piece of output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream the payload belongs to
    pub stream: OutputStream,
    /// Raw payload bytes
    pub payload: Bytes,
}

/// Incremental decoder for the framed exec stream
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the connection
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
        if self.buf.len() < HEADER_LEN + len {
            return None;
        }

        let stream = match self.buf[0] {
            2 | 3 => OutputStream::Stderr,
            _ => OutputStream::Stdout,
        };
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Some(Frame { stream, payload })
    }

    /// Bytes of an incomplete frame still buffered
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Collects exec output into text, one chunk per decoded frame
#[derive(Debug)]
pub(crate) struct Collector {
    frames: Option<FrameDecoder>,
    stdout_decoder: ChunkDecoder,
    stderr_decoder: ChunkDecoder,
    stdout_hold: Option<LineBreakHold>,
    stdout: String,
    stderr: String,
}

impl Collector {
    /// A tty exec stream is not framed
    pub(crate) fn new(tty: bool) -> Self {
        Self {
            frames: (!tty).then(FrameDecoder::new),
            stdout_decoder: ChunkDecoder::default(),
            stderr_decoder: ChunkDecoder::default(),
            stdout_hold: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Drop the final line break of stdout, as command results do
    pub(crate) fn trim_stdout(mut self) -> Self {
        self.stdout_hold = Some(LineBreakHold::default());
        self
    }

    /// Feed raw bytes; returns the chunks they completed
    pub(crate) fn push(&mut self, data: &[u8]) -> Vec<OutputChunk> {
        let mut chunks = Vec::new();
        let frames: Vec<Frame> = match &mut self.frames {
            Some(decoder) => {
                decoder.push(data);
                std::iter::from_fn(|| decoder.next_frame()).collect()
            }
            None => {
                self.accept(OutputStream::Stdout, data, &mut chunks);
                return chunks;
            }
        };
        for frame in frames {
            self.accept(frame.stream, &frame.payload, &mut chunks);
        }
        chunks
    }

    /// Flush partially decoded text at end of stream
    pub(crate) fn finish(&mut self) -> Vec<OutputChunk> {
        if let Some(decoder) = &self.frames {
            if decoder.pending() > 0 {
                warn!(bytes = decoder.pending(), "exec stream ended inside a frame");
            }
        }

        let mut chunks = Vec::new();
        let mut out = self.stdout_decoder.finish();
        if let Some(hold) = &mut self.stdout_hold {
            out = hold.push(&out);
            out.push_str(&hold.finish());
        }
        if !out.is_empty() {
            self.stdout.push_str(&out);
            chunks.push(OutputChunk::stdout(out));
        }
        let err = self.stderr_decoder.finish();
        if !err.is_empty() {
            self.stderr.push_str(&err);
            chunks.push(OutputChunk::stderr(err));
        }
        chunks
    }

    /// Build the final result
    pub(crate) fn into_result(self, exit_code: i32) -> CommandResult {
        CommandResult::new(self.stdout, self.stderr, exit_code)
    }

    fn accept(&mut self, stream: OutputStream, payload: &[u8], chunks: &mut Vec<OutputChunk>) {
        let (decoder, buffer) = match stream {
            OutputStream::Stdout => (&mut self.stdout_decoder, &mut self.stdout),
            OutputStream::Stderr => (&mut self.stderr_decoder, &mut self.stderr),
        };
        let mut text = decoder.push(payload);
        if let (OutputStream::Stdout, Some(hold)) = (stream, &mut self.stdout_hold) {
            text = hold.push(&text);
        }
        if text.is_empty() {
            return;
        }
        buffer.push_str(&text);
        chunks.push(match stream {
            OutputStream::Stdout => OutputChunk::stdout(text),
            OutputStream::Stderr => OutputChunk::stderr(text),
        });
    }
}

/// Encode one frame (used by tests and fakes)
#[cfg(test)]
pub(crate) fn encode_frame(stream_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![stream_type, 0, 0, 0];
    frame.extend_from_slice(&u32::try_from(payload.len()).unwrap().to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_whole_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&encode_frame(1, b"out"));
        decoder.push(&encode_frame(2, b"err"));

        let first = decoder.next_frame().unwrap();
        let second = decoder.next_frame().unwrap();

        assert_eq!(first.stream, OutputStream::Stdout);
        assert_eq!(&first.payload[..], b"out");
        assert_eq!(second.stream, OutputStream::Stderr);
        assert_eq!(&second.payload[..], b"err");
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decode_split_at_every_byte() {
        let mut wire = encode_frame(1, b"hello ");
        wire.extend(encode_frame(2, b"warn\n"));
        wire.extend(encode_frame(1, b"world\n"));

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in &wire {
            decoder.push(std::slice::from_ref(byte));
            while let Some(frame) = decoder.next_frame() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[2].payload[..], b"world\n");
    }

    #[test]
    fn test_stream_types() {
        let mut decoder = FrameDecoder::new();
        for ty in 0..4 {
            decoder.push(&encode_frame(ty, b"x"));
        }

        let streams: Vec<_> = std::iter::from_fn(|| decoder.next_frame())
            .map(|f| f.stream)
            .collect();

        assert_eq!(
            streams,
            [
                OutputStream::Stdout,
                OutputStream::Stdout,
                OutputStream::Stderr,
                OutputStream::Stderr
            ]
        );
    }

    #[test]
    fn test_empty_payload() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&encode_frame(1, b""));

        let frame = decoder.next_frame().unwrap();
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_collector_separates_streams() {
        let mut wire = encode_frame(1, "héllo\n".as_bytes());
        wire.extend(encode_frame(2, b"oops\n"));
        let mut collector = Collector::new(false);

        // split inside the first frame
        let mut chunks = collector.push(&wire[..10]);
        chunks.extend(collector.push(&wire[10..]));
        chunks.extend(collector.finish());

        let result = collector.into_result(0);
        assert_eq!(result.stdout, "héllo\n");
        assert_eq!(result.stderr, "oops\n");
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_collector_trims_final_line_break() {
        let mut wire = encode_frame(1, b"helloworld\n");
        wire.extend(encode_frame(2, b"note\n"));
        let mut collector = Collector::new(false).trim_stdout();

        let mut chunks = collector.push(&wire);
        chunks.extend(collector.finish());

        let stdout: String = chunks
            .iter()
            .filter(|c| c.stream == OutputStream::Stdout)
            .map(|c| c.data.as_str())
            .collect();
        let result = collector.into_result(0);
        assert_eq!(result.stdout, "helloworld");
        assert_eq!(stdout, result.stdout);
        assert_eq!(result.stderr, "note\n");
    }

    #[test]
    fn test_collector_tty_is_raw() {
        let mut collector = Collector::new(true);

        let chunks = collector.push(b"\x01\x00\x00\x00plain");

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].stream, OutputStream::Stdout);
        assert_eq!(collector.into_result(0).stdout, "\u{1}\0\0\0plain");
    }
}
