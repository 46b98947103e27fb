//! Per-call execution options and progress reporting

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default connection/readiness timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Which output stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// Incremental piece of command output delivered to a progress callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    /// Originating stream
    pub stream: OutputStream,
    /// Decoded text
    pub data: String,
    /// Process id of the command, when it was captured
    pub pid: Option<u32>,
}

impl OutputChunk {
    /// Chunk from stdout
    pub fn stdout(data: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            data: data.into(),
            pid: None,
        }
    }

    /// Chunk from stderr
    pub fn stderr(data: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            data: data.into(),
            pid: None,
        }
    }

    /// Tag with a captured pid
    #[must_use]
    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }
}

/// Callback invoked once per output chunk, in arrival order
pub type ProgressCallback = Arc<dyn Fn(&OutputChunk) + Send + Sync>;

/// Options recognized by every engine
#[derive(Clone)]
pub struct ExecOptions {
    /// Make a pipeline fail if any stage fails
    pub pipefail: bool,
    /// Allocate a pseudo-terminal
    pub tty: bool,
    /// Connection/readiness timeout (not a limit on command duration)
    pub timeout: Duration,
    /// Retry transient connection failures
    pub retry: bool,
    /// Capture the command's process id before its body runs
    pub get_pid: bool,
    /// Incremental output callback
    pub on_progress: Option<ProgressCallback>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            pipefail: false,
            tty: false,
            timeout: DEFAULT_TIMEOUT,
            retry: true,
            get_pid: false,
            on_progress: None,
        }
    }
}

impl fmt::Debug for ExecOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecOptions")
            .field("pipefail", &self.pipefail)
            .field("tty", &self.tty)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("get_pid", &self.get_pid)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

impl ExecOptions {
    /// Options with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable pipefail
    #[must_use]
    pub fn pipefail(mut self, pipefail: bool) -> Self {
        self.pipefail = pipefail;
        self
    }

    /// Enable or disable pty allocation
    #[must_use]
    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    /// Set connection timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set connection timeout in milliseconds
    #[must_use]
    pub fn timeout_ms(self, millis: u64) -> Self {
        self.timeout(Duration::from_millis(millis))
    }

    /// Enable or disable connection retries
    #[must_use]
    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    /// Request pid capture
    #[must_use]
    pub fn get_pid(mut self, get_pid: bool) -> Self {
        self.get_pid = get_pid;
        self
    }

    /// Attach a progress callback
    #[must_use]
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&OutputChunk) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    /// Deliver a chunk to the callback, if one is attached
    pub(crate) fn emit(&self, chunk: OutputChunk) {
        if let Some(callback) = &self.on_progress {
            callback(&chunk);
        }
    }
}

/// Turns a byte stream into text chunks without splitting UTF-8 sequences
#[derive(Debug, Default)]
pub(crate) struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    /// Feed bytes; returns the decodable prefix (possibly empty)
    pub(crate) fn push(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);
        let keep = incomplete_tail_len(&self.pending);
        let ready: Vec<u8> = self.pending.drain(..self.pending.len() - keep).collect();
        String::from_utf8_lossy(&ready).into_owned()
    }

    /// Flush whatever is left
    pub(crate) fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

/// Drop one trailing line break (`\n` or `\r\n`) from command stdout
#[must_use]
pub(crate) fn trim_line_break(text: &str) -> &str {
    match text.strip_suffix('\n') {
        Some(rest) => rest.strip_suffix('\r').unwrap_or(rest),
        None => text,
    }
}

/// Holds back a trailing line break of streamed stdout until more text follows
///
/// Everything released adds up to [`trim_line_break`] of the full output.
#[derive(Debug, Default)]
pub(crate) struct LineBreakHold {
    held: String,
}

impl LineBreakHold {
    /// Feed decoded text; returns what can be released
    pub(crate) fn push(&mut self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }
        let mut out = std::mem::take(&mut self.held);
        out.push_str(text);
        let mut keep = trim_line_break(&out).len();
        if keep == out.len() && out.ends_with('\r') {
            keep -= 1;
        }
        self.held = out.split_off(keep);
        out
    }

    /// End of stream; a lone `\r` is released, a line break is dropped
    pub(crate) fn finish(&mut self) -> String {
        let held = std::mem::take(&mut self.held);
        if held == "\r" { held } else { String::new() }
    }
}

/// Length of a trailing, not yet complete UTF-8 sequence
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            b if b >= 0xF0 => 4,
            b if b >= 0xE0 => 3,
            b if b >= 0xC0 => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_decoder_keeps_split_character() {
        let mut decoder = ChunkDecoder::default();
        let bytes = "héllo".as_bytes();

        assert_eq!(decoder.push(&bytes[..2]), "h");
        assert_eq!(decoder.push(&bytes[2..]), "éllo");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_decoder_flushes_garbage() {
        let mut decoder = ChunkDecoder::default();

        assert_eq!(decoder.push(&[b'a', 0xE2, 0x82]), "a");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_trim_line_break() {
        assert_eq!(trim_line_break("helloworld\n"), "helloworld");
        assert_eq!(trim_line_break("a\r\n"), "a");
        assert_eq!(trim_line_break("a\n\n"), "a\n");
        assert_eq!(trim_line_break("no break"), "no break");
    }

    #[test]
    fn test_hold_releases_interior_line_breaks() {
        let mut hold = LineBreakHold::default();
        let mut released = String::new();
        for piece in ["one\n", "two", "\r", "\n", "three\n"] {
            released.push_str(&hold.push(piece));
        }
        released.push_str(&hold.finish());

        assert_eq!(released, "one\ntwo\r\nthree");
    }

    #[test]
    fn test_hold_keeps_lone_carriage_return() {
        let mut hold = LineBreakHold::default();

        assert_eq!(hold.push("x\r"), "x");
        assert_eq!(hold.finish(), "\r");
    }

    #[test]
    fn test_defaults() {
        let options = ExecOptions::default();

        assert!(options.retry);
        assert!(!options.pipefail);
        assert_eq!(options.timeout, Duration::from_millis(5000));
        assert!(options.on_progress.is_none());
    }

    #[test]
    fn test_emit_reaches_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let options =
            ExecOptions::new().on_progress(move |chunk| sink.lock().unwrap().push(chunk.clone()));

        options.emit(OutputChunk::stdout("a"));
        options.emit(OutputChunk::stderr("b").with_pid(Some(7)));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].stream, OutputStream::Stderr);
        assert_eq!(seen[1].pid, Some(7));
    }
}
