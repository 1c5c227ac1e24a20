//! Streaming line decoder
//!
//! Turns one line-oriented byte stream into [`TestEvent`]s while the process
//! is still writing. A line that is not a valid event becomes a synthetic
//! `output` event carrying the raw text; decoding never stops on a bad line.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RunError;
use crate::event::TestEvent;

/// How lines of a stream are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Each line should be a JSON event (stdout).
    Structured,
    /// Free-form text, always forwarded as output (stderr).
    Unstructured,
}

/// Counts of what a decoder emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    pub decoded: usize,
    pub synthetic: usize,
}

/// Decoder for one output stream of a test process.
#[derive(Debug, Clone)]
pub struct Decoder {
    kind: StreamKind,
    stream: &'static str,
    package: Option<String>,
}

impl Decoder {
    pub fn new(kind: StreamKind, stream: &'static str) -> Self {
        Self {
            kind,
            stream,
            package: None,
        }
    }

    /// Decoder for the structured event stream.
    pub fn stdout() -> Self {
        Self::new(StreamKind::Structured, "stdout")
    }

    /// Decoder for the unstructured diagnostic stream.
    pub fn stderr() -> Self {
        Self::new(StreamKind::Unstructured, "stderr")
    }

    /// Attribute synthetic events to a package.
    pub fn with_package(mut self, package: Option<String>) -> Self {
        self.package = package;
        self
    }

    /// Decode a single line.
    pub fn decode_line(&self, line: &str) -> (TestEvent, bool) {
        if self.kind == StreamKind::Structured {
            match serde_json::from_str::<TestEvent>(line) {
                Ok(event) => return (event.normalized(), true),
                Err(err) => {
                    warn!(
                        stream = self.stream,
                        error = %err,
                        content = line,
                        "undecodable event line"
                    );
                }
            }
        }
        (TestEvent::raw_output(self.package.as_deref(), line), false)
    }

    /// Read `reader` to the end, sending every line as an event.
    ///
    /// Returns when the stream ends, the receiver is dropped, or `cancel`
    /// fires. The sender is dropped on return, which closes the channel once
    /// every other sender is gone. An I/O error is returned after all events
    /// decoded before it have been sent.
    pub async fn decode<R>(
        self,
        reader: R,
        tx: mpsc::Sender<TestEvent>,
        cancel: CancellationToken,
    ) -> Result<DecodeStats, RunError>
    where
        R: AsyncRead + Unpin,
    {
        let mut segments = BufReader::new(reader).split(b'\n');
        let mut stats = DecodeStats::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(stream = self.stream, "decoder cancelled");
                    break;
                }
                next = segments.next_segment() => next,
            };

            let bytes = match next {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break,
                Err(source) => {
                    return Err(RunError::Stream {
                        stream: self.stream,
                        source,
                    })
                }
            };

            let text = String::from_utf8_lossy(&bytes);
            let line = text.strip_suffix('\r').unwrap_or(&text);
            let (event, structured) = self.decode_line(line);
            if structured {
                stats.decoded += 1;
            } else {
                stats.synthetic += 1;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = tx.send(event) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        Ok(stats)
    }
}
