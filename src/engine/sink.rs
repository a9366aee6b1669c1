//! Flush-through progress sink for streaming deploy output.
//!
//! Every write is forwarded immediately to the consumer, so an HTTP client
//! watching the response sees per-foundation command output live. The sink
//! is a multi-producer channel drained by a single reader: concurrent
//! pushers each send whole lines (or whole command-output chunks), so no
//! partial line from one worker can be interleaved inside a line from
//! another.

use bytes::Bytes;
use tokio::sync::mpsc;

/// Cloneable write end of a deploy's progress stream.
#[derive(Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ProgressSink {
    /// Create a sink together with the receiver that drains it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Write a single line, appending a trailing newline.
    ///
    /// Sends are infallible from the caller's point of view: if the reader
    /// has gone away (client disconnected) the output is discarded.
    pub fn write_line(&self, line: impl AsRef<str>) {
        let _ = self
            .tx
            .send(Bytes::from(format!("{}\n", line.as_ref())));
    }

    /// Write a raw chunk of captured command output as-is.
    ///
    /// The chunk is delivered atomically, so multi-line command output from
    /// one foundation is never split by another foundation's writes.
    pub fn write_chunk(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let _ = self.tx.send(Bytes::copy_from_slice(chunk));
    }
}

/// Drain everything currently buffered in a sink receiver into a string.
///
/// Only meaningful once all sink clones have been dropped or gone quiet;
/// used by the HTTP layer for the buffered (non-streaming) response path
/// and by tests to assert on deploy output.
pub fn drain_to_string(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> String {
    let mut out = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        out.extend_from_slice(&chunk);
    }
    String::from_utf8_lossy(&out).into_owned()
}
