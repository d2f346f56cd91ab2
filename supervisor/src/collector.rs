//! Concurrent capture of a child's stdout and stderr.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Bytes captured from one stream.
#[derive(Debug, Clone, Default)]
pub struct StreamCapture {
    pub bytes: Vec<u8>,
    /// Output past the limit was read and discarded.
    pub truncated: bool,
    /// The writer side closed before collection stopped.
    pub reached_eof: bool,
}

impl StreamCapture {
    fn push(&mut self, data: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        if data.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&data[..data.len().min(room)]);
    }

    pub fn decode(&self) -> String {
        decode_output(&self.bytes)
    }
}

/// UTF-8 with replacement characters, line endings normalised to `\n`.
pub fn decode_output(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.contains("\r\n") {
        text.replace("\r\n", "\n")
    } else {
        text.into_owned()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub stdout: StreamCapture,
    pub stderr: StreamCapture,
}

/// One reader task per stream so a full pipe on one side never stalls the other.
pub struct StreamCollector {
    stdout: JoinHandle<StreamCapture>,
    stderr: JoinHandle<StreamCapture>,
    stop: watch::Sender<bool>,
}

impl StreamCollector {
    /// Start draining both streams, keeping at most `limit` bytes of each.
    pub fn start<O, E>(stdout: O, stderr: E, limit: usize) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        Self {
            stdout: tokio::spawn(drain(stdout, stop_rx.clone(), limit)),
            stderr: tokio::spawn(drain(stderr, stop_rx, limit)),
            stop,
        }
    }

    /// Wait up to `window` for both streams to close, then stop whatever is still open.
    ///
    /// Descendants of the child can keep a pipe open long after the child itself
    /// exited; the window bounds how long they can hold up the result.
    pub async fn finish(self, window: Duration) -> CapturedOutput {
        let StreamCollector {
            mut stdout,
            mut stderr,
            stop,
        } = self;

        let mut out = None;
        let mut err = None;
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);

        while out.is_none() || err.is_none() {
            tokio::select! {
                joined = &mut stdout, if out.is_none() => out = Some(settle("stdout", joined)),
                joined = &mut stderr, if err.is_none() => err = Some(settle("stderr", joined)),
                _ = &mut deadline => break,
            }
        }

        if out.is_none() || err.is_none() {
            debug!(?window, "Output still open after drain window, stopping readers");
            stop.send_replace(true);
            if out.is_none() {
                out = Some(settle("stdout", stdout.await));
            }
            if err.is_none() {
                err = Some(settle("stderr", stderr.await));
            }
        }

        CapturedOutput {
            stdout: out.unwrap_or_default(),
            stderr: err.unwrap_or_default(),
        }
    }
}

fn settle(stream: &str, joined: Result<StreamCapture, JoinError>) -> StreamCapture {
    joined.unwrap_or_else(|err| {
        warn!(stream, error = %err, "Output reader task failed");
        StreamCapture::default()
    })
}

async fn drain<R>(mut reader: R, mut stop: watch::Receiver<bool>, limit: usize) -> StreamCapture
where
    R: AsyncRead + Unpin,
{
    let mut capture = StreamCapture::default();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    capture.reached_eof = true;
                    break;
                }
                Ok(n) => capture.push(&chunk[..n], limit),
                Err(err) => {
                    warn!(error = %err, "Output stream read failed");
                    break;
                }
            },
        }
    }

    capture
}
