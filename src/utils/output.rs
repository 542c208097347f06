/// Bounded output collection
///
/// Each stream is drained on its own thread so a child writing heavily to one
/// pipe can never stall on the other. Bytes past the limit are read and
/// discarded rather than left in the pipe, which would block the writer until
/// its deadline.
use crate::config::types::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Output limits configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputLimits {
    /// Stdout bytes kept (bytes)
    pub stdout_limit: usize,
    /// Stderr bytes kept (bytes)
    pub stderr_limit: usize,
    /// How long to wait for EOF after the process has exited (milliseconds)
    pub drain_timeout_ms: u64,
}

impl Default for OutputLimits {
    fn default() -> Self {
        OutputLimits {
            stdout_limit: 1024 * 1024, // 1 MiB
            stderr_limit: 256 * 1024,  // 256 KiB
            drain_timeout_ms: 1000,
        }
    }
}

impl OutputLimits {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Output integrity classification
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputIntegrity {
    #[default]
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "truncated_by_limit")]
    TruncatedByLimit,
    /// Something still held the pipe open after the drain timeout
    #[serde(rename = "still_open")]
    StillOpen,
}

impl std::fmt::Display for OutputIntegrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputIntegrity::Complete => write!(f, "complete"),
            OutputIntegrity::TruncatedByLimit => write!(f, "truncated_by_limit"),
            OutputIntegrity::StillOpen => write!(f, "still_open"),
        }
    }
}

/// What one stream produced.
#[derive(Debug, Clone, Default)]
pub struct CapturedStream {
    pub data: Vec<u8>,
    pub integrity: OutputIntegrity,
    /// Bytes read from the pipe, including discarded ones
    pub total_bytes: u64,
    pub limit: usize,
}

impl CapturedStream {
    pub fn is_truncated(&self) -> bool {
        self.integrity != OutputIntegrity::Complete
    }

    /// Captured bytes with a trailing marker when the stream was cut short.
    pub fn into_bytes_with_marker(mut self) -> Vec<u8> {
        match self.integrity {
            OutputIntegrity::Complete => {}
            OutputIntegrity::TruncatedByLimit => {
                let marker = format!("\n[output truncated after {} bytes]\n", self.limit);
                self.data.extend_from_slice(marker.as_bytes());
            }
            OutputIntegrity::StillOpen => {
                self.data
                    .extend_from_slice(b"\n[output incomplete: stream still open after exit]\n");
            }
        }
        self.data
    }
}

/// Read `stream` to EOF into `sink`, keeping at most `limit` bytes.
fn pump<R: Read>(mut stream: R, limit: usize, sink: &Mutex<CapturedStream>) {
    let mut chunk = [0u8; 8192];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let mut captured = sink.lock().unwrap_or_else(|p| p.into_inner());
                let room = limit.saturating_sub(captured.data.len());
                let keep = room.min(n);
                captured.data.extend_from_slice(&chunk[..keep]);
                captured.total_bytes += n as u64;
                if keep < n {
                    captured.integrity = OutputIntegrity::TruncatedByLimit;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("Output stream read failed: {}", e);
                break;
            }
        }
    }
}

/// Background collector for one child pipe.
pub struct StreamCollector {
    sink: Arc<Mutex<CapturedStream>>,
    done: Receiver<()>,
}

impl StreamCollector {
    /// Start draining `stream` on a dedicated thread. A missing stream
    /// yields an empty, complete capture.
    pub fn spawn<R>(name: &str, stream: Option<R>, limit: usize) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let sink = Arc::new(Mutex::new(CapturedStream {
            limit,
            ..CapturedStream::default()
        }));
        let (done_tx, done) = channel();

        match stream {
            Some(stream) => {
                let thread_sink = Arc::clone(&sink);
                thread::Builder::new()
                    .name(format!("polyrun-{}", name))
                    .spawn(move || {
                        pump(stream, limit, &thread_sink);
                        let _ = done_tx.send(());
                    })
                    .map_err(|e| {
                        EngineError::Process(format!("failed to start {} collector: {}", name, e))
                    })?;
            }
            None => {
                let _ = done_tx.send(());
            }
        }

        Ok(Self { sink, done })
    }

    /// Wait until EOF or `deadline`, then take what was captured.
    ///
    /// A stream that has not reached EOF by the deadline is abandoned and
    /// marked `StillOpen`; its thread ends once the last writer goes away.
    pub fn finish(self, deadline: Instant) -> CapturedStream {
        let wait = deadline.saturating_duration_since(Instant::now());
        let completed = match self.done.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        };

        let mut captured = self.sink.lock().unwrap_or_else(|p| p.into_inner());
        let mut result = CapturedStream {
            data: std::mem::take(&mut captured.data),
            integrity: captured.integrity,
            total_bytes: captured.total_bytes,
            limit: captured.limit,
        };

        if !completed && result.integrity == OutputIntegrity::Complete {
            result.integrity = OutputIntegrity::StillOpen;
        }
        result
    }
}
