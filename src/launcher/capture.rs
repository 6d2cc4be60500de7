//! Child console capture.
//!
//! Every stdout/stderr line of a child goes to an [`OutputSink`] and into a
//! bounded [`OutputBuffer`] that is attached to spawn and handshake failures.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use crate::types::ProcessId;

/// Which console stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Receives child console output.
pub trait OutputSink: Send + Sync + fmt::Debug {
    fn line(&self, process: &ProcessId, stream: OutputStream, line: &str);
}

/// Default sink: one tracing event per line under target `hostmesh::child`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn line(&self, process: &ProcessId, stream: OutputStream, line: &str) {
        tracing::info!(target: "hostmesh::child", process = %process, stream = %stream, "{}", line);
    }
}

/// Ring buffer of the most recent console lines of one child.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Captured output formatted for an error message.
    pub fn render(&self) -> String {
        let lines = self.snapshot();
        if lines.is_empty() {
            "(no console output)".to_string()
        } else {
            lines.join("\n")
        }
    }
}

/// Forward one console stream line by line until EOF.
pub fn capture<R>(
    reader: R,
    stream: OutputStream,
    process: ProcessId,
    sink: Arc<dyn OutputSink>,
    buffer: OutputBuffer,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    sink.line(&process, stream, &line);
                    buffer.push(format!("[{}] {}", stream, line));
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Console capture for {} ({}) stopped: {}", process, stream, e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Collect(Mutex<Vec<String>>);

    impl OutputSink for Collect {
        fn line(&self, _process: &ProcessId, stream: OutputStream, line: &str) {
            self.0.lock().unwrap().push(format!("{}:{}", stream, line));
        }
    }

    #[test]
    fn test_buffer_keeps_most_recent_lines() {
        let buffer = OutputBuffer::new(2);
        buffer.push("a".into());
        buffer.push("b".into());
        buffer.push("c".into());
        assert_eq!(buffer.snapshot(), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(OutputBuffer::new(0).render(), "(no console output)");
    }

    #[tokio::test]
    async fn test_capture_feeds_sink_and_buffer() {
        let sink = Arc::new(Collect::default());
        let buffer = OutputBuffer::new(10);
        let input: &[u8] = b"starting\nfatal: no config\n";

        capture(
            input,
            OutputStream::Stderr,
            "P1".parse().unwrap(),
            sink.clone(),
            buffer.clone(),
        )
        .await
        .unwrap();

        assert_eq!(
            *sink.0.lock().unwrap(),
            vec!["stderr:starting".to_string(), "stderr:fatal: no config".to_string()]
        );
        assert!(buffer.render().contains("[stderr] fatal: no config"));
    }
}
