//! Internal utilities for capturing command output.
//!
//! Each pipe is drained on its own thread; lines are traced as they arrive
//! and the full byte stream is returned to the caller.

use std::io::{BufRead, BufReader, Read};

/// Type of output stream for logging purposes.
#[derive(Clone, Copy)]
pub(super) enum StreamType {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Extracts a human-readable message from a thread panic.
///
/// The returned `&str` borrows from the panic payload, so it is valid
/// as long as the `err` reference is valid.
pub(crate) fn panic_message(err: &(dyn std::any::Any + Send)) -> &str {
    err.downcast_ref::<&str>()
        .copied()
        .or_else(|| err.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("unknown panic")
}

/// Reads a pipe to EOF, tracing each line and returning everything read.
///
/// - Lines are logged at TRACE; remote commands are chatty and their
///   output is usually consumed by the caller rather than shown.
/// - I/O errors stop reading but don't fail command execution
///   (command success is determined by exit status).
/// - `None` pipe logs an error and returns nothing.
pub(super) fn read_pipe<R: Read>(pipe: Option<R>, stream_type: StreamType) -> Vec<u8> {
    let Some(pipe) = pipe else {
        tracing::error!(
            stream = %stream_type,
            "pipe was None (unexpected: Stdio::piped() was set), no output will be captured"
        );
        return Vec::new();
    };

    let mut reader = BufReader::new(pipe);
    let mut captured = Vec::new();
    let mut line_buf = Vec::new();

    loop {
        line_buf.clear();
        match reader.read_until(b'\n', &mut line_buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = line_buf.strip_suffix(b"\n").unwrap_or(&line_buf);
                let text = String::from_utf8_lossy(line);
                tracing::trace!(stream = %stream_type, "{}", text.trim_end_matches('\r'));
                captured.extend_from_slice(&line_buf);
            }
            Err(e) => {
                tracing::error!(stream = %stream_type, error = %e, "I/O error, stopping read");
                break;
            }
        }
    }

    captured
}
