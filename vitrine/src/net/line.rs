//! Line framing over nonblocking byte streams.
//!
//! Both ends of the control channel speak one JSON object per `\n`-ended
//! line over a nonblocking socket driven by readiness polling. This module
//! owns the two hazards of that arrangement:
//!
//! - a peer that streams bytes without ever sending a newline — the
//!   accumulation buffer has a hard ceiling and the connection is dropped
//!   when it is crossed;
//! - backpressure on the send path — writes complete fully or fail within
//!   a bounded retry budget, and callers serialize whole lines under a
//!   per-connection lock so two senders can never interleave bytes.

use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use thiserror::Error;

/// Ceiling for one unterminated line. A 1920×1080 BGRA frame is ~11 MiB
/// as base64, so the largest legitimate fallback line fits with margin
/// while a hostile or broken peer cannot grow memory without bound.
pub const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// Sleep between retries while the peer's receive window is full.
const WRITE_RETRY_SLEEP: Duration = Duration::from_millis(2);

#[derive(Debug, Error)]
pub enum LineError {
    /// The peer closed its end.
    #[error("peer closed the connection")]
    Closed,
    /// An unterminated line crossed [`MAX_LINE_BYTES`].
    #[error("unterminated line exceeded {MAX_LINE_BYTES} bytes")]
    Oversized,
    /// The socket stayed unwritable past the retry budget.
    #[error("write stalled under backpressure for {0:?}")]
    WriteTimeout(Duration),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Whether the stream is still open after a fill pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    Open,
    /// EOF was observed. Lines completed before it are still delivered.
    Closed,
}

/// Accumulates socket reads and yields complete lines.
#[derive(Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains everything currently readable from `stream`, appending each
    /// completed line (without its newline) to `lines`. Empty lines are
    /// skipped.
    ///
    /// # Errors
    ///
    /// [`LineError::Oversized`] when the unterminated remainder crosses the
    /// ceiling; the caller must drop the connection. I/O errors other than
    /// `WouldBlock`/`Interrupted` are passed through.
    pub fn fill_from(
        &mut self,
        stream: &mut impl Read,
        lines: &mut Vec<String>,
    ) -> Result<FillOutcome, LineError> {
        let mut chunk = [0u8; 64 * 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    self.extract_into(lines)?;
                    return Ok(FillOutcome::Closed);
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    self.extract_into(lines)?;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(FillOutcome::Open),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(LineError::Io(e)),
            }
        }
    }

    fn extract_into(&mut self, lines: &mut Vec<String>) -> Result<(), LineError> {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop(); // the newline
            if !line.is_empty() {
                lines.push(String::from_utf8_lossy(&line).into_owned());
            }
        }
        if self.pending.len() > MAX_LINE_BYTES {
            return Err(LineError::Oversized);
        }
        Ok(())
    }

    /// Bytes buffered without a terminating newline yet.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Writes an entire line, retrying through short `WouldBlock` stalls.
///
/// Callers hold their connection's write lock across this call so a line
/// is never interleaved with another sender's bytes.
///
/// # Errors
///
/// [`LineError::WriteTimeout`] when the peer applies backpressure for the
/// whole `budget`; the connection should be considered dead.
pub fn write_line_all(
    stream: &mut impl Write,
    line: &[u8],
    budget: Duration,
) -> Result<(), LineError> {
    let deadline = Instant::now() + budget;
    let mut written = 0;
    while written < line.len() {
        match stream.write(&line[written..]) {
            Ok(0) => return Err(LineError::Closed),
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(LineError::WriteTimeout(budget));
                }
                std::thread::sleep(WRITE_RETRY_SLEEP);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(LineError::Io(e)),
        }
    }
    Ok(())
}

/// Connects with a bounded timeout and returns a nonblocking mio stream
/// with Nagle disabled.
pub fn connect_with_timeout(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    Ok(TcpStream::from_std(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A scripted `Read` that replays queued results.
    struct Script(Vec<io::Result<Vec<u8>>>);

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() {
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            match self.0.remove(0) {
                Ok(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Err(e) => Err(e),
            }
        }
    }

    fn chunk(s: &str) -> io::Result<Vec<u8>> {
        Ok(s.as_bytes().to_vec())
    }

    #[test]
    fn lines_split_across_reads() {
        let mut script = Script(vec![chunk("{\"a\""), chunk(":1}\n{\"b\":2}\n{\"c\"")]);
        let mut buffer = LineBuffer::new();
        let mut lines = Vec::new();

        assert_eq!(
            buffer.fill_from(&mut script, &mut lines).unwrap(),
            FillOutcome::Open
        );
        assert_eq!(lines, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
        assert_eq!(buffer.pending_len(), r#"{"c""#.len());
    }

    #[test]
    fn eof_still_delivers_completed_lines() {
        let mut script = Script(vec![chunk("last\n"), Ok(Vec::new())]);
        let mut buffer = LineBuffer::new();
        let mut lines = Vec::new();

        assert_eq!(
            buffer.fill_from(&mut script, &mut lines).unwrap(),
            FillOutcome::Closed
        );
        assert_eq!(lines, vec!["last"]);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut script = Script(vec![chunk("\n\none\n\n")]);
        let mut buffer = LineBuffer::new();
        let mut lines = Vec::new();
        buffer.fill_from(&mut script, &mut lines).unwrap();
        assert_eq!(lines, vec!["one"]);
    }

    #[test]
    fn oversized_unterminated_line_is_fatal() {
        struct Firehose;
        impl Read for Firehose {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                buf.fill(b'x');
                Ok(buf.len())
            }
        }

        let mut buffer = LineBuffer::new();
        let mut lines = Vec::new();
        let result = buffer.fill_from(&mut Firehose, &mut lines);
        assert!(matches!(result, Err(LineError::Oversized)));
        assert!(lines.is_empty());
    }

    /// A `Write` that accepts a few bytes at a time with stalls between.
    struct Dribble {
        accepted: Vec<u8>,
        stall_next: bool,
    }

    impl Write for Dribble {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if std::mem::replace(&mut self.stall_next, true) {
                self.stall_next = false;
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            let n = buf.len().min(3);
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_completes_through_partial_writes_and_stalls() {
        let mut sink = Dribble {
            accepted: Vec::new(),
            stall_next: false,
        };
        write_line_all(&mut sink, b"{\"type\":\"ping\"}\n", Duration::from_secs(1)).unwrap();
        assert_eq!(sink.accepted, b"{\"type\":\"ping\"}\n");
    }

    #[test]
    fn write_times_out_under_permanent_backpressure() {
        struct Wall;
        impl Write for Wall {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::from(ErrorKind::WouldBlock))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let result = write_line_all(&mut Wall, b"x\n", Duration::from_millis(10));
        assert!(matches!(result, Err(LineError::WriteTimeout(_))));
    }
}
