//! Length-prefixed message framing over the process's standard streams.
//!
//! Frame format: a little-endian 32-bit unsigned byte length followed by
//! exactly that many bytes of UTF-8 JSON. This is the Native Messaging
//! wire format the browser extension speaks.

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::stat::{fstat, SFlag};

use crate::error::HostError;

const SENTINEL_LENGTH: u32 = u32::MAX;

/// Framed transport bound to a pair of readers/writers (normally
/// `stdin`/`stdout`, substituted with pipes in tests).
pub struct FramedIo<R, W> {
    input: R,
    output: W,
}

impl<R: Read + AsRawFd, W: Write> FramedIo<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Number of bytes currently readable from the input stream without
    /// blocking. Returns 0 if none are available; fails if the writer end
    /// has closed.
    pub fn peek_available(&self) -> Result<usize, HostError> {
        let fd = self.input.as_raw_fd();
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let ready = poll(&mut fds, 0).map_err(|e| HostError::Io(io::Error::from(e)))?;
        if ready == 0 {
            return Ok(0);
        }
        let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
        if revents.contains(PollFlags::POLLHUP) && !revents.contains(PollFlags::POLLIN) {
            return Err(HostError::Framing("peer closed the input stream".into()));
        }
        if revents.contains(PollFlags::POLLIN) {
            // `poll` only tells us readability, not the byte count; a
            // zero-length `read` indicating EOF is handled by the caller.
            Ok(1)
        } else {
            Ok(0)
        }
    }

    /// Blocking read of one framed message. Fails on EOF, a zero length,
    /// the sentinel length `0xFFFFFFFF`, or the peer closing before the
    /// full payload arrives.
    pub fn read_message(&mut self) -> Result<Vec<u8>, HostError> {
        let length = self.read_length()?;
        if length == 0 {
            return Err(HostError::Framing("zero-length frame".into()));
        }
        if length == SENTINEL_LENGTH {
            return Err(HostError::Framing("sentinel length rejected".into()));
        }
        let mut buf = vec![0u8; length as usize];
        self.input
            .read_exact(&mut buf)
            .map_err(|e| HostError::Framing(format!("short read of framed payload: {e}")))?;
        Ok(buf)
    }

    fn read_length(&mut self) -> Result<u32, HostError> {
        // Some senders flush the 4-byte length separately from the
        // payload; `read_exact`-based reads below already block until the
        // full 4 bytes arrive, so no extra polling is needed here.
        match self.input.read_u32::<LittleEndian>() {
            Ok(len) => Ok(len),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(HostError::Framing("stdin closed".into()))
            }
            Err(e) => Err(HostError::Io(e)),
        }
    }

    /// Write one framed message: length prefix, payload, then flush. This
    /// is the sole write path, so output is never interleaved.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<(), HostError> {
        self.output.write_u32::<LittleEndian>(payload.len() as u32)?;
        self.output.write_all(payload)?;
        self.output.flush()?;
        Ok(())
    }
}

/// Validate that both standard streams are pipes, not consoles or files.
/// The browser always spawns this process with pipes; anything else
/// means it was launched incorrectly.
pub fn validate_streams<R: AsRawFd, W: AsRawFd>(input: &R, output: &W) -> Result<(), HostError> {
    validate_is_pipe(input.as_raw_fd(), "standard input")?;
    validate_is_pipe(output.as_raw_fd(), "standard output")?;
    Ok(())
}

fn validate_is_pipe(fd: std::os::unix::io::RawFd, label: &str) -> Result<(), HostError> {
    let status = fstat(fd).map_err(|e| HostError::Io(io::Error::from(e)))?;
    let mode = SFlag::from_bits_truncate(status.st_mode);
    if !mode.contains(SFlag::S_IFIFO) {
        return Err(HostError::StartupValidation(format!(
            "expected {label} to be a pipe"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn reads_framed_message() {
        let data = frame(b"{\"i\":\"Q1\"}");
        let mut io = FramedIo::new(FakeCursorReader(Cursor::new(data)), Vec::new());
        let msg = io.read_message().unwrap();
        assert_eq!(msg, b"{\"i\":\"Q1\"}");
    }

    #[test]
    fn rejects_zero_length() {
        let data = frame(b"");
        let mut io = FramedIo::new(FakeCursorReader(Cursor::new(data)), Vec::new());
        assert!(io.read_message().is_err());
    }

    #[test]
    fn writes_length_prefixed_payload() {
        let mut out = Vec::new();
        {
            let mut io = FramedIo::new(FakeCursorReader(Cursor::new(Vec::new())), &mut out);
            io.write_message(b"{}").unwrap();
        }
        assert_eq!(&out[0..4], &2u32.to_le_bytes());
        assert_eq!(&out[4..], b"{}");
    }

    struct FakeCursorReader(Cursor<Vec<u8>>);
    impl AsRawFd for FakeCursorReader {
        fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
            0
        }
    }
    impl Read for FakeCursorReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }
}
