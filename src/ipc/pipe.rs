//! Newline-delimited frame I/O over pipes.
//!
//! Each frame is one line of JSON. Reads and writes retry on EINTR so a
//! signal delivered to the worker never tears a frame.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Buffer size for frame I/O (64KB).
const FRAME_BUFFER_SIZE: usize = 64 * 1024;

/// Frames above this size are rejected by the reader.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: impl Into<OwnedFd>) -> Self {
        Self { fd: fd.into() }
    }

    /// Duplicate stdin (fd 0) for the worker side of the channel.
    pub fn stdin() -> io::Result<Self> {
        Ok(Self::new(io::stdin().as_fd().try_clone_to_owned()?))
    }

    /// Duplicate stdout (fd 1) for the worker side of the channel.
    pub fn stdout() -> io::Result<Self> {
        Ok(Self::new(io::stdout().as_fd().try_clone_to_owned()?))
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads newline-terminated frames.
pub struct FrameReader<R: Read = PipeFd> {
    reader: BufReader<R>,
    buffer: String,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(FRAME_BUFFER_SIZE, inner),
            buffer: String::with_capacity(4096),
        }
    }

    /// Read one frame without its line terminator. Returns `None` on EOF.
    pub fn read_frame(&mut self) -> io::Result<Option<&str>> {
        self.buffer.clear();
        let n = (&mut self.reader)
            .take(MAX_FRAME_SIZE as u64 + 1)
            .read_line(&mut self.buffer)?;
        if n == 0 {
            return Ok(None);
        }
        if n > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {} bytes", MAX_FRAME_SIZE),
            ));
        }
        if self.buffer.ends_with('\n') {
            self.buffer.pop();
        }
        if self.buffer.ends_with('\r') {
            self.buffer.pop();
        }
        Ok(Some(&self.buffer))
    }
}

/// Writes newline-terminated frames, flushing after each one.
pub struct FrameWriter<W: Write = PipeFd> {
    writer: BufWriter<W>,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(FRAME_BUFFER_SIZE, inner),
        }
    }

    pub fn write_frame(&mut self, frame: &str) -> io::Result<()> {
        debug_assert!(!frame.contains('\n'), "frames are single lines");
        self.writer.write_all(frame.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}
