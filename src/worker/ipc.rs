//! Line-based pipe I/O for the worker side of the control channel.
//!
//! A worker writes [`ControlMessage`](super::protocol::ControlMessage) lines
//! to fd 1 and watches fd 0 for EOF, which is how the supervisor
//! disconnects it. Reads and writes retry on EINTR.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Buffer size for control channel I/O. Messages are small.
const BUFFER_SIZE: usize = 8 * 1024;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// A duplicate of the worker's standard input, where supervisor EOF
    /// arrives. Dropping it leaves fd 0 open.
    pub(crate) fn stdin() -> io::Result<Self> {
        io::stdin().as_fd().try_clone_to_owned().map(Self::new)
    }

    /// A duplicate of the worker's standard output, which carries control
    /// messages. Dropping it leaves fd 1 open.
    pub(crate) fn stdout() -> io::Result<Self> {
        io::stdout().as_fd().try_clone_to_owned().map(Self::new)
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

/// Buffered line reader.
pub struct LineReader {
    reader: BufReader<PipeFd>,
    line_buffer: String,
}

impl LineReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(BUFFER_SIZE, fd),
            line_buffer: String::with_capacity(256),
        }
    }

    /// Read a line without its terminator. Returns `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line_buffer.clear();
        if self.reader.read_line(&mut self.line_buffer)? == 0 {
            return Ok(None);
        }
        let trimmed = self.line_buffer.trim_end_matches(['\n', '\r']).len();
        self.line_buffer.truncate(trimmed);
        Ok(Some(&self.line_buffer))
    }

    /// Block until the writing side is closed, discarding any input.
    pub fn wait_for_eof(&mut self) -> io::Result<()> {
        while self.read_line()?.is_some() {}
        Ok(())
    }
}

/// Buffered line writer. Every line is flushed immediately.
pub struct LineWriter {
    writer: BufWriter<PipeFd>,
}

impl LineWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(BUFFER_SIZE, fd),
        }
    }

    /// Write a line (appends newline if not present) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }
}

/// Create a connected `(read, write)` pipe pair.
#[cfg(test)]
pub(crate) fn pipe() -> (PipeFd, PipeFd) {
    let (read_fd, write_fd) = nix::unistd::pipe().expect("Failed to create pipe");
    (PipeFd::new(read_fd), PipeFd::new(write_fd))
}
