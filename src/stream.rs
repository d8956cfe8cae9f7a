use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::mem;
use std::net;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use crate::error::Error;
use crate::ready::Ready;
use crate::task::{Resume, Step, Task};

const DEFAULT_READ_SIZE: usize = 65536;

/// A buffered byte stream over a non-blocking socket.
///
/// The stream owns its socket for its whole lifetime and accumulates
/// incoming bytes in an in-memory buffer. The read and write operations
/// are task types ([`ReadBytes`], [`ReadUntil`], [`WriteAll`]) driven
/// entirely through the suspension protocol, so they compose with the
/// scheduler like any other child task.
///
/// Operations share the stream through [`SharedStream`], the
/// single-threaded shared handle.
pub struct Stream<S> {
    sock: S,
    buffer: Vec<u8>,
    read_size: usize,
}

/// Shared handle to a stream, cloned into each pending operation.
pub type SharedStream<S> = Rc<RefCell<Stream<S>>>;

impl Stream<net::TcpStream> {
    /// Wraps a TCP stream, switching it to non-blocking mode.
    pub fn tcp(sock: net::TcpStream) -> io::Result<Stream<net::TcpStream>> {
        sock.set_nonblocking(true)?;
        Ok(Stream::new(sock))
    }
}

impl<S> Stream<S> {
    /// Wraps a socket that is already non-blocking.
    pub fn new(sock: S) -> Stream<S> {
        Stream::with_read_size(sock, DEFAULT_READ_SIZE)
    }

    pub fn with_read_size(sock: S, read_size: usize) -> Stream<S> {
        Stream {
            sock,
            buffer: Vec::new(),
            read_size,
        }
    }

    /// Moves the stream into a shared handle for use by operation tasks.
    pub fn shared(self) -> SharedStream<S> {
        Rc::new(RefCell::new(self))
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Releases the socket, dropping any buffered bytes.
    pub fn into_inner(self) -> S {
        self.sock
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        let rest = self.buffer.split_off(n);
        mem::replace(&mut self.buffer, rest)
    }

    fn find(&self, pat: &[u8]) -> Option<usize> {
        if pat.is_empty() {
            return Some(0);
        }
        if pat.len() > self.buffer.len() {
            return None;
        }
        self.buffer.windows(pat.len()).position(|window| window == pat)
    }
}

impl<S: AsRawFd> Stream<S> {
    fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

impl<S: Read> Stream<S> {
    /// One receive into the buffer. `Ok(0)` is end of stream.
    fn fill(&mut self) -> io::Result<usize> {
        let start = self.buffer.len();
        self.buffer.resize(start + self.read_size, 0);

        match self.sock.read(&mut self.buffer[start..]) {
            Ok(n) => {
                self.buffer.truncate(start + n);
                Ok(n)
            }
            Err(err) => {
                self.buffer.truncate(start);
                Err(err)
            }
        }
    }
}

/// Task that reads exactly `n` bytes from the stream.
///
/// Its terminal value is the `Vec<u8>` of the first `n` buffered bytes.
/// Fails [`Error::ConnectionClosed`] if the peer closes before `n` bytes
/// arrive.
pub fn read_bytes<S>(stream: &SharedStream<S>, n: usize) -> ReadBytes<S> {
    ReadBytes {
        stream: stream.clone(),
        n,
        state: OpState::Init,
        outcome: None,
    }
}

/// Task that reads up to and including the first occurrence of `pat`.
///
/// Its terminal value is the `Vec<u8>` through the end of the delimiter.
/// Fails [`Error::BufferLimitExceeded`] once `limit` bytes are buffered
/// without the delimiter appearing.
pub fn read_until<S>(stream: &SharedStream<S>, pat: impl Into<Vec<u8>>, limit: usize) -> ReadUntil<S> {
    ReadUntil {
        stream: stream.clone(),
        pat: pat.into(),
        limit,
        state: OpState::Init,
        outcome: None,
    }
}

/// Task that writes all of `data` to the stream.
///
/// Finishes without a value. A zero-byte send fails
/// [`Error::ConnectionClosed`].
pub fn write_all<S>(stream: &SharedStream<S>, data: impl Into<Vec<u8>>) -> WriteAll<S> {
    WriteAll {
        stream: stream.clone(),
        data: data.into(),
        written: 0,
        state: OpState::Init,
        outcome: None,
    }
}

// Every operation walks the same three states: register interest, loop on
// readiness, then drop the registration before settling so the descriptor
// never outlives the operation in the reactor.
enum OpState {
    Init,
    Waiting,
    Settle,
}

pub struct ReadBytes<S> {
    stream: SharedStream<S>,
    n: usize,
    state: OpState,
    outcome: Option<Result<Vec<u8>, Error>>,
}

impl<S: Read + AsRawFd> ReadBytes<S> {
    fn settle(&mut self, outcome: Result<Vec<u8>, Error>) -> Step {
        let fd = self.stream.borrow().fd();
        self.state = OpState::Settle;
        self.outcome = Some(outcome);
        Step::io_drop(fd)
    }
}

impl<S: Read + AsRawFd> Task for ReadBytes<S> {
    fn resume(&mut self, input: Resume) -> Step {
        if let Resume::Err(err) = input {
            return Step::Failed(err);
        }

        match self.state {
            OpState::Init => {
                let mut stream = self.stream.borrow_mut();
                if stream.buffered() >= self.n {
                    let bytes = stream.take(self.n);
                    return Step::value(bytes);
                }
                let fd = stream.fd();
                drop(stream);
                self.state = OpState::Waiting;
                Step::io_wait(fd, Ready::readable() | Ready::error())
            }
            OpState::Waiting => {
                let mut stream = self.stream.borrow_mut();
                let fd = stream.fd();
                match stream.fill() {
                    Ok(0) => {
                        drop(stream);
                        self.settle(Err(Error::ConnectionClosed))
                    }
                    Ok(_) => {
                        if stream.buffered() >= self.n {
                            let bytes = stream.take(self.n);
                            drop(stream);
                            self.settle(Ok(bytes))
                        } else {
                            Step::io_wait(fd, Ready::readable() | Ready::error())
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        Step::io_wait(fd, Ready::readable() | Ready::error())
                    }
                    Err(err) => {
                        drop(stream);
                        self.settle(Err(Error::Io(err)))
                    }
                }
            }
            OpState::Settle => match self.outcome.take() {
                Some(Ok(bytes)) => Step::value(bytes),
                Some(Err(err)) => Step::Failed(err),
                None => Step::done(),
            },
        }
    }
}

pub struct ReadUntil<S> {
    stream: SharedStream<S>,
    pat: Vec<u8>,
    limit: usize,
    state: OpState,
    outcome: Option<Result<Vec<u8>, Error>>,
}

impl<S: Read + AsRawFd> ReadUntil<S> {
    fn settle(&mut self, outcome: Result<Vec<u8>, Error>) -> Step {
        let fd = self.stream.borrow().fd();
        self.state = OpState::Settle;
        self.outcome = Some(outcome);
        Step::io_drop(fd)
    }

    // Ok(Some(bytes)) when the delimiter is buffered, Err at the limit.
    fn check(&self, stream: &mut Stream<S>) -> Result<Option<Vec<u8>>, Error> {
        if let Some(at) = stream.find(&self.pat) {
            return Ok(Some(stream.take(at + self.pat.len())));
        }
        if stream.buffered() >= self.limit {
            return Err(Error::BufferLimitExceeded);
        }
        Ok(None)
    }
}

impl<S: Read + AsRawFd> Task for ReadUntil<S> {
    fn resume(&mut self, input: Resume) -> Step {
        if let Resume::Err(err) = input {
            return Step::Failed(err);
        }

        match self.state {
            OpState::Init => {
                let mut stream = self.stream.borrow_mut();
                match self.check(&mut stream) {
                    Ok(Some(bytes)) => Step::value(bytes),
                    Err(err) => Step::Failed(err),
                    Ok(None) => {
                        let fd = stream.fd();
                        drop(stream);
                        self.state = OpState::Waiting;
                        Step::io_wait(fd, Ready::readable() | Ready::error())
                    }
                }
            }
            OpState::Waiting => {
                let mut stream = self.stream.borrow_mut();
                let fd = stream.fd();
                match stream.fill() {
                    Ok(0) => {
                        drop(stream);
                        self.settle(Err(Error::ConnectionClosed))
                    }
                    Ok(_) => match self.check(&mut stream) {
                        Ok(Some(bytes)) => {
                            drop(stream);
                            self.settle(Ok(bytes))
                        }
                        Err(err) => {
                            drop(stream);
                            self.settle(Err(err))
                        }
                        Ok(None) => Step::io_wait(fd, Ready::readable() | Ready::error()),
                    },
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        Step::io_wait(fd, Ready::readable() | Ready::error())
                    }
                    Err(err) => {
                        drop(stream);
                        self.settle(Err(Error::Io(err)))
                    }
                }
            }
            OpState::Settle => match self.outcome.take() {
                Some(Ok(bytes)) => Step::value(bytes),
                Some(Err(err)) => Step::Failed(err),
                None => Step::done(),
            },
        }
    }
}

pub struct WriteAll<S> {
    stream: SharedStream<S>,
    data: Vec<u8>,
    written: usize,
    state: OpState,
    outcome: Option<Result<(), Error>>,
}

impl<S: Write + AsRawFd> WriteAll<S> {
    fn settle(&mut self, outcome: Result<(), Error>) -> Step {
        let fd = self.stream.borrow().fd();
        self.state = OpState::Settle;
        self.outcome = Some(outcome);
        Step::io_drop(fd)
    }
}

impl<S: Write + AsRawFd> Task for WriteAll<S> {
    fn resume(&mut self, input: Resume) -> Step {
        if let Resume::Err(err) = input {
            return Step::Failed(err);
        }

        match self.state {
            OpState::Init => {
                if self.data.is_empty() {
                    return Step::done();
                }
                let fd = self.stream.borrow().fd();
                self.state = OpState::Waiting;
                Step::io_wait(fd, Ready::writable() | Ready::error())
            }
            OpState::Waiting => {
                let mut stream = self.stream.borrow_mut();
                let fd = stream.fd();
                match stream.sock.write(&self.data[self.written..]) {
                    Ok(0) => {
                        drop(stream);
                        self.settle(Err(Error::ConnectionClosed))
                    }
                    Ok(n) => {
                        self.written += n;
                        if self.written == self.data.len() {
                            drop(stream);
                            self.settle(Ok(()))
                        } else {
                            Step::io_wait(fd, Ready::writable() | Ready::error())
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        Step::io_wait(fd, Ready::writable() | Ready::error())
                    }
                    Err(err) => {
                        drop(stream);
                        self.settle(Err(Error::Io(err)))
                    }
                }
            }
            OpState::Settle => match self.outcome.take() {
                Some(Ok(())) => Step::done(),
                Some(Err(err)) => Step::Failed(err),
                None => Step::done(),
            },
        }
    }
}
