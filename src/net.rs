use std::io;
use std::net::{self, SocketAddr, ToSocketAddrs};
use std::os::unix::io::AsRawFd;

use crate::error::Error;
use crate::ready::Ready;
use crate::sys::Socket;
use crate::task::{BoxTask, Resume, Step, Suspension, Task};

/// Binds a non-blocking listener on `addr`.
pub fn listen<A: ToSocketAddrs>(addr: A) -> io::Result<net::TcpListener> {
    let listener = net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;

    Ok(listener)
}

/// Task that opens a TCP connection without blocking the loop.
///
/// Issues a non-blocking connect, waits for writability, then checks the
/// socket error. Its terminal value is the connected, non-blocking
/// `std::net::TcpStream`.
pub struct Connect {
    addr: SocketAddr,
    sock: Option<Socket>,
}

impl Connect {
    pub fn new(addr: SocketAddr) -> Connect {
        Connect { addr, sock: None }
    }
}

impl Task for Connect {
    fn resume(&mut self, input: Resume) -> Step {
        if let Resume::Err(err) = input {
            return Step::Failed(err);
        }

        match self.sock.take() {
            None => {
                let sock = match Socket::stream(&self.addr) {
                    Ok(sock) => sock,
                    Err(err) => return Step::Failed(Error::Io(err)),
                };

                match sock.connect(&self.addr) {
                    Ok(()) => Step::value(sock.into_tcp_stream()),
                    Err(ref err) if in_progress(err) => {
                        let fd = sock.as_raw_fd();
                        self.sock = Some(sock);
                        Step::io_wait(fd, Ready::writable() | Ready::error())
                    }
                    Err(err) => Step::Failed(Error::Io(err)),
                }
            }
            Some(sock) => match sock.take_error() {
                Ok(None) => Step::value(sock.into_tcp_stream()),
                Ok(Some(err)) => Step::Failed(Error::Io(err)),
                Err(err) => Step::Failed(Error::Io(err)),
            },
        }
    }
}

fn in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS)
        || err.kind() == io::ErrorKind::WouldBlock
}

/// Accept-loop task: waits for the listener to become readable, accepts
/// one connection per wake, and spawns a detached handler task for it.
///
/// Runs until the listener fails; an accept error other than would-block
/// fails the task.
pub struct Serve<F> {
    listener: net::TcpListener,
    handler: F,
}

impl<F> Serve<F>
where
    F: FnMut(net::TcpStream, SocketAddr) -> BoxTask,
{
    /// Serves connections from `listener` (see [`listen`]), handing each
    /// to a task built by `handler`.
    pub fn new(listener: net::TcpListener, handler: F) -> Serve<F> {
        Serve { listener, handler }
    }
}

impl<F> Task for Serve<F>
where
    F: FnMut(net::TcpStream, SocketAddr) -> BoxTask,
{
    fn resume(&mut self, input: Resume) -> Step {
        match input {
            Resume::Err(err) => Step::Failed(err),
            Resume::Io(_) => match self.listener.accept() {
                Ok((sock, addr)) => {
                    if let Err(err) = sock.set_nonblocking(true) {
                        return Step::Failed(Error::Io(err));
                    }
                    Step::Pending(Suspension::Spawn((self.handler)(sock, addr)))
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Step::io_wait(
                    self.listener.as_raw_fd(),
                    Ready::readable() | Ready::error(),
                ),
                Err(err) => Step::Failed(Error::Io(err)),
            },
            _ => Step::io_wait(
                self.listener.as_raw_fd(),
                Ready::readable() | Ready::error(),
            ),
        }
    }
}
