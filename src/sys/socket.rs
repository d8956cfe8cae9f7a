use std::io;
use std::mem;
use std::net::{self, SocketAddr};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use libc::{self, c_int};

use super::fd::FileDesc;

/// A raw non-blocking stream socket, used for connect(2) with
/// `EINPROGRESS` before the descriptor is handed over as a
/// `std::net::TcpStream`.
pub struct Socket(FileDesc);

impl Socket {
    /// Creates a non-blocking TCP socket for the address family of
    /// `addr`.
    pub fn stream(addr: &SocketAddr) -> io::Result<Socket> {
        let fam = match *addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };

        let fd = syscall!(socket(fam, libc::SOCK_STREAM, 0))?;
        let fd = unsafe { FileDesc::new(fd) };
        fd.set_cloexec()?;
        fd.set_nonblocking()?;

        Ok(Socket(fd))
    }

    /// Starts connecting to `addr`. On a non-blocking socket this
    /// normally fails with `EINPROGRESS`; wait for writability and then
    /// check [`take_error`](Socket::take_error).
    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = addr_to_sockaddr(addr);

        syscall!(connect(
            self.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len
        ))?;

        Ok(())
    }

    /// Reads and clears the pending socket error, if any.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut errno: c_int = 0;
        let mut len = mem::size_of::<c_int>() as libc::socklen_t;

        syscall!(getsockopt(
            self.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut errno as *mut _ as *mut _,
            &mut len
        ))?;

        if errno == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(errno)))
        }
    }

    /// Hands the descriptor over as a standard TCP stream. The socket
    /// stays non-blocking.
    pub fn into_tcp_stream(self) -> net::TcpStream {
        unsafe { net::TcpStream::from_raw_fd(self.0.into_raw_fd()) }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

fn addr_to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    match *addr {
        SocketAddr::V4(addr) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(addr.ip().octets()),
                },
                ..unsafe { mem::zeroed() }
            };

            unsafe {
                *(&mut storage as *mut _ as *mut libc::sockaddr_in) = sin;
            }

            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(addr) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_flowinfo: addr.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_scope_id: addr.scope_id(),
            };

            unsafe {
                *(&mut storage as *mut _ as *mut libc::sockaddr_in6) = sin6;
            }

            (
                storage,
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}
