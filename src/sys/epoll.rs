use std::cmp;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use libc::{self, c_int};
use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI};

use crate::ready::Ready;

/// Readiness selector backed by epoll, level-triggered.
///
/// The registered descriptor itself rides in the `u64` slot of each epoll
/// event, so waking needs no token table.
pub struct Selector {
    epfd: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        Ok(Selector { epfd })
    }

    pub fn wait(&mut self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        let cnt = syscall!(epoll_wait(
            self.epfd,
            evts.events.as_mut_ptr(),
            evts.events.capacity() as i32,
            timeout
        ))?;

        unsafe { evts.events.set_len(cnt as usize) };

        Ok(())
    }

    pub fn add(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ready_to_epoll(interest),
            u64: fd as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;

        Ok(())
    }

    pub fn modify(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ready_to_epoll(interest),
            u64: fd as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;

        Ok(())
    }

    pub fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;

        Ok(())
    }
}

// Error and hang-up conditions are always reported by epoll; only read
// and write interest is opt-in.
fn ready_to_epoll(interest: Ready) -> u32 {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= EPOLLIN;
    }

    if interest.is_writable() {
        kind |= EPOLLOUT;
    }

    kind as u32
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

pub struct Events {
    events: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(u: usize) -> Events {
        Events {
            events: Vec::with_capacity(u),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.events.clear();
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<(RawFd, Ready)> {
        self.events.get(idx).map(|event| {
            let epoll = event.events as c_int;
            let mut kind = Ready::empty();

            if (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0 {
                kind = kind | Ready::readable();
            }

            if (epoll & EPOLLOUT) != 0 {
                kind = kind | Ready::writable();
            }

            // EPOLLHUP usually means a socket error happened.
            if (epoll & EPOLLERR) != 0 || (epoll & EPOLLHUP) != 0 {
                kind = kind | Ready::error();
            }

            (event.u64 as RawFd, kind)
        })
    }
}
