use std::cmp;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use indexmap::IndexMap;
use libc::{self, c_int};
use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, POLLPRI};

use crate::ready::Ready;

/// Readiness selector backed by poll(2), for Unixes without epoll.
///
/// The interest table lives in user space and the pollfd array is rebuilt
/// on every wait. Same observable surface as the epoll selector.
pub struct Selector {
    interests: IndexMap<RawFd, Ready>,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        Ok(Selector {
            interests: IndexMap::new(),
        })
    }

    pub fn wait(&mut self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        evts.events.clear();

        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        let mut fds: Vec<libc::pollfd> = self
            .interests
            .iter()
            .map(|(&fd, &interest)| libc::pollfd {
                fd,
                events: ready_to_poll(interest),
                revents: 0,
            })
            .collect();

        let cnt = syscall!(poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout))?;

        if cnt == 0 {
            return Ok(());
        }

        for pollfd in &fds {
            let kind = poll_to_ready(pollfd.revents);
            if !kind.is_empty() {
                evts.events.push((pollfd.fd, kind));
            }
        }

        Ok(())
    }

    pub fn add(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        self.interests.insert(fd, interest);
        Ok(())
    }

    pub fn modify(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        self.interests.insert(fd, interest);
        Ok(())
    }

    pub fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        self.interests.swap_remove(&fd);
        Ok(())
    }
}

// POLLERR, POLLHUP and POLLNVAL are always reported; only read and write
// interest is opt-in, as with epoll.
fn ready_to_poll(interest: Ready) -> libc::c_short {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= POLLIN;
    }

    if interest.is_writable() {
        kind |= POLLOUT;
    }

    kind
}

fn poll_to_ready(revents: libc::c_short) -> Ready {
    let revents = revents as c_int;
    let mut kind = Ready::empty();

    if (revents & POLLIN as c_int) != 0 || (revents & POLLPRI as c_int) != 0 {
        kind = kind | Ready::readable();
    }

    if (revents & POLLOUT as c_int) != 0 {
        kind = kind | Ready::writable();
    }

    if (revents & POLLERR as c_int) != 0
        || (revents & POLLHUP as c_int) != 0
        || (revents & POLLNVAL as c_int) != 0
    {
        kind = kind | Ready::error();
    }

    kind
}

pub struct Events {
    events: Vec<(RawFd, Ready)>,
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
        self.events.get(idx).copied()
    }
}
