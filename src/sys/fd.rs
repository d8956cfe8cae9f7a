use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

/// Owned file descriptor; closes on drop.
#[derive(Debug)]
pub struct FileDesc(File);

impl FileDesc {
    pub unsafe fn new(fd: RawFd) -> Self {
        FileDesc(File::from_raw_fd(fd))
    }

    pub fn set_cloexec(&self) -> io::Result<()> {
        let flags = syscall!(fcntl(self.as_raw_fd(), libc::F_GETFD))?;
        syscall!(fcntl(self.as_raw_fd(), libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
        Ok(())
    }

    pub fn set_nonblocking(&self) -> io::Result<()> {
        let flags = syscall!(fcntl(self.as_raw_fd(), libc::F_GETFL))?;
        syscall!(fcntl(self.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK))?;
        Ok(())
    }
}

impl FromRawFd for FileDesc {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        FileDesc(File::from_raw_fd(fd))
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl IntoRawFd for FileDesc {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}
