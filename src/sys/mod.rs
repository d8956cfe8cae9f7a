macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

// Best backend available at build time: epoll where the kernel has it,
// poll(2) on the remaining Unixes. Both expose the same Selector/Events
// surface and the same normalized readiness masks.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use self::epoll::{Events, Selector};

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
mod poll;

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
pub use self::poll::{Events, Selector};

mod fd;
mod socket;

pub use self::socket::Socket;
