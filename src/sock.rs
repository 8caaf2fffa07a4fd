//! System socket base.

use libc::{c_int, c_ulong, sockaddr, socklen_t, SOCK_CLOEXEC, SOCK_NONBLOCK};
use std::{
    io::{Error, ErrorKind, Result},
    mem::{size_of, MaybeUninit},
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
};

/// Address that is convertible to and from a system socket address.
pub trait SysSockAddr: Sized {
    /// System socket address type.
    type SysSockAddr: Sized + 'static;

    /// Convert to system socket address.
    fn into_sys_sock_addr(self) -> Self::SysSockAddr;

    /// Convert from system socket address.
    fn try_from_sys_sock_addr(addr: Self::SysSockAddr) -> Result<Self>;
}

/// Creates a socket of the specified type and returns its file descriptor.
///
/// The socket is set to non-blocking mode.
pub fn socket(sa: c_int, ty: c_int, proto: c_int) -> Result<OwnedFd> {
    match unsafe { libc::socket(sa, ty | SOCK_NONBLOCK | SOCK_CLOEXEC, proto) } {
        -1 => Err(Error::last_os_error()),
        fd => Ok(unsafe { OwnedFd::from_raw_fd(fd) }),
    }
}

/// Binds socket to specified address.
pub fn bind<SA>(socket: &impl AsRawFd, sa: SA) -> Result<()>
where
    SA: SysSockAddr,
{
    let addr: SA::SysSockAddr = sa.into_sys_sock_addr();
    if unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const _ as *const sockaddr,
            size_of::<SA::SysSockAddr>() as socklen_t,
        )
    } == 0
    {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// Initiate a connection on a socket to the specified address.
pub fn connect<SA>(socket: &impl AsRawFd, sa: SA) -> Result<()>
where
    SA: SysSockAddr,
{
    let addr: SA::SysSockAddr = sa.into_sys_sock_addr();
    if unsafe {
        libc::connect(
            socket.as_raw_fd(),
            &addr as *const _ as *const sockaddr,
            size_of::<SA::SysSockAddr>() as socklen_t,
        )
    } == 0
    {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// Reads from socket into buffer.
pub fn read(socket: &impl AsRawFd, buf: &mut [u8]) -> Result<usize> {
    match unsafe { libc::read(socket.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len()) } {
        -1 => Err(Error::last_os_error()),
        n => Ok(n as _),
    }
}

/// Writes from buffer into socket.
pub fn write(socket: &impl AsRawFd, buf: &[u8]) -> Result<usize> {
    match unsafe { libc::write(socket.as_raw_fd(), buf.as_ptr() as *const _, buf.len()) } {
        -1 => Err(Error::last_os_error()),
        n => Ok(n as _),
    }
}

/// Shut down part of a socket.
pub fn shutdown(socket: &impl AsRawFd, how: c_int) -> Result<()> {
    if unsafe { libc::shutdown(socket.as_raw_fd(), how) } == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// Get socket option.
pub fn getsockopt<T>(socket: &impl AsRawFd, level: c_int, optname: c_int) -> Result<T> {
    let mut optval: MaybeUninit<T> = MaybeUninit::uninit();
    let mut optlen: socklen_t = size_of::<T>() as _;
    if unsafe { libc::getsockopt(socket.as_raw_fd(), level, optname, optval.as_mut_ptr() as *mut _, &mut optlen) }
        == -1
    {
        return Err(Error::last_os_error());
    }
    if optlen != size_of::<T>() as _ {
        return Err(Error::new(ErrorKind::InvalidInput, "invalid size"));
    }
    Ok(unsafe { optval.assume_init() })
}

/// Set socket option.
pub fn setsockopt<T>(socket: &impl AsRawFd, level: c_int, optname: i32, optval: &T) -> Result<()> {
    let optlen: socklen_t = size_of::<T>() as _;
    if unsafe { libc::setsockopt(socket.as_raw_fd(), level, optname, optval as *const _ as *const _, optlen) }
        == -1
    {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Perform an IOCTL that reads a single value.
pub fn ioctl_read<T>(socket: &impl AsRawFd, request: c_ulong) -> Result<T> {
    let mut value: MaybeUninit<T> = MaybeUninit::uninit();
    if unsafe { libc::ioctl(socket.as_raw_fd(), request, value.as_mut_ptr()) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok(unsafe { value.assume_init() })
}

/// Perform an IOCTL whose argument is read and filled in by the kernel.
pub fn ioctl_inout<T>(socket: &impl AsRawFd, request: c_ulong, value: &mut T) -> Result<()> {
    if unsafe { libc::ioctl(socket.as_raw_fd(), request, value as *mut _) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Duplicate a file descriptor with close-on-exec set.
pub fn dup(socket: &impl AsRawFd) -> Result<OwnedFd> {
    match unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) } {
        -1 => Err(Error::last_os_error()),
        fd => Ok(unsafe { OwnedFd::from_raw_fd(fd) }),
    }
}

/// Put a file descriptor into non-blocking mode.
pub fn set_nonblocking(socket: &impl AsRawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_GETFL) };
    if flags == -1 {
        return Err(Error::last_os_error());
    }
    if unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok(())
}
