use std::io;
use std::os::fd::RawFd;

/// Corking batches the handshake packets; the proxy uncorks once the
/// handshake is done.
#[cfg(target_os = "linux")]
pub fn set_tcp_cork(fd: RawFd, enabled: bool) -> io::Result<()> {
    let value: libc::c_int = enabled.into();
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_tcp_cork(_fd: RawFd, _enabled: bool) -> io::Result<()> {
    Ok(())
}
