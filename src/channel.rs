//! The framed descriptor channel: exactly 8 bytes of payload plus zero or
//! one ancillary file descriptor, sent over a UNIX stream socket with
//! `sendmsg(2)`/`recvmsg(2)`.
//!
//! The payload-and-fd pair is delivered atomically by the kernel as one
//! message, so callers never observe the payload without its fd (or vice
//! versa) — `send`/`recv` here are the only place that boundary is crossed.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::ptr;

use crate::error::{HubError, HubResult};

/// A payload of `-1` with an attached fd: "here is a file descriptor for
/// you", not bound to any particular id.
pub const FD_CARRIER: i64 = -1;

/// Send one frame: an 8-byte little-endian signed payload, plus an optional
/// ancillary file descriptor.
pub fn send(socket: &UnixStream, value: i64, fd: Option<RawFd>) -> HubResult<()> {
    let payload = value.to_le_bytes();
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut cmsg_space = [0u8; cmsg_space_len()];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(fd) = fd {
        msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space.len();

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as usize;
            ptr::write(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
        }
    }

    let sent = loop {
        let ret = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, 0) };
        if ret >= 0 {
            break ret as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(HubError::transport(None, err));
    };

    if sent != payload.len() {
        return Err(HubError::transport(
            None,
            io::Error::new(io::ErrorKind::WriteZero, "short write of frame payload"),
        ));
    }

    Ok(())
}

/// Receive one frame: the 8-byte signed payload and at most one ancillary fd.
pub fn recv(socket: &UnixStream) -> HubResult<(i64, Option<RawFd>)> {
    let mut payload = [0u8; 8];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut cmsg_space = [0u8; cmsg_space_len()];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space.len();

    let received = loop {
        let ret = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
        if ret >= 0 {
            break ret as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(HubError::transport(None, err));
    };

    if received != payload.len() {
        return Err(HubError::transport(
            None,
            io::Error::new(io::ErrorKind::UnexpectedEof, "short read of frame payload"),
        ));
    }

    let mut fd = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                fd = Some(ptr::read(libc::CMSG_DATA(cmsg) as *const RawFd));
                break;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((i64::from_le_bytes(payload), fd))
}

/// `CMSG_SPACE` for a single `RawFd`, computed at compile time so the
/// ancillary buffers above can be plain stack arrays.
///
/// `libc::CMSG_SPACE` isn't a `const fn`; this reimplements its formula
/// (`CMSG_ALIGN(sizeof(cmsghdr)) + CMSG_ALIGN(len)`) for the fixed case of
/// one `RawFd`, which coincides with a single combined round-up since
/// `sizeof(cmsghdr)` is already `long`-aligned.
const fn cmsg_space_len() -> usize {
    let align = mem::align_of::<libc::cmsghdr>();
    let hdr = mem::size_of::<libc::cmsghdr>();
    let data = mem::size_of::<RawFd>();
    let unaligned = hdr + data;
    (unaligned + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn round_trips_payload_without_fd() {
        let (a, b) = UnixStream::pair().unwrap();
        send(&a, 42, None).unwrap();
        let (value, fd) = recv(&b).unwrap();
        assert_eq!(value, 42);
        assert!(fd.is_none());
    }

    #[test]
    fn round_trips_payload_with_fd() {
        let (a, b) = UnixStream::pair().unwrap();
        let (c, _d) = UnixStream::pair().unwrap();
        send(&a, FD_CARRIER, Some(c.as_raw_fd())).unwrap();
        let (value, fd) = recv(&b).unwrap();
        assert_eq!(value, FD_CARRIER);
        assert!(fd.is_some());
        unsafe {
            libc::close(fd.unwrap());
        }
    }

    #[test]
    fn negative_one_with_no_fd_is_the_abort_convention() {
        let (a, b) = UnixStream::pair().unwrap();
        send(&a, FD_CARRIER, None).unwrap();
        let (value, fd) = recv(&b).unwrap();
        assert_eq!(value, FD_CARRIER);
        assert!(fd.is_none());
    }
}
