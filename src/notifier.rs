//! A bidirectional, kernel-backed counting wake-up primitive.
//!
//! Backed by Linux `eventfd(2)`. A single descriptor serves both as the
//! thing registered with the I/O loop for readability and as the thing
//! handed to other peers so they can wake this one up — `ivshmem-server`
//! conflates "read fd" and "write fd" into one kernel object, and this type
//! preserves that rather than splitting them.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::{HubError, HubResult};

/// An eventfd-backed wake-up object with counter semantics.
///
/// `signal()` increments the kernel counter and makes the fd readable;
/// `drain()` atomically reads and resets the counter. Non-blocking: callers
/// get `WouldBlock`/`None` rather than stalling the single-threaded reactor.
#[derive(Debug)]
pub struct Notifier {
    fd: RawFd,
}

/// Outcome of a non-blocking `signal()` call.
#[derive(Debug, PartialEq, Eq)]
pub enum SignalResult {
    Ok,
    WouldBlock,
}

impl Notifier {
    /// Create a fresh eventfd in non-blocking, close-on-exec mode.
    pub fn create() -> HubResult<Notifier> {
        let fd = loop {
            let ret = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
            if ret >= 0 {
                break ret;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(HubError::resource_exhaustion("eventfd", err));
        };

        Ok(Notifier { fd })
    }

    /// Write `n` (`n > 0`) to the counter, waking any readers.
    pub fn signal(&self, n: u64) -> HubResult<SignalResult> {
        assert!(n > 0, "eventfd signal value must be positive");
        let buf = n.to_ne_bytes();

        loop {
            let ret = unsafe { libc::write(self.fd, buf.as_ptr() as *const _, buf.len()) };
            if ret == buf.len() as isize {
                return Ok(SignalResult::Ok);
            }
            if ret >= 0 {
                // eventfd guarantees an all-or-nothing 8-byte write; a
                // partial write here would mean the kernel interface changed
                // underneath us.
                return Err(HubError::transport(None, io::Error::new(
                    io::ErrorKind::Other,
                    "short write to eventfd",
                )));
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(SignalResult::WouldBlock),
                _ => return Err(HubError::transport(None, err)),
            }
        }
    }

    /// Drain the accumulated counter value, or `None` if nothing is pending.
    pub fn drain(&self) -> HubResult<Option<u64>> {
        let mut buf = [0u8; 8];

        loop {
            let ret = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if ret == buf.len() as isize {
                return Ok(Some(u64::from_ne_bytes(buf)));
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(HubError::transport(None, err)),
            }
        }
    }

    /// The descriptor to register with the I/O loop for readability.
    pub fn readable_fd(&self) -> RawFd {
        self.fd
    }

    /// The descriptor to pass to other peers so they can signal this one.
    ///
    /// Equal to `readable_fd()`: this design never splits the read and
    /// write roles of the underlying eventfd.
    pub fn transmittable_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_then_drain_yields_accumulated_value() {
        let n = Notifier::create().unwrap();
        assert_eq!(n.drain().unwrap(), None);

        assert_eq!(n.signal(1).unwrap(), SignalResult::Ok);
        assert_eq!(n.signal(2).unwrap(), SignalResult::Ok);
        assert_eq!(n.drain().unwrap(), Some(3));

        // Draining again without an intervening signal yields nothing.
        assert_eq!(n.drain().unwrap(), None);
    }

    #[test]
    fn readable_and_transmittable_fd_are_identical() {
        let n = Notifier::create().unwrap();
        assert_eq!(n.readable_fd(), n.transmittable_fd());
    }
}
