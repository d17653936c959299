//! The shared mailbox region: a fixed-layout POSIX shared-memory object
//! with one slot per peer id.
//!
//! Slot 0 stores global parameters (`slot_count`, `slot_size`) and is never
//! a peer mailbox. Slot `i` (`i >= 1`) is conventionally written only by
//! peer `i` and read by whoever was woken by that peer's notifier — the
//! notifier drain is what gives the reader a happens-before edge over the
//! write, the same discipline `bearcove-rapace`'s hub mapping relies on for
//! its shared extents.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;

use crate::error::{HubError, HubResult};
use crate::peer::PeerId;

/// Bytes reserved for a slot's node-name field.
pub const NODE_NAME_LEN: usize = 32;
/// Bytes reserved for a slot's message-length field.
const LEN_FIELD_LEN: usize = 4;
/// Total size of one mailbox slot. Chosen generously for typical control
/// and ping/pong-sized payloads; large messages are truncated (`fill`).
pub const SLOT_SIZE: usize = 4096;
/// Usable payload bytes per slot after the name and length fields.
pub const PAYLOAD_LEN: usize = SLOT_SIZE - NODE_NAME_LEN - LEN_FIELD_LEN;

/// A mapped, fixed-layout shared-memory mailbox.
///
/// `Send + Sync`: all access goes through raw pointer arithmetic over the
/// mapping rather than Rust references, and the single-writer /
/// read-after-notifier discipline documented on `fill`/`retrieve` is what
/// makes concurrent access from multiple processes (and multiple threads
/// within this one, though the server is single-threaded) safe in practice.
pub struct Mailbox {
    shm_fd: RawFd,
    base_addr: *mut u8,
    mapped_len: usize,
    slot_count: usize,
}

unsafe impl Send for Mailbox {}
unsafe impl Sync for Mailbox {}

impl Mailbox {
    /// Create (or re-open) the shared-memory object, size it to
    /// `slot_count * SLOT_SIZE`, zero-fill every peer slot, and initialize
    /// slot 0's globals. Peer slots are cleared on every call, including a
    /// reopen of an already-sized, persisted object, so a restarted server
    /// never hands a peer another peer's stale message.
    pub fn open_or_create(name: &str, slot_count: usize) -> HubResult<Mailbox> {
        let shm_name = if name.starts_with('/') {
            name.to_owned()
        } else {
            format!("/{name}")
        };
        let c_name = CString::new(shm_name).expect("mailbox name must not contain NUL");

        let shm_fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o666) };
        if shm_fd < 0 {
            return Err(HubError::fatal("shm_open", io::Error::last_os_error()));
        }

        let mapped_len = slot_count * SLOT_SIZE;
        if unsafe { libc::ftruncate(shm_fd, mapped_len as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(shm_fd);
            }
            return Err(HubError::fatal("ftruncate", err));
        }

        let base_addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                shm_fd,
                0,
            )
        };
        if base_addr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(shm_fd);
            }
            return Err(HubError::fatal("mmap", err));
        }

        let mailbox = Mailbox {
            shm_fd,
            base_addr: base_addr as *mut u8,
            mapped_len,
            slot_count,
        };

        mailbox.zero_peer_slots();
        mailbox.init_globals_slot();
        Ok(mailbox)
    }

    /// Zero every peer slot (`1..slot_count`), clearing whatever a previous
    /// server instance left behind. Runs on every `open_or_create`, not just
    /// first creation, so a restart against a persisted shm object never
    /// hands a peer another peer's stale message.
    fn zero_peer_slots(&self) {
        for index in 1..self.slot_count {
            unsafe {
                std::ptr::write_bytes(self.slot_ptr(index), 0, SLOT_SIZE);
            }
        }
    }

    fn init_globals_slot(&self) {
        let slot = self.slot_ptr(0);
        unsafe {
            std::ptr::write_bytes(slot, 0, SLOT_SIZE);
            std::ptr::copy_nonoverlapping(
                (self.slot_count as u32).to_le_bytes().as_ptr(),
                slot,
                4,
            );
            std::ptr::copy_nonoverlapping(
                (SLOT_SIZE as u32).to_le_bytes().as_ptr(),
                slot.add(4),
                4,
            );
        }
    }

    /// The descriptor to hand to peers so they can `mmap` the region.
    pub fn fd(&self) -> RawFd {
        self.shm_fd
    }

    fn slot_ptr(&self, index: usize) -> *mut u8 {
        assert!(index < self.slot_count, "mailbox slot index out of range");
        unsafe { self.base_addr.add(index * SLOT_SIZE) }
    }

    /// Atomically write `sender`'s node-name and payload into its slot.
    /// Messages longer than the slot's payload capacity are truncated; the
    /// call still succeeds (the caller should log the `Truncation` this
    /// returns as a side note, not treat it as failure).
    pub fn fill(&self, sender: PeerId, node_name: &str, message: &[u8]) -> HubResult<()> {
        let slot = self.slot_ptr(sender.as_index());

        let mut name_buf = [0u8; NODE_NAME_LEN];
        let name_bytes = node_name.as_bytes();
        let name_copy_len = name_bytes.len().min(NODE_NAME_LEN);
        name_buf[..name_copy_len].copy_from_slice(&name_bytes[..name_copy_len]);

        let truncated = message.len() > PAYLOAD_LEN;
        let copy_len = message.len().min(PAYLOAD_LEN);

        unsafe {
            std::ptr::copy_nonoverlapping(name_buf.as_ptr(), slot, NODE_NAME_LEN);
            std::ptr::copy_nonoverlapping(
                (copy_len as u32).to_le_bytes().as_ptr(),
                slot.add(NODE_NAME_LEN),
                LEN_FIELD_LEN,
            );
            std::ptr::copy_nonoverlapping(
                message.as_ptr(),
                slot.add(NODE_NAME_LEN + LEN_FIELD_LEN),
                copy_len,
            );
        }

        if truncated {
            return Err(HubError::Truncation {
                slot: sender.0 as u32,
                given: message.len(),
                allowed: PAYLOAD_LEN,
            });
        }

        Ok(())
    }

    /// Read a slot's current contents: the node name and the message bytes.
    pub fn retrieve(&self, sender: PeerId) -> (String, Vec<u8>) {
        let slot = self.slot_ptr(sender.as_index());

        let mut name_buf = [0u8; NODE_NAME_LEN];
        let mut len_buf = [0u8; LEN_FIELD_LEN];
        unsafe {
            std::ptr::copy_nonoverlapping(slot, name_buf.as_mut_ptr(), NODE_NAME_LEN);
            std::ptr::copy_nonoverlapping(
                slot.add(NODE_NAME_LEN),
                len_buf.as_mut_ptr(),
                LEN_FIELD_LEN,
            );
        }

        let name_end = name_buf.iter().position(|&b| b == 0).unwrap_or(NODE_NAME_LEN);
        let name = String::from_utf8_lossy(&name_buf[..name_end]).into_owned();

        let len = (u32::from_le_bytes(len_buf) as usize).min(PAYLOAD_LEN);
        let mut message = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(
                slot.add(NODE_NAME_LEN + LEN_FIELD_LEN),
                message.as_mut_ptr(),
                len,
            );
        }

        (name, message)
    }

    /// Zero a peer's slot, used on disconnect (unless the peer is pending
    /// recycling).
    pub fn clear_slot(&self, id: PeerId) {
        let slot = self.slot_ptr(id.as_index());
        unsafe {
            std::ptr::write_bytes(slot, 0, SLOT_SIZE);
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base_addr as *mut libc::c_void, self.mapped_len);
            libc::close(self.shm_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/famez-hub-test-{tag}-{}", std::process::id())
    }

    #[test]
    fn fill_then_retrieve_round_trips() {
        let name = unique_name("roundtrip");
        let mailbox = Mailbox::open_or_create(&name, 4).unwrap();

        mailbox.fill(PeerId(1), "vm-a", b"hello").unwrap();
        let (node_name, message) = mailbox.retrieve(PeerId(1));
        assert_eq!(node_name, "vm-a");
        assert_eq!(message, b"hello");

        unsafe {
            libc::shm_unlink(CString::new(name).unwrap().as_ptr());
        }
    }

    #[test]
    fn oversized_message_is_truncated_not_failed() {
        let name = unique_name("truncate");
        let mailbox = Mailbox::open_or_create(&name, 4).unwrap();

        let big = vec![b'x'; PAYLOAD_LEN + 100];
        let err = mailbox.fill(PeerId(1), "vm-a", &big).unwrap_err();
        assert!(matches!(err, HubError::Truncation { .. }));

        let (_, message) = mailbox.retrieve(PeerId(1));
        assert_eq!(message.len(), PAYLOAD_LEN);

        unsafe {
            libc::shm_unlink(CString::new(name).unwrap().as_ptr());
        }
    }

    #[test]
    fn clear_slot_zeroes_name_and_length() {
        let name = unique_name("clear");
        let mailbox = Mailbox::open_or_create(&name, 4).unwrap();

        mailbox.fill(PeerId(1), "vm-a", b"hello").unwrap();
        mailbox.clear_slot(PeerId(1));
        let (node_name, message) = mailbox.retrieve(PeerId(1));
        assert_eq!(node_name, "");
        assert!(message.is_empty());

        unsafe {
            libc::shm_unlink(CString::new(name).unwrap().as_ptr());
        }
    }

    #[test]
    fn reopening_an_existing_mailbox_clears_stale_peer_slots() {
        let name = unique_name("reopen");

        {
            let mailbox = Mailbox::open_or_create(&name, 4).unwrap();
            mailbox.fill(PeerId(1), "vm-a", b"leftover from a previous server").unwrap();
            // `mailbox` drops here (munmap), but the shm object itself persists
            // under `name` until explicitly unlinked.
        }

        let reopened = Mailbox::open_or_create(&name, 4).unwrap();
        let (node_name, message) = reopened.retrieve(PeerId(1));
        assert_eq!(node_name, "");
        assert!(message.is_empty());

        unsafe {
            libc::shm_unlink(CString::new(name).unwrap().as_ptr());
        }
    }
}
